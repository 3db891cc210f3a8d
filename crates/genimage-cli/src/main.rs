use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use genimage_core::Engine;

/// Assembles disk and flash images from a declarative config.
#[derive(Debug, Parser)]
#[command(name = "genimage", version)]
struct Args {
    /// Directory child images and raw partition content are resolved against.
    #[arg(long)]
    rootpath: PathBuf,
    /// Directory the finished, non-temporary images are written to.
    #[arg(long)]
    outputpath: PathBuf,
    /// Path to the image config.
    #[arg(long)]
    config: PathBuf,
    /// Raise the log level to debug.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    match run(&args) {
        Ok(errors) if errors.is_empty() => ExitCode::SUCCESS,
        Ok(errors) => {
            for err in &errors {
                log::error!("{err}");
            }
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> anyhow::Result<Vec<genimage_core::ImageError>> {
    let engine = Engine::new(&args.rootpath, &args.outputpath);
    let errors = engine.run(&args.config)?;
    Ok(errors)
}
