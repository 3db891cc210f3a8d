//! Top-level driver: parses a config, topologically orders images by their
//! partition dependencies, and runs each image's handler in turn.
//!
//! Grounded on `genimage.py`'s `GenImageTool.run()`, with one correction:
//! the upstream source has a `TODO` admitting it never actually
//! topologically sorts images and just processes them in declaration
//! order. This does the sort for real, since a partition that embeds
//! another declared image must have that image built first.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::process::Command;

use crate::config::{build_images, tokenizer::tokenize, tree::parse};
use crate::error::ImageError;
use crate::handlers;
use crate::model::Image;
use crate::scratch::ScratchDir;
use crate::toolbox::{FsToolbox, SystemToolbox};

pub struct Engine {
    rootpath: std::path::PathBuf,
    outputpath: std::path::PathBuf,
    toolbox: Box<dyn FsToolbox>,
}

impl Engine {
    pub fn new(rootpath: impl Into<std::path::PathBuf>, outputpath: impl Into<std::path::PathBuf>) -> Self {
        Self {
            rootpath: rootpath.into(),
            outputpath: outputpath.into(),
            toolbox: Box::new(SystemToolbox),
        }
    }

    pub fn with_toolbox(mut self, toolbox: Box<dyn FsToolbox>) -> Self {
        self.toolbox = toolbox;
        self
    }

    /// Parses `config_path`, builds the image model, and runs every
    /// handler in dependency order. A failing image is fatal only for
    /// itself and continues to the next image, unless some other image
    /// depends on it, in which case the whole run aborts since that
    /// dependent could never resolve the missing output anyway.
    pub fn run(&self, config_path: &Path) -> Result<Vec<ImageError>, ImageError> {
        let source = std::fs::read_to_string(config_path)
            .map_err(|e| ImageError::io(config_path, e))?;
        let tokens = tokenize(&source)?;
        let blocks = parse(&tokens)?;

        std::fs::create_dir_all(&self.outputpath)
            .map_err(|e| ImageError::io(&self.outputpath, e))?;

        let scratch = ScratchDir::new()?;
        let images = build_images(&blocks, &self.rootpath, &self.outputpath, &scratch)?;
        let order = topological_order(&images)?;
        let has_dependents = images_with_dependents(&images);

        let by_name: BTreeMap<String, Image> =
            images.into_iter().map(|img| (img.name.clone(), img)).collect();

        let mut errors = Vec::new();
        for name in order {
            let Some(image) = by_name.get(&name) else { continue };
            if let Err(e) = self.run_one(image) {
                log::error!("image `{name}` failed: {e}");
                let is_dependency = has_dependents.contains(name.as_str());
                errors.push(e);
                if is_dependency {
                    log::error!("aborting run: `{name}` is a dependency of other images");
                    break;
                }
            }
        }

        Ok(errors)
    }

    fn run_one(&self, image: &Image) -> Result<(), ImageError> {
        if let Some(parent) = image.outfile.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ImageError::io(parent, e))?;
        }

        if let Some(cmd) = &image.exec_pre {
            run_hook(cmd, image)?;
        }

        handlers::generate(image, self.toolbox.as_ref())?;

        if let Some(cmd) = &image.exec_post {
            run_hook(cmd, image)?;
        }

        Ok(())
    }
}

fn run_hook(shell_command: &str, image: &Image) -> Result<(), ImageError> {
    log::info!("running hook for `{}`: {shell_command}", image.name);
    let status = Command::new("sh")
        .arg("-c")
        .arg(shell_command)
        .env("GENIMAGE_OUTFILE", &image.outfile)
        .status()
        .map_err(|e| ImageError::io(&image.outfile, e))?;
    if !status.success() {
        return Err(ImageError::Internal(format!(
            "hook `{shell_command}` exited with {status}"
        )));
    }
    Ok(())
}

/// Kahn's algorithm over the `image -> child image` dependency edges
/// derived from each image's partitions. Images with no declared
/// dependents run first.
fn topological_order(images: &[Image]) -> Result<Vec<String>, ImageError> {
    let names: std::collections::BTreeSet<&str> = images.iter().map(|i| i.name.as_str()).collect();

    let mut indegree: BTreeMap<&str, usize> = images.iter().map(|i| (i.name.as_str(), 0)).collect();
    let mut edges: BTreeMap<&str, Vec<&str>> = images.iter().map(|i| (i.name.as_str(), Vec::new())).collect();

    for image in images {
        for dep_name in image.dependencies.keys() {
            if names.contains(dep_name.as_str()) {
                edges.get_mut(dep_name.as_str()).unwrap().push(image.name.as_str());
                *indegree.get_mut(image.name.as_str()).unwrap() += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut order = Vec::with_capacity(images.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.to_string());
        for &next in &edges[name] {
            let deg = indegree.get_mut(next).unwrap();
            *deg -= 1;
            if *deg == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != images.len() {
        return Err(ImageError::Internal(
            "cyclic image dependency detected".into(),
        ));
    }

    Ok(order)
}

/// Names of every declared image that at least one other declared image
/// depends on, via a `partition { image = ... }` reference.
fn images_with_dependents(images: &[Image]) -> std::collections::BTreeSet<String> {
    let names: std::collections::BTreeSet<&str> = images.iter().map(|i| i.name.as_str()).collect();
    let mut out = std::collections::BTreeSet::new();
    for image in images {
        for dep_name in image.dependencies.keys() {
            if names.contains(dep_name.as_str()) {
                out.insert(dep_name.clone());
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageKind;
    use std::path::PathBuf;

    fn image(name: &str, deps: &[&str]) -> Image {
        let mut img = Image::new(name, ImageKind::HdImage, PathBuf::from(name));
        for d in deps {
            img.dependencies.insert(d.to_string(), PathBuf::from(d));
        }
        img
    }

    #[test]
    fn orders_dependencies_before_dependents() {
        let images = vec![image("disk.img", &["boot.vfat"]), image("boot.vfat", &[])];
        let order = topological_order(&images).unwrap();
        let boot_pos = order.iter().position(|n| n == "boot.vfat").unwrap();
        let disk_pos = order.iter().position(|n| n == "disk.img").unwrap();
        assert!(boot_pos < disk_pos);
    }

    #[test]
    fn detects_cycles() {
        let images = vec![image("a", &["b"]), image("b", &["a"])];
        assert!(topological_order(&images).is_err());
    }

    #[test]
    fn dependency_of_another_image_is_flagged() {
        let images = vec![image("disk.img", &["boot.vfat"]), image("boot.vfat", &[])];
        let flagged = images_with_dependents(&images);
        assert!(flagged.contains("boot.vfat"));
        assert!(!flagged.contains("disk.img"));
    }

    #[test]
    fn standalone_images_have_no_dependents() {
        let images = vec![image("a", &[]), image("b", &[])];
        assert!(images_with_dependents(&images).is_empty());
    }
}
