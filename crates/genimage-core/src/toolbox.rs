//! Abstraction over the external tools the vfat and uffs handlers shell
//! out to (`mkdosfs`, `mmd`, `mcopy`, `mkuffs`).
//!
//! Grounded on the upstream tool's `get_tool_path`/`run_command` free
//! functions in `common.py`, turned into a trait so tests can substitute a
//! fake toolbox instead of requiring these binaries to be installed.

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Command;

use crate::error::ImageError;

pub trait FsToolbox {
    /// Resolves a tool name to the binary that should be run, searching
    /// `PATH` plus any genimage-specific override directories.
    fn find(&self, tool: &str) -> Option<PathBuf>;

    /// Runs a tool to completion, failing if it isn't found on `PATH` or
    /// exits non-zero.
    fn run(&self, tool: &str, args: &[&OsStr]) -> Result<(), ImageError>;
}

#[derive(Debug, Default)]
pub struct SystemToolbox;

impl FsToolbox for SystemToolbox {
    fn find(&self, tool: &str) -> Option<PathBuf> {
        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(tool))
            .find(|candidate| candidate.is_file())
    }

    fn run(&self, tool: &str, args: &[&OsStr]) -> Result<(), ImageError> {
        let binary = self
            .find(tool)
            .ok_or_else(|| ImageError::Unsupported(format!("required tool `{tool}` not found on PATH")))?;

        log::info!(
            "running {} {}",
            binary.display(),
            args.iter().map(|a| a.to_string_lossy()).collect::<Vec<_>>().join(" ")
        );

        let status = Command::new(&binary)
            .args(args)
            .status()
            .map_err(|e| ImageError::io(&binary, e))?;

        if !status.success() {
            return Err(ImageError::Internal(format!(
                "{tool} exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Test/fake toolbox that records invocations instead of running anything.
#[cfg(test)]
pub struct RecordingToolbox {
    pub calls: std::cell::RefCell<Vec<(String, Vec<String>)>>,
}

#[cfg(test)]
impl RecordingToolbox {
    pub fn new() -> Self {
        Self {
            calls: std::cell::RefCell::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl FsToolbox for RecordingToolbox {
    fn find(&self, tool: &str) -> Option<PathBuf> {
        Some(PathBuf::from(format!("/fake/bin/{tool}")))
    }

    fn run(&self, tool: &str, args: &[&OsStr]) -> Result<(), ImageError> {
        let args = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        self.calls.borrow_mut().push((tool.to_string(), args));
        Ok(())
    }
}
