//! An owned scratch directory, created once when the engine starts and
//! removed when it's dropped.
//!
//! Replaces the upstream tool's reliance on the process-global temp
//! directory plus a manual `shutil.rmtree` in a `finally` block: handlers
//! here are just handed a `&ScratchDir` instead of reaching for a shared
//! global, so its lifetime is explicit and it cleans up even on an early
//! return via `?`.

use std::path::{Path, PathBuf};

use crate::error::ImageError;

pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn new() -> Result<Self, ImageError> {
        let path = std::env::temp_dir().join(format!("genimage-{}", std::process::id()));
        std::fs::create_dir_all(&path).map_err(|e| ImageError::io(&path, e))?;
        log::debug!("scratch directory: {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A scratch-relative path for a temporary child image, mirroring the
    /// upstream tool's `tmppath + os.sep + image.name` layout.
    pub fn child(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// A mountpoint directory under the scratch root, used while populating
    /// filesystem images via `mcopy`/staged directory trees.
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.path.join("mp").join(name)
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove scratch directory {}: {e}", self.path.display());
                return;
            }
        }
        log::debug!("removed scratch directory {}", self.path.display());
    }
}
