//! Per-kind image handlers. Each one owns its own setup/layout/generate
//! logic; the shared pieces (table-type parsing, overlap checking, UUID
//! setup) live in `common`.

pub mod common;
pub mod hdimage;
pub mod kdimage;
pub mod layout;
pub mod uffs;
pub mod vfat;

use crate::error::ImageError;
use crate::model::{Image, ImageKind};
use crate::toolbox::FsToolbox;

/// Runs the handler matching `image.kind`, producing `image.outfile`.
pub fn generate(image: &Image, toolbox: &dyn FsToolbox) -> Result<(), ImageError> {
    match image.kind {
        ImageKind::HdImage => hdimage::generate(image),
        ImageKind::KdImage => kdimage::generate(image),
        ImageKind::Vfat => vfat::generate(image, toolbox),
        ImageKind::Uffs => uffs::generate(image, toolbox),
    }
}
