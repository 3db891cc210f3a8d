//! FAT32 boot sector structures and the post-`mkdosfs` image minimization
//! used by the vfat image handler.
//!
//! This crate doesn't build FAT filesystems itself; `mkdosfs`/`mmd`/`mcopy`
//! do that. What's here is the boot-sector/FAT-table reader needed to find
//! how much of a freshly created image is actually in use, so the handler
//! can truncate away the rest.

#[cfg(not(target_endian = "little"))]
compile_error!("This crate only supports little endian systems");

pub mod structures;
pub mod minimize;

pub use minimize::{minimize_image, MinimizeError};
pub use structures::raw::boot_sector::FatType;

