//! Partition table construction for genimage disk layouts.
//!
//! This crate turns a resolved list of partition placements into the actual
//! on-disk tables: MBR, protective/hybrid MBR, GPT primary and backup, and the
//! fixed-record table of contents used by hdimage and kdimage outputs. The
//! wire structs themselves live in `genimage-common`; this crate is the
//! builder layer on top.

mod error;
/// Partition placement value type shared by every table builder.
pub mod partition;
/// MBR, protective MBR, hybrid MBR, and EBR chain construction.
pub mod mbr;
/// GPT primary/backup header and partition array construction.
pub mod gpt;
/// Table-of-contents block construction.
pub mod toc;

pub use error::PartError;
pub use partition::PartitionSpec;
