//! Disk and flash image composition: reads a declarative config describing
//! one or more images made of partitions, solves each image's layout, and
//! emits the bytes.
//!
//! The pipeline is config parser (`config`) -> model builder
//! (`config::build_images`) -> per-kind layout solver and emitter
//! (`handlers`), driven end to end by `engine::Engine`.

pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod model;
pub mod scratch;
pub mod size;
pub mod toolbox;

pub use engine::Engine;
pub use error::ImageError;
pub use model::{FlashGeometry, Image, ImageKind, Partition};
