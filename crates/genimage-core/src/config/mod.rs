//! The declarative config format: `image`/`flash` blocks containing
//! `partition` sub-blocks and a single handler-specific sub-block.
//!
//! Grounded on `genimage.py`'s hand-rolled parser; there's no crate in the
//! corpus for this exact grammar so it's tokenized and parsed by hand here,
//! the same way the upstream tool does it.

pub mod tokenizer;
pub mod tree;
pub mod builder;

pub use builder::build_images;
pub use tree::Block;
