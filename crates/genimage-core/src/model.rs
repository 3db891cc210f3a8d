//! The in-memory data model built from a parsed config, before any handler
//! touches it. Grounded on the `Image`/`Partition`/`Flash_type` dataclasses
//! of the upstream Python tool, reshaped into owned Rust structs.

use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    HdImage,
    KdImage,
    Vfat,
    Uffs,
}

/// One `image { }` or `flash { }` block, fully resolved: every partition's
/// child image path has been looked up, but no offsets have been solved yet.
#[derive(Debug, Clone)]
pub struct Image {
    pub name: String,
    pub kind: ImageKind,
    /// Explicit `size =` from the config, if given.
    pub size: Option<u64>,
    /// Final output path this image is written to.
    pub outfile: PathBuf,
    /// True for images that exist only to feed a parent partition and are
    /// discarded once the parent is written.
    pub temporary: bool,
    pub mountpoint: Option<String>,
    pub exec_pre: Option<String>,
    pub exec_post: Option<String>,
    pub partitions: Vec<Partition>,
    /// Handler-specific key/value pairs from the image's single typed
    /// sub-block (`hdimage { }`, `kdimage { }`, `vfat { }`, `uffs { }`).
    pub handler_config: BTreeMap<String, String>,
    pub flash: Option<FlashGeometry>,
    /// `name -> absolute path` for every child image/file this image's
    /// partitions reference, resolved at config-build time.
    pub dependencies: BTreeMap<String, PathBuf>,
    /// Byte ranges, relative to this image's own content, that are allowed
    /// to be absent from the produced file (used by the overlap check to
    /// permit reuse of sparse regions of a child image by more than one
    /// partition).
    pub holes: Vec<(u64, u64)>,
}

impl Image {
    pub fn new(name: impl Into<String>, kind: ImageKind, outfile: PathBuf) -> Self {
        Self {
            name: name.into(),
            kind,
            size: None,
            outfile,
            temporary: false,
            mountpoint: None,
            exec_pre: None,
            exec_post: None,
            partitions: Vec::new(),
            handler_config: BTreeMap::new(),
            flash: None,
            dependencies: BTreeMap::new(),
            holes: Vec::new(),
        }
    }

    pub fn dependency_path(&self, image_name: &str) -> Option<&PathBuf> {
        self.dependencies.get(image_name)
    }
}

/// One `partition { }` sub-block, or a bookkeeping entry a handler adds to
/// its own image's partition list during layout (`[MBR]`, `[GPT header]`,
/// `[TOC]`, and similar).
#[derive(Debug, Clone, Default)]
pub struct Partition {
    pub name: String,
    pub in_partition_table: bool,
    /// Resolved absolute byte offset. Filled in by the layout solver; zero
    /// until then.
    pub offset: u64,
    /// Resolved size in bytes. Filled in by the layout solver unless given
    /// explicitly in the config.
    pub size: u64,
    pub explicit_offset: Option<u64>,
    pub explicit_size: Option<u64>,
    /// Name of the child image this partition's content comes from, if any.
    /// Bookkeeping partitions (MBR/GPT/TOC records) have none.
    pub image: Option<String>,
    pub partition_type: Option<String>,
    pub partition_type_uuid: Option<String>,
    pub partition_uuid: Option<String>,
    pub bootable: bool,
    pub read_only: bool,
    pub hidden: bool,
    pub no_automount: bool,
    pub autoresize: bool,
    pub fill: bool,
    pub logical: bool,
    pub forced_primary: bool,
    pub align: u64,
    pub erase_size: u64,
    pub flag: u64,
    pub load: bool,
    pub boot: u8,
}

impl Partition {
    pub fn bookkeeping(name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            in_partition_table: false,
            offset,
            size,
            ..Default::default()
        }
    }
}

/// NAND geometry referenced by `uffs`/`kdimage` images via `flashtype =`.
#[derive(Debug, Clone, Default)]
pub struct FlashGeometry {
    pub name: String,
    pub page_size: u64,
    pub spare_size: u64,
    pub pages_per_block: u64,
    pub total_blocks: u64,
    pub ecc_option: String,
    pub pebsize: u64,
    pub lebsize: u64,
    pub numpebs: u64,
    pub minimum_io_unit_size: u64,
    pub vid_header_offset: u64,
    pub sub_page_size: u64,
    pub status_offset: u64,
    pub is_uffs: bool,
}
