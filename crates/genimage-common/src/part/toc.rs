//! The fixed 64-byte table-of-contents record emitted at the front of hdimage
//! and kdimage outputs when a `toc` partition is declared.

use crate::types::{
    endian::{Endian, LittleEndian},
    number::{U64 as WireU64},
};

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct TocEntry {
    pub name: [u8; 32],
    pub offset: WireU64<LittleEndian>,
    pub size: WireU64<LittleEndian>,
    pub load: u8,
    pub boot: u8,
    pub reserved: [u8; 14],
}

impl TocEntry {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub fn new(name: &str, offset: u64, size: u64, load: bool, boot: u8) -> Self {
        let mut name_bytes = [0u8; 32];
        let bytes = name.as_bytes();
        let len = bytes.len().min(31);
        name_bytes[..len].copy_from_slice(&bytes[..len]);
        Self {
            name: name_bytes,
            offset: WireU64::new(offset),
            size: WireU64::new(size),
            load: load as u8,
            boot,
            reserved: [0; 14],
        }
    }

    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(32);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::const_assert_eq!(core::mem::size_of::<TocEntry>(), 64);

    #[test]
    fn entry_is_64_bytes() {
        assert_eq!(TocEntry::SIZE, 64);
    }

    #[test]
    fn round_trips_name_and_offset() {
        let entry = TocEntry::new("boot", 0x1000, 0x2000, true, 1);
        assert_eq!(entry.name_str(), "boot");
        assert_eq!(entry.offset.get(), 0x1000);
        assert_eq!(entry.size.get(), 0x2000);
        assert_eq!(entry.load, 1);
        assert_eq!(entry.boot, 1);
    }

    #[test]
    fn truncates_long_names() {
        let long_name = "a".repeat(40);
        let entry = TocEntry::new(&long_name, 0, 0, false, 0);
        assert_eq!(entry.name_str().len(), 31);
    }
}
