//! GPT header and partition entry wire structs.
//!
//! LBA fields (`current_lba`, `backup_lba`, `first_usable_lba`, `last_usable_lba`,
//! `partition_entry_lba`) are 64-bit per the UEFI spec; disks bigger than 2^32 sectors
//! would otherwise wrap.

use crate::{
    str::utf16::FixedUtf16Str,
    types::{
        endian::{Endian, LittleEndian},
        number::{U32, U64},
    },
};

#[repr(transparent)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Guid([u8; 16]);

impl Default for Guid {
    fn default() -> Self {
        Self([0; 16])
    }
}

impl Guid {
    pub const BASIC_DATA_PART: Self = Self([
        0xa2, 0xa0, 0xd0, 0xeb, 0xe5, 0xb9, 0x33, 0x44, 0x87, 0xc0, 0x68, 0xb6, 0xb7, 0x26, 0x99,
        0xc7,
    ]);
    pub const EFI_SYSTEM_PART: Self = Self([
        0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9,
        0x3b,
    ]);
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GptPartitionTableHeader {
    /// The signature for the GPT header, must be "EFI PART".
    pub signature: [u8; 8],
    pub revision: U32<LittleEndian>,
    pub header_size: U32<LittleEndian>,
    pub crc32: U32<LittleEndian>,
    pub reserved: U32<LittleEndian>,
    pub current_lba: U64<LittleEndian>,
    pub backup_lba: U64<LittleEndian>,
    pub first_usable_lba: U64<LittleEndian>,
    pub last_usable_lba: U64<LittleEndian>,
    pub disk_guid: Guid,
    pub partition_entry_lba: U64<LittleEndian>,
    pub num_partition_entries: U32<LittleEndian>,
    /// The size of the size of each partition entry, in bytes.
    ///
    /// Must be a 128 * 2^n bytes
    pub size_of_partition_entry: U32<LittleEndian>,
    pub partition_entry_array_crc32: U32<LittleEndian>,
}

impl GptPartitionTableHeader {
    const SIGNATURE: [u8; 8] = *b"EFI PART";
    /// Number of LBAs reserved for the header plus the 128-entry partition array,
    /// at each end of the disk (1 header + 32 entry sectors, mirrored for the backup).
    pub const RESERVED_LBAS: u64 = 33;
    pub const MAX_ENTRIES: u32 = 128;

    /// Bit 2 of a partition entry's attribute field: "legacy BIOS bootable" (hybrid MBR marker).
    pub const ATTR_LEGACY_BIOS_BOOTABLE: u64 = 1 << 2;
    pub const ATTR_READ_ONLY: u64 = 1 << 60;
    pub const ATTR_HIDDEN: u64 = 1 << 62;
    pub const ATTR_NO_AUTOMOUNT: u64 = 1 << 63;
}
impl Default for GptPartitionTableHeader {
    fn default() -> Self {
        Self {
            signature: Self::SIGNATURE,
            revision: U32::new(0x00010000),
            header_size: U32::new(0x5C),
            crc32: U32::new(0),
            reserved: U32::new(0),
            current_lba: U64::new(0),
            backup_lba: U64::new(0),
            first_usable_lba: U64::new(0),
            last_usable_lba: U64::new(0),
            disk_guid: Guid::default(),
            partition_entry_lba: U64::new(0),
            num_partition_entries: U32::new(0),
            size_of_partition_entry: U32::new(128),
            partition_entry_array_crc32: U32::new(0),
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GptPartitionEntry {
    pub type_guid: Guid,
    pub unique_partition_guid: Guid,
    pub starting_lba: U64<LittleEndian>,
    pub ending_lba: U64<LittleEndian>,
    pub attributes: U64<LittleEndian>,
    pub partition_name: FixedUtf16Str<36>,
}

impl GptPartitionEntry {
    pub fn is_empty(&self) -> bool {
        self.type_guid == Guid::default()
    }
}

impl PartialEq for Guid {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for Guid {}

impl Guid {
    /// Builds a GUID from the big-endian-grouped textual form
    /// (`xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`) into its on-disk mixed-endian layout.
    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        let fields = uuid.as_fields();
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&fields.0.to_le_bytes());
        bytes[4..6].copy_from_slice(&fields.1.to_le_bytes());
        bytes[6..8].copy_from_slice(&fields.2.to_le_bytes());
        bytes[8..16].copy_from_slice(fields.3);
        Self(bytes)
    }

    pub fn random() -> Self {
        Self::from_uuid(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}
