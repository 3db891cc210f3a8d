use genimage_common::alg::hash::crc::Crc32HasherIsoHdlc;
use genimage_common::part::gpt::{Guid, GptPartitionEntry, GptPartitionTableHeader};
use genimage_common::str::utf16::FixedUtf16Str;
use genimage_common::types::{
    endian::{Endian, LittleEndian},
    number::{U16, U32, U64},
};

use crate::partition::PartitionSpec;

/// Number of LBAs reserved at each end of the disk for the GPT header and
/// its 128-entry partition array (1 header sector + 32 entry-array sectors).
pub const GPT_SECTORS: u64 = GptPartitionTableHeader::RESERVED_LBAS;
const GPT_ENTRY_COUNT: usize = GptPartitionTableHeader::MAX_ENTRIES as usize;
const GPT_TABLE_BYTES: usize = GPT_ENTRY_COUNT * core::mem::size_of::<GptPartitionEntry>();

/// The primary header, backup header, and shared 128-entry partition array
/// for one disk image.
pub struct GptTable {
    pub primary_header: GptPartitionTableHeader,
    pub backup_header: GptPartitionTableHeader,
    pub entries: Vec<GptPartitionEntry>,
}

fn name_to_utf16(name: &str) -> FixedUtf16Str<36> {
    let mut units = [U16::<LittleEndian>::new(0); 36];
    for (slot, ch) in units.iter_mut().zip(name.chars().take(36)) {
        *slot = U16::new(ch as u32 as u16);
    }
    FixedUtf16Str::from_units(units)
}

fn build_entry(part: &PartitionSpec) -> GptPartitionEntry {
    let mut attributes = 0u64;
    if part.bootable {
        attributes |= GptPartitionTableHeader::ATTR_LEGACY_BIOS_BOOTABLE;
    }
    if part.read_only {
        attributes |= GptPartitionTableHeader::ATTR_READ_ONLY;
    }
    if part.hidden {
        attributes |= GptPartitionTableHeader::ATTR_HIDDEN;
    }
    if part.no_automount {
        attributes |= GptPartitionTableHeader::ATTR_NO_AUTOMOUNT;
    }

    GptPartitionEntry {
        type_guid: part.gpt_type,
        unique_partition_guid: part.gpt_guid,
        starting_lba: U64::new(part.start_lba()),
        ending_lba: U64::new(part.end_lba()),
        attributes: U64::new(attributes),
        partition_name: name_to_utf16(&part.name),
    }
}

fn entry_table_bytes(entries: &[GptPartitionEntry]) -> Vec<u8> {
    let mut table = vec![0u8; GPT_TABLE_BYTES];
    for (i, entry) in entries.iter().take(GPT_ENTRY_COUNT).enumerate() {
        let offset = i * core::mem::size_of::<GptPartitionEntry>();
        table[offset..offset + core::mem::size_of::<GptPartitionEntry>()]
            .copy_from_slice(bytemuck::bytes_of(entry));
    }
    table
}

/// Computes a header's CRC32 the way the UEFI spec requires: over the
/// `header_size`-byte header with the `crc32` field itself zeroed out.
fn header_crc(mut header: GptPartitionTableHeader) -> u32 {
    header.crc32 = U32::new(0);
    let bytes = bytemuck::bytes_of(&header);
    let header_size = header.header_size.get() as usize;
    Crc32HasherIsoHdlc::checksum(&bytes[..header_size])
}

impl GptTable {
    /// Builds the primary/backup header pair and partition array for a disk
    /// of `total_sectors` 512-byte sectors, with the partition array located
    /// at `gpt_location` bytes from the start of the disk.
    pub fn build(
        partitions: &[PartitionSpec],
        disk_guid: Guid,
        total_sectors: u64,
        gpt_location: u64,
        no_backup: bool,
    ) -> Self {
        let entries: Vec<GptPartitionEntry> = partitions.iter().map(build_entry).collect();
        let table_bytes = entry_table_bytes(&entries);
        let table_crc = Crc32HasherIsoHdlc::checksum(&table_bytes);

        let entry_array_lba = gpt_location / 512;
        let smallest_offset = partitions.iter().map(|p| p.offset).min();
        let first_usable_lba = smallest_offset
            .map(|o| o / 512)
            .unwrap_or(gpt_location / 512 + GPT_SECTORS - 1);

        let backup_lba = if no_backup { 1 } else { total_sectors - 1 };
        let last_usable_lba = total_sectors - 1 - GPT_SECTORS;

        let mut primary = GptPartitionTableHeader {
            disk_guid,
            current_lba: U64::new(1),
            backup_lba: U64::new(backup_lba),
            first_usable_lba: U64::new(first_usable_lba),
            last_usable_lba: U64::new(last_usable_lba),
            partition_entry_lba: U64::new(entry_array_lba),
            num_partition_entries: U32::new(
                GPT_ENTRY_COUNT as u32,
            ),
            partition_entry_array_crc32: U32::new(table_crc),
            ..Default::default()
        };
        primary.crc32 = U32::new(header_crc(primary));

        let mut backup = GptPartitionTableHeader {
            disk_guid,
            current_lba: U64::new(backup_lba),
            backup_lba: U64::new(1),
            first_usable_lba: U64::new(first_usable_lba),
            last_usable_lba: U64::new(last_usable_lba),
            partition_entry_lba: U64::new(backup_lba - GPT_SECTORS + 1),
            num_partition_entries: U32::new(
                GPT_ENTRY_COUNT as u32,
            ),
            partition_entry_array_crc32: U32::new(table_crc),
            ..Default::default()
        };
        backup.crc32 = U32::new(header_crc(backup));

        Self {
            primary_header: primary,
            backup_header: backup,
            entries,
        }
    }

    pub fn entry_table_bytes(&self) -> Vec<u8> {
        entry_table_bytes(&self.entries)
    }
}
