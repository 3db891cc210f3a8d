use genimage_common::part::mbr::{Chs, MbrPartition};
use genimage_common::types::{
    endian::{Endian, LittleEndian},
    number::U32,
};

use crate::partition::PartitionSpec;
use crate::PartError;

/// Offset of the 4-entry partition table within the boot sector.
pub const MBR_TABLE_OFFSET: usize = 446;
pub const MBR_BOOT_SIGNATURE_OFFSET: usize = 510;
pub const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
pub const MBR_DISK_SIGNATURE_OFFSET: usize = 440;

fn partition_entry(
    bootable: bool,
    mbr_type: u8,
    relative_sectors: u32,
    total_sectors: u32,
) -> MbrPartition {
    let first_lba = relative_sectors;
    let last_lba = relative_sectors + total_sectors - 1;
    MbrPartition {
        boot_indicator: if bootable { 0x80 } else { 0x00 },
        start_head: Chs::new(first_lba),
        part_type: mbr_type,
        end_head: Chs::new(last_lba),
        start_sector: U32::<LittleEndian>::new(relative_sectors),
        block_count: U32::<LittleEndian>::new(total_sectors),
    }
}

/// Builds the 4-entry legacy MBR table for partitions that sit in the
/// primary table (non-logical, `in_primary_table`), writing a hybrid
/// protective entry for the GPT region into any slots left over when the
/// table type is hybrid.
pub fn build_mbr_table(
    partitions: &[PartitionSpec],
    disk_signature: u32,
    hybrid_gpt_location: Option<(u64, u64)>,
) -> Result<[u8; 72], PartError> {
    let mut out = [0u8; 72];
    out[0..4].copy_from_slice(&disk_signature.to_le_bytes());

    let primary: Vec<&PartitionSpec> = partitions
        .iter()
        .filter(|p| p.in_primary_table && !p.logical)
        .collect();

    let hybrid_count = if hybrid_gpt_location.is_some() {
        primary.len()
    } else {
        0
    };
    if hybrid_gpt_location.is_some() {
        log::debug!("hybrid partition table: {hybrid_count} partition(s)");
        if hybrid_count > 3 {
            return Err(PartError::TooManyHybridPartitions { got: hybrid_count });
        }
    }

    let mut entry_offset = 6;
    let mut count = 0;
    for part in primary.iter().take(4) {
        let entry = partition_entry(
            part.bootable,
            part.mbr_type,
            part.start_lba() as u32,
            part.sector_count() as u32,
        );
        write_entry(&mut out, entry_offset, &entry);
        entry_offset += 16;
        count += 1;
    }

    if let Some((gpt_location, gpt_reserved_lbas)) = hybrid_gpt_location {
        if count < 4 {
            let relative_sectors = 1u32;
            let total_sectors = ((gpt_location / 512) as u32) + gpt_reserved_lbas as u32 - 2;
            let entry = partition_entry(false, 0xEE, relative_sectors, total_sectors);
            write_entry(&mut out, entry_offset, &entry);
        }
    }

    write_boot_signature(&mut out);
    Ok(out)
}

/// Builds a protective MBR covering the whole disk with a single 0xEE
/// entry, as written ahead of a pure-GPT (non-hybrid) table.
pub fn build_protective_mbr(total_sectors: u64) -> [u8; 72] {
    let mut out = [0u8; 72];
    let total = total_sectors.min(u32::MAX as u64 - 1) as u32;
    let entry = partition_entry(false, 0xEE, 1, total);
    write_entry(&mut out, 6, &entry);
    write_boot_signature(&mut out);
    out
}

/// Stamps `0x55 0xAA` at the last two bytes of a 72-byte MBR tail buffer,
/// which sits at absolute sector offsets 510/511 once copied into place.
fn write_boot_signature(out: &mut [u8; 72]) {
    out[70] = MBR_BOOT_SIGNATURE[0];
    out[71] = MBR_BOOT_SIGNATURE[1];
}

fn write_entry(buf: &mut [u8], offset: usize, entry: &MbrPartition) {
    buf[offset..offset + core::mem::size_of::<MbrPartition>()]
        .copy_from_slice(bytemuck::bytes_of(entry));
}

/// Writes the extended boot record chain for logical partitions behind an
/// extended partition entry. Each EBR's first entry describes the logical
/// partition itself; the second, when present, points at the next EBR.
pub fn build_ebr_chain(
    logical_partitions: &[&PartitionSpec],
    extended_partition_offset: u64,
    align: u64,
) -> Vec<(u64, [u8; 512])> {
    let mut chain = Vec::with_capacity(logical_partitions.len());
    let mut prev: Option<&PartitionSpec> = None;

    for part in logical_partitions {
        let ebr_offset = part.offset - align;
        let mut ebr = [0u8; 512];

        let relative_sectors = (align / 512) as u32;
        let entry1 = partition_entry(
            false,
            part.mbr_type,
            relative_sectors + ((part.offset - align) / 512) as u32,
            (part.size / 512) as u32,
        );
        write_entry(&mut ebr, 0, &entry1);

        if prev.is_some() {
            let next_ebr_rel_sectors =
                ((part.offset - align - extended_partition_offset) / 512) as u32;
            let total_sectors = ((part.size + align) / 512) as u32;
            let entry2 = partition_entry(
                false,
                0x05,
                next_ebr_rel_sectors,
                total_sectors,
            );
            write_entry(&mut ebr, 16, &entry2);
        }

        ebr[MBR_BOOT_SIGNATURE_OFFSET] = MBR_BOOT_SIGNATURE[0];
        ebr[MBR_BOOT_SIGNATURE_OFFSET + 1] = MBR_BOOT_SIGNATURE[1];

        chain.push((ebr_offset, ebr));
        prev = Some(part);
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(offset: u64, size: u64) -> PartitionSpec {
        PartitionSpec {
            name: "test".into(),
            offset,
            size,
            bootable: false,
            read_only: false,
            hidden: false,
            no_automount: false,
            mbr_type: 0x83,
            gpt_type: genimage_common::part::gpt::Guid::default(),
            gpt_guid: genimage_common::part::gpt::Guid::default(),
            in_primary_table: true,
            logical: false,
            toc_load: false,
            toc_boot: 0,
        }
    }

    #[test]
    fn single_partition_table_has_boot_signature_slot_free() {
        let parts = vec![spec(1024 * 1024, 1024 * 1024)];
        let mbr = build_mbr_table(&parts, 0xdeadbeef, None).unwrap();
        assert_eq!(&mbr[0..4], &0xdeadbeef_u32.to_le_bytes());
        assert_eq!(&mbr[70..72], &MBR_BOOT_SIGNATURE);
    }

    #[test]
    fn protective_mbr_marks_whole_disk() {
        let mbr = build_protective_mbr(2048);
        assert_eq!(mbr[6 + 4], 0xEE);
        assert_eq!(&mbr[70..72], &MBR_BOOT_SIGNATURE);
    }

    #[test]
    fn rejects_too_many_hybrid_partitions() {
        let parts = vec![spec(0, 1), spec(1, 1), spec(2, 1), spec(3, 1)];
        let err = build_mbr_table(&parts, 0, Some((1024 * 1024, 33))).unwrap_err();
        assert!(matches!(err, PartError::TooManyHybridPartitions { got: 4 }));
    }
}
