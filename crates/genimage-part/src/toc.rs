use genimage_common::part::toc::TocEntry;

use crate::partition::PartitionSpec;

/// Builds the table-of-contents block: one fixed 64-byte record per
/// partition that participates in the image, in layout order. This is
/// written verbatim at the start of the `toc` partition's reserved region.
pub fn build_toc(partitions: &[PartitionSpec]) -> Vec<u8> {
    let mut out = Vec::with_capacity(partitions.len() * TocEntry::SIZE);
    for part in partitions {
        let entry = TocEntry::new(&part.name, part.offset, part.size, part.toc_load, part.toc_boot);
        out.extend_from_slice(bytemuck::bytes_of(&entry));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use genimage_common::part::gpt::Guid;

    fn spec(name: &str, offset: u64, size: u64) -> PartitionSpec {
        PartitionSpec {
            name: name.into(),
            offset,
            size,
            bootable: false,
            read_only: false,
            hidden: false,
            no_automount: false,
            mbr_type: 0x83,
            gpt_type: Guid::default(),
            gpt_guid: Guid::default(),
            in_primary_table: true,
            logical: false,
            toc_load: false,
            toc_boot: 0,
        }
    }

    #[test]
    fn one_record_per_partition() {
        let parts = vec![spec("boot", 0, 1024), spec("root", 1024, 2048)];
        let toc = build_toc(&parts);
        assert_eq!(toc.len(), 2 * TocEntry::SIZE);
    }
}
