//! The `kdimage` handler: the vendor "KD" flash image format.
//!
//! Grounded on `image_kd.py`. Two corrections versus the literal upstream
//! behavior are made here, both recorded in DESIGN.md:
//!
//! - GPT header/array/backup bookkeeping partitions are actually populated
//!   with real GPT bytes (reusing `genimage_part::gpt::GptTable`); the
//!   upstream source reserves layout space for them but never writes them.
//! - The embedded legacy MBR/GPT bookkeeping region is placed right after
//!   the KD header and partition table instead of at a fixed offset that
//!   can collide with the KD header itself.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use genimage_common::part::gpt::Guid;
use genimage_part::gpt::{GptTable, GPT_SECTORS};
use genimage_part::mbr::build_mbr_table;
use genimage_part::partition::PartitionSpec;

use crate::error::ImageError;
use crate::model::{Image, Partition};
use crate::size::{parse_size, roundup};

use super::common::{
    check_overlap, parse_table_type, resolve_gpt_type, setup_uuid, validate_mbr_partition_count,
    TableType,
};
use super::layout::{PadPolicy, Slot, SlotBody};

const KD_HEADER_MAGIC: u32 = 0x27CB8F93;
const KD_PART_MAGIC: u32 = 0x91DF6DA4;
const KDIMG_CONTENT_START_OFFSET: u64 = 64 * 1024;
const KD_HEADER_ALIGN: u64 = 512;
const KD_PART_ENTRY_ALIGN: u64 = 256;
const KBURN_FLAG_SPI_NAND_WRITE_WITH_OOB: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediumType {
    Mmc,
    SpiNand,
    SpiNor,
}

impl MediumType {
    fn parse(s: &str) -> Result<Self, ImageError> {
        match s {
            "mmc" => Ok(Self::Mmc),
            "spi_nand" | "spi-nand" => Ok(Self::SpiNand),
            "spi_nor" | "spi-nor" => Ok(Self::SpiNor),
            other => Err(ImageError::BadConfig(format!("unknown medium-type `{other}`"))),
        }
    }

    fn as_u32(self) -> u32 {
        match self {
            MediumType::Mmc => 0,
            MediumType::SpiNand => 1,
            MediumType::SpiNor => 2,
        }
    }

    fn pad_byte(self) -> u8 {
        match self {
            MediumType::Mmc => 0x00,
            MediumType::SpiNand | MediumType::SpiNor => 0xFF,
        }
    }
}

pub fn generate(image: &Image) -> Result<(), ImageError> {
    let (slots, total_size) = layout(image)?;
    let pad = match medium_type(image)? {
        MediumType::Mmc => PadPolicy::Zero,
        MediumType::SpiNand | MediumType::SpiNor => PadPolicy::ErasedFlash,
    };
    super::layout::write_slots(&image.outfile, total_size, &slots, pad)
}

fn medium_type(image: &Image) -> Result<MediumType, ImageError> {
    MediumType::parse(
        image
            .handler_config
            .get("medium-type")
            .map(String::as_str)
            .unwrap_or("mmc"),
    )
}

fn layout(image: &Image) -> Result<(Vec<Slot>, u64), ImageError> {
    let cfg = &image.handler_config;
    medium_type(image)?;

    let table_type = parse_table_type(
        cfg.get("partition-table-type").map(String::as_str).unwrap_or("none"),
        false,
    )?;
    let gpt_location = cfg
        .get("gpt-location")
        .map(|s| parse_size(s))
        .transpose()?
        .unwrap_or(GPT_SECTORS * 512);
    let gpt_no_backup = cfg
        .get("gpt-no-backup")
        .map(|s| parse_bool(s))
        .transpose()?
        .unwrap_or(false);

    let (disk_uuid, disk_signature) = setup_uuid(
        cfg.get("disk-uuid").map(String::as_str),
        cfg.get("disk-signature").map(String::as_str),
        table_type,
    )?;

    if table_type.has_mbr() {
        validate_mbr_partition_count(&image.partitions)?;
    }

    let real_partitions: Vec<&Partition> = image.partitions.iter().filter(|p| p.image.is_some()).collect();

    // --- Bookkeeping region: KD header, descriptor table, then the
    // optional embedded MBR/GPT structures, all ahead of the fixed content
    // start offset.
    let mut cursor = 0u64;
    let header_offset = cursor;
    cursor += KD_HEADER_ALIGN;

    let table_offset = cursor;
    let table_size = real_partitions.len() as u64 * KD_PART_ENTRY_ALIGN;
    cursor += table_size;
    cursor = roundup(cursor, 512);

    let mbr_offset = cursor;
    if table_type.has_mbr() {
        cursor += 512;
    }

    let gpt_header_offset = cursor;
    let gpt_array_offset = gpt_location.max(cursor);
    let gpt_backup_offset = cursor.max(gpt_array_offset) + (GPT_SECTORS - 1) * 512;
    if table_type.has_gpt() {
        cursor = gpt_array_offset + (GPT_SECTORS - 1) * 512;
        if !gpt_no_backup {
            cursor += GPT_SECTORS * 512;
        }
    }

    if cursor > KDIMG_CONTENT_START_OFFSET {
        return Err(ImageError::BadSize(format!(
            "kdimage bookkeeping region ({cursor} bytes) exceeds the fixed content start offset ({KDIMG_CONTENT_START_OFFSET} bytes)"
        )));
    }

    // --- Content region: each real partition gets a 4096-aligned slice,
    // deduplicated by child image path.
    let mut content_cursor = KDIMG_CONTENT_START_OFFSET;
    let mut dedup: BTreeMap<PathBuf, (u64, u64, [u8; 32])> = BTreeMap::new();
    let mut slots = Vec::new();
    let mut specs = Vec::with_capacity(image.partitions.len());
    let mut descriptors = Vec::with_capacity(real_partitions.len());
    let mut resolved_all: Vec<Partition> = Vec::with_capacity(image.partitions.len());

    for part in &image.partitions {
        let mut p = part.clone();
        let Some(image_name) = &part.image else {
            resolved_all.push(p);
            continue;
        };
        let child_path = image
            .dependency_path(image_name)
            .ok_or_else(|| ImageError::MissingChild {
                partition: part.name.clone(),
                image: image_name.clone(),
            })?
            .clone();

        let child_size = std::fs::metadata(&child_path)
            .map_err(|e| ImageError::io(&child_path, e))?
            .len();
        let slot_size = part.explicit_size.unwrap_or_else(|| roundup(child_size, 4096));
        if child_size > slot_size {
            return Err(ImageError::SizeOverflow {
                partition: part.name.clone(),
                slot_size,
                content_size: child_size,
            });
        }

        p.offset = content_cursor;
        p.size = slot_size;
        content_cursor += roundup(slot_size, 4096);

        let (content_offset, content_size, sha256) = if let Some(cached) = dedup.get(&child_path) {
            *cached
        } else {
            let aligned = roundup(slot_size, 4096);
            let sha = hash_file_padded(&child_path, aligned)?;
            slots.push(Slot {
                name: part.name.clone(),
                offset: p.offset,
                size: p.size,
                body: SlotBody::File(child_path.clone()),
            });
            let entry = (p.offset, aligned, sha);
            dedup.insert(child_path.clone(), entry);
            entry
        };

        let overflow = overflow_escape(part.flag, child_size, slot_size)?;
        let _ = overflow;

        descriptors.push(KdPartDescriptor {
            offset: p.offset,
            size: p.size,
            erase_size: part.erase_size,
            max_size: part.erase_size.max(p.size),
            flag: part.flag,
            content_offset,
            content_size,
            content_sha256: sha256,
            name: part.name.clone(),
        });

        let spec = to_partition_spec(&p, table_type)?;
        specs.push(spec);
        resolved_all.push(p);
    }

    check_overlap(&resolved_all, image)?;

    let total_size = image.size.unwrap_or(content_cursor);

    // --- Embedded legacy MBR/GPT, built from the in-table partitions only.
    if table_type.has_mbr() {
        let mbr_tail = build_mbr_table(&specs, disk_signature, None)
            .map_err(|e| ImageError::BadConfig(e.to_string()))?;
        let mut sector = vec![0u8; 512];
        sector[440..512].copy_from_slice(&mbr_tail);
        slots.push(Slot {
            name: "[MBR]".into(),
            offset: mbr_offset,
            size: 512,
            body: SlotBody::Bytes(sector),
        });
    }

    if table_type.has_gpt() {
        let gpt_partitions: Vec<PartitionSpec> = specs
            .iter()
            .cloned()
            .collect();
        let table = GptTable::build(&gpt_partitions, disk_uuid, total_size / 512, gpt_array_offset, gpt_no_backup);
        slots.push(Slot {
            name: "[GPT header]".into(),
            offset: gpt_header_offset,
            size: 512,
            body: SlotBody::Bytes(pad_to(bytemuck::bytes_of(&table.primary_header), 512)),
        });
        slots.push(Slot {
            name: "[GPT array]".into(),
            offset: gpt_array_offset,
            size: (GPT_SECTORS - 1) * 512,
            body: SlotBody::Bytes(table.entry_table_bytes()),
        });
        if !gpt_no_backup {
            slots.push(Slot {
                name: "[GPT backup array]".into(),
                offset: gpt_backup_offset,
                size: (GPT_SECTORS - 1) * 512,
                body: SlotBody::Bytes(table.entry_table_bytes()),
            });
            slots.push(Slot {
                name: "[GPT backup header]".into(),
                offset: gpt_backup_offset + (GPT_SECTORS - 1) * 512,
                size: 512,
                body: SlotBody::Bytes(pad_to(bytemuck::bytes_of(&table.backup_header), 512)),
            });
        }
    }

    // --- KD header and partition descriptor table, written last since the
    // table CRC covers every descriptor's final content hash.
    let table_bytes = pack_descriptor_table(&descriptors);
    let table_crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&table_bytes);

    let image_info = cfg
        .get("image-info")
        .ok_or_else(|| ImageError::BadConfig("kdimage requires `image-info`".into()))?;
    let chip_info = cfg
        .get("chip-info")
        .ok_or_else(|| ImageError::BadConfig("kdimage requires `chip-info`".into()))?;
    let board_info = cfg
        .get("board-info")
        .ok_or_else(|| ImageError::BadConfig("kdimage requires `board-info`".into()))?;

    let header_bytes = pack_header(
        descriptors.len() as u32,
        table_crc,
        image_info,
        chip_info,
        board_info,
    );

    slots.push(Slot {
        name: "[KD table]".into(),
        offset: table_offset,
        size: table_size,
        body: SlotBody::Bytes(table_bytes),
    });
    slots.push(Slot {
        name: "[KD header]".into(),
        offset: header_offset,
        size: KD_HEADER_ALIGN,
        body: SlotBody::Bytes(header_bytes),
    });

    Ok((slots, total_size))
}

/// Checks the SPI-NAND-with-OOB overflow escape: a partition whose content
/// doesn't fit in its declared slot is still accepted if `flag` marks it as
/// an OOB-aware write, since the real on-media footprint then includes a
/// spare-area allowance the slot size doesn't account for.
fn overflow_escape(flag: u64, content_size: u64, slot_size: u64) -> Result<bool, ImageError> {
    if content_size <= slot_size {
        return Ok(false);
    }
    let oob_flag = (flag >> 48) & 0xffff;
    if oob_flag == KBURN_FLAG_SPI_NAND_WRITE_WITH_OOB {
        Ok(true)
    } else {
        Err(ImageError::SizeOverflow {
            partition: String::new(),
            slot_size,
            content_size,
        })
    }
}

struct KdPartDescriptor {
    offset: u64,
    size: u64,
    erase_size: u64,
    max_size: u64,
    flag: u64,
    content_offset: u64,
    content_size: u64,
    content_sha256: [u8; 32],
    name: String,
}

fn pack_descriptor_table(descriptors: &[KdPartDescriptor]) -> Vec<u8> {
    let mut out = Vec::with_capacity(descriptors.len() * KD_PART_ENTRY_ALIGN as usize);
    for d in descriptors {
        let mut entry = vec![0u8; KD_PART_ENTRY_ALIGN as usize];
        entry[0..4].copy_from_slice(&KD_PART_MAGIC.to_le_bytes());
        entry[4..8].copy_from_slice(&(d.offset as u32).to_le_bytes());
        entry[8..12].copy_from_slice(&(d.size as u32).to_le_bytes());
        entry[12..16].copy_from_slice(&(d.erase_size as u32).to_le_bytes());
        entry[16..20].copy_from_slice(&(d.max_size as u32).to_le_bytes());
        entry[20..24].copy_from_slice(&0u32.to_le_bytes());
        entry[24..32].copy_from_slice(&d.flag.to_le_bytes());
        entry[32..36].copy_from_slice(&(d.content_offset as u32).to_le_bytes());
        entry[36..40].copy_from_slice(&(d.content_size as u32).to_le_bytes());
        entry[40..72].copy_from_slice(&d.content_sha256);
        let name_bytes = d.name.as_bytes();
        let len = name_bytes.len().min(31);
        entry[72..72 + len].copy_from_slice(&name_bytes[..len]);
        out.extend_from_slice(&entry);
    }
    out
}

fn pack_header(
    part_count: u32,
    table_crc: u32,
    image_info: &str,
    chip_info: &str,
    board_info: &str,
) -> Vec<u8> {
    let mut out = vec![0u8; KD_HEADER_ALIGN as usize];
    out[0..4].copy_from_slice(&KD_HEADER_MAGIC.to_le_bytes());
    // crc32 at [4..8] filled in below, after zeroing it for the checksum pass.
    // flag at [8..12] is always zero; medium type is runtime-only config, not
    // part of the on-disk header.
    out[8..12].copy_from_slice(&0u32.to_le_bytes());
    out[12..16].copy_from_slice(&2u32.to_le_bytes());
    out[16..20].copy_from_slice(&part_count.to_le_bytes());
    out[20..24].copy_from_slice(&table_crc.to_le_bytes());
    write_str(&mut out, 24, 32, image_info);
    write_str(&mut out, 56, 32, chip_info);
    write_str(&mut out, 88, 64, board_info);

    let crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&out);
    out[4..8].copy_from_slice(&crc.to_le_bytes());
    out
}

fn write_str(buf: &mut [u8], offset: usize, max_len: usize, value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(max_len);
    buf[offset..offset + len].copy_from_slice(&bytes[..len]);
}

fn hash_file_padded(path: &Path, aligned_size: u64) -> Result<[u8; 32], ImageError> {
    let data = std::fs::read(path).map_err(|e| ImageError::io(path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    let pad = aligned_size.saturating_sub(data.len() as u64);
    if pad > 0 {
        const CHUNK: usize = 64 * 1024;
        let mut remaining = pad;
        let zeros = [0u8; CHUNK];
        while remaining > 0 {
            let n = remaining.min(CHUNK as u64) as usize;
            hasher.update(&zeros[..n]);
            remaining -= n as u64;
        }
    }
    Ok(hasher.finalize().into())
}

fn to_partition_spec(part: &Partition, table_type: TableType) -> Result<PartitionSpec, ImageError> {
    let mbr_type = part
        .partition_type
        .as_deref()
        .map(parse_mbr_type)
        .transpose()?
        .unwrap_or(0x83);

    let gpt_type = if table_type.has_gpt() {
        resolve_gpt_type(part.partition_type_uuid.as_deref())?
    } else {
        Guid::default()
    };

    let gpt_guid = match &part.partition_uuid {
        Some(s) => {
            let parsed = uuid::Uuid::parse_str(s)
                .map_err(|_| ImageError::BadConfig(format!("invalid partition-uuid `{s}`")))?;
            Guid::from_uuid(parsed)
        }
        None => Guid::random(),
    };

    Ok(PartitionSpec {
        name: part.name.clone(),
        offset: part.offset,
        size: part.size,
        bootable: part.bootable,
        read_only: part.read_only,
        hidden: part.hidden,
        no_automount: part.no_automount,
        mbr_type,
        gpt_type,
        gpt_guid,
        in_primary_table: part.in_partition_table && !part.logical,
        logical: part.logical,
        toc_load: part.load,
        toc_boot: part.boot,
    })
}

fn parse_mbr_type(s: &str) -> Result<u8, ImageError> {
    let s = s.trim();
    let value = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    };
    value
        .map(|v| v as u8)
        .ok_or_else(|| ImageError::BadConfig(format!("invalid partition-type `{s}`")))
}

fn parse_bool(s: &str) -> Result<bool, ImageError> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ImageError::BadConfig(format!("expected a boolean, found `{other}`"))),
    }
}

fn pad_to(bytes: &[u8], len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    out[..bytes.len()].copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageKind;
    use std::io::Write as _;

    fn one_partition_image(medium: &str, table: &str, size: usize) -> (tempfile::TempDir, Image) {
        let dir = tempfile::tempdir().unwrap();
        let child_path = dir.path().join("rootfs.img");
        std::fs::File::create(&child_path).unwrap().write_all(&vec![0x42u8; size]).unwrap();

        let mut image = Image::new("disk.kdimg", ImageKind::KdImage, dir.path().join("disk.kdimg"));
        image.handler_config.insert("medium-type".into(), medium.into());
        image.handler_config.insert("partition-table-type".into(), table.into());
        image.handler_config.insert("image-info".into(), "test-image".into());
        image.handler_config.insert("chip-info".into(), "test-chip".into());
        image.handler_config.insert("board-info".into(), "test-board".into());
        image.dependencies.insert("rootfs.img".into(), child_path);

        image.partitions.push(Partition {
            name: "rootfs".into(),
            in_partition_table: true,
            image: Some("rootfs.img".into()),
            partition_type: Some("0x83".into()),
            ..Default::default()
        });

        (dir, image)
    }

    #[test]
    fn missing_image_info_is_rejected() {
        let (_dir, mut image) = one_partition_image("mmc", "none", 4096);
        image.handler_config.remove("image-info");

        let err = layout(&image).unwrap_err();
        assert!(matches!(err, ImageError::BadConfig(_)));
    }

    #[test]
    fn rejects_hybrid_table() {
        let cfg_value = "hybrid";
        assert!(parse_table_type(cfg_value, false).is_err());
    }

    #[test]
    fn layout_reserves_content_at_fixed_offset() {
        let (_dir, image) = one_partition_image("mmc", "none", 4096);
        let (slots, _total) = layout(&image).unwrap();
        let content = slots.iter().find(|s| s.name == "rootfs").unwrap();
        assert_eq!(content.offset, KDIMG_CONTENT_START_OFFSET);
        assert!(slots.iter().any(|s| s.name == "[KD header]"));
        assert!(slots.iter().any(|s| s.name == "[KD table]"));
    }

    #[test]
    fn gpt_table_is_actually_populated() {
        let (_dir, image) = one_partition_image("mmc", "gpt", 4096);
        let (slots, _total) = layout(&image).unwrap();
        assert!(slots.iter().any(|s| s.name == "[GPT header]"));
        assert!(slots.iter().any(|s| s.name == "[GPT backup header]"));
    }

    #[test]
    fn generate_produces_file_of_expected_size() {
        let (dir, image) = one_partition_image("spi_nand", "none", 4096);
        generate(&image).unwrap();
        let outfile = dir.path().join("disk.kdimg");
        let data = std::fs::read(&outfile).unwrap();
        let (_slots, total_size) = layout(&image).unwrap();
        assert_eq!(data.len() as u64, total_size);
    }

    #[test]
    fn header_flag_field_is_always_zero() {
        let (dir, image) = one_partition_image("spi_nand", "none", 4096);
        generate(&image).unwrap();
        let data = std::fs::read(dir.path().join("disk.kdimg")).unwrap();
        assert_eq!(&data[8..12], &0u32.to_le_bytes());
    }
}
