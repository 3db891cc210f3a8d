//! The `hdimage` handler: MBR, GPT, and hybrid MBR/GPT disk images.
//!
//! Grounded on `image_hd.py`, reshaped into the layout/emit split described
//! in `handlers::layout`.

use genimage_common::part::gpt::Guid;
use genimage_part::gpt::{GptTable, GPT_SECTORS};
use genimage_part::mbr::{build_ebr_chain, build_mbr_table, build_protective_mbr};
use genimage_part::partition::PartitionSpec;
use genimage_part::toc::build_toc;

use crate::error::ImageError;
use crate::model::{Image, Partition};
use crate::size::{parse_size, roundup, rounddown};

use super::common::{
    check_overlap, resolve_gpt_type, resolve_table_type, setup_uuid, validate_hybrid_partition_table,
    validate_mbr_partition_count, TableCodec, TableType,
};
use super::layout::{PadPolicy, Slot, SlotBody};

const DEFAULT_ALIGN: u64 = 512;
const MBR_REGION: u64 = 512;
const EXTENDED_PARTITION_NAME: &str = "[Extended]";
const MBR_TYPE_EXTENDED: &str = "0x0f";

/// Transforms the partition list for `extended-partition =`: inserts a
/// virtual `[Extended]` primary right before the Nth in-table partition
/// (1-indexed), then marks every in-table partition after it `logical`
/// until a `forced-primary` partition closes the extended region.
///
/// Grounded on `image_hd.py`'s `_setup_logical_partitions`/
/// `_ensure_extended_partition_index`: when `extended-partition` isn't
/// given but there are more than 4 primary partitions, it defaults to 4 so
/// the fifth and later partitions become logical automatically.
fn setup_logical_partitions(
    partitions: &[Partition],
    table_type: TableType,
    mut extended_index: usize,
) -> Result<Vec<Partition>, ImageError> {
    if table_type != TableType::Mbr {
        return Ok(partitions.to_vec());
    }

    if extended_index == 0 {
        let primary_count = partitions.iter().filter(|p| p.in_partition_table).count();
        if primary_count > 4 {
            extended_index = 4;
        }
    }
    if extended_index == 0 {
        return Ok(partitions.to_vec());
    }
    if extended_index > 4 {
        return Err(ImageError::BadConfig(format!(
            "invalid extended-partition index ({extended_index}), must be <= 4"
        )));
    }

    let mut out = Vec::with_capacity(partitions.len() + 1);
    let mut count = 0usize;
    let mut in_extended = false;
    let mut found_extended = false;

    for part in partitions {
        if part.in_partition_table {
            count += 1;
            if extended_index == count {
                out.push(Partition {
                    name: EXTENDED_PARTITION_NAME.into(),
                    in_partition_table: true,
                    partition_type: Some(MBR_TYPE_EXTENDED.into()),
                    ..Default::default()
                });
                found_extended = true;
                in_extended = true;
            }
        }

        let mut part = part.clone();
        if part.forced_primary {
            if !found_extended {
                return Err(ImageError::BadConfig(format!(
                    "partition `{}`: forced-primary can only follow an extended partition",
                    part.name
                )));
            }
            in_extended = false;
        } else if in_extended {
            part.logical = true;
        } else if found_extended {
            return Err(ImageError::BadConfig(format!(
                "partition `{}` is not forced-primary but appears after the extended region closed",
                part.name
            )));
        }
        out.push(part);
    }

    Ok(out)
}

pub fn generate(image: &Image) -> Result<(), ImageError> {
    let (slots, total_size) = layout(image)?;
    super::layout::write_slots(&image.outfile, total_size, &slots, PadPolicy::Zero)
}

fn layout(image: &Image) -> Result<(Vec<Slot>, u64), ImageError> {
    let cfg = &image.handler_config;

    let table_type = resolve_table_type(cfg, true)?;
    let gpt_location = cfg
        .get("gpt-location")
        .map(|s| parse_size(s))
        .transpose()?
        .unwrap_or(GPT_SECTORS * 512);
    let gpt_no_backup = cfg
        .get("gpt-no-backup")
        .map(|s| parse_config_bool(s))
        .transpose()?
        .unwrap_or(false);
    let toc_enable = cfg
        .get("toc")
        .map(|s| parse_config_bool(s))
        .transpose()?
        .unwrap_or(false);
    let fill = cfg
        .get("fill")
        .map(|s| parse_config_bool(s))
        .transpose()?
        .unwrap_or(false);

    let (disk_uuid, disk_signature) = setup_uuid(
        cfg.get("disk-uuid").map(String::as_str),
        cfg.get("disk-signature").map(String::as_str),
        table_type,
    )?;

    let codec = TableCodec {
        table_type,
        disk_uuid,
        disk_signature,
        gpt_location,
        gpt_no_backup,
    };

    let image_align = cfg
        .get("align")
        .map(|s| parse_size(s))
        .transpose()?
        .unwrap_or(if table_type == TableType::None { 1 } else { DEFAULT_ALIGN });
    if image_align % 512 != 0 && table_type != TableType::None {
        return Err(ImageError::BadConfig(format!(
            "align ({image_align}) must be a multiple of 512"
        )));
    }

    let extended_index = cfg
        .get("extended-partition")
        .map(|s| parse_size(s))
        .transpose()?
        .unwrap_or(0) as usize;
    let partitions = setup_logical_partitions(&image.partitions, table_type, extended_index)?;

    if table_type == TableType::Hybrid {
        validate_hybrid_partition_table(&partitions)?;
    }
    if table_type.has_mbr() {
        validate_mbr_partition_count(&partitions)?;
    }

    let head_reserved = reserved_head(table_type, gpt_location);

    let mut resolved = Vec::with_capacity(partitions.len());
    let mut cursor = head_reserved;
    let mut extended_idx = None;
    let mut autoresized = false;
    for part in &partitions {
        let mut p = part.clone();
        let align = if p.align != 0 {
            p.align
        } else if p.in_partition_table {
            image_align
        } else {
            1
        };

        let is_extended = p.name == EXTENDED_PARTITION_NAME;
        if is_extended {
            extended_idx = Some(resolved.len());
        }
        if p.logical {
            cursor += align;
            cursor = roundup(cursor, align);
        }

        let offset = p.explicit_offset.unwrap_or_else(|| roundup(cursor, align));
        let size = if is_extended {
            0
        } else if p.autoresize {
            if autoresized {
                return Err(ImageError::BadConfig(
                    "only one autoresize partition is supported per image".into(),
                ));
            }
            autoresized = true;
            let image_size = image.size.ok_or_else(|| {
                ImageError::BadConfig(format!(
                    "partition `{}` uses autoresize but image has no size",
                    p.name
                ))
            })?;
            let mut available = image_size.saturating_sub(offset);
            if table_type.has_gpt() {
                available = available.saturating_sub(GPT_SECTORS * 512);
            }
            let available = rounddown(available, align);
            if available == 0 {
                return Err(ImageError::BadConfig(format!(
                    "partition `{}` has no room to autoresize into",
                    p.name
                )));
            }
            if let Some(min) = p.explicit_size {
                if available < min {
                    return Err(ImageError::BadConfig(format!(
                        "autoresize partition `{}` available size {available} is below its minimum {min}",
                        p.name
                    )));
                }
            }
            available
        } else {
            match p.explicit_size {
                Some(s) => s,
                None => child_size(image, &p)?,
            }
        };
        p.offset = offset;
        p.size = size;
        cursor = offset + size;
        resolved.push(p);

        if p.logical {
            if let Some(idx) = extended_idx {
                resolved[idx].size = cursor - resolved[idx].offset;
            }
        }
    }

    let non_logical: Vec<Partition> = resolved.iter().filter(|p| !p.logical).cloned().collect();
    check_overlap(&non_logical, image)?;

    let content_end = resolved.iter().map(|p| p.offset + p.size).max().unwrap_or(head_reserved);
    if let Some(declared) = image.size {
        if content_end > declared {
            return Err(ImageError::BadConfig(format!(
                "partitions need {content_end} bytes, which exceeds the declared image size {declared}"
            )));
        }
    }
    let gpt_backed = table_type.has_gpt() && !gpt_no_backup;
    // Without `fill` (and with no GPT backup to reserve room for), the image
    // is only grown to fit what was actually laid out, not padded out to a
    // larger declared `image.size`.
    let mut total_size = if fill || gpt_backed {
        image.size.unwrap_or(content_end)
    } else {
        content_end
    };
    if gpt_backed {
        total_size = total_size.max(roundup(content_end, 512) + GPT_SECTORS * 512);
    }

    let mut slots = Vec::new();
    let mut specs = Vec::with_capacity(resolved.len());

    for part in &resolved {
        let spec = to_partition_spec(part, table_type)?;
        if let Some(image_name) = &part.image {
            let child = image
                .dependency_path(image_name)
                .ok_or_else(|| ImageError::MissingChild {
                    partition: part.name.clone(),
                    image: image_name.clone(),
                })?;
            slots.push(Slot {
                name: part.name.clone(),
                offset: part.offset,
                size: part.size,
                body: SlotBody::File(child.clone()),
            });
        }
        specs.push(spec);
    }

    if table_type.has_mbr() {
        let hybrid_gpt_location = if table_type == TableType::Hybrid {
            Some((gpt_location, GPT_SECTORS))
        } else {
            None
        };
        let mbr_tail = if table_type == TableType::Gpt {
            build_protective_mbr(total_size / 512)
        } else {
            build_mbr_table(&specs, disk_signature, hybrid_gpt_location)
                .map_err(|e| ImageError::BadConfig(e.to_string()))?
        };
        let mut sector = vec![0u8; 512];
        sector[440..512].copy_from_slice(&mbr_tail);
        slots.push(Slot {
            name: "[MBR]".into(),
            offset: 0,
            size: 512,
            body: SlotBody::Bytes(sector),
        });

        if let Some(extended) = resolved.iter().find(|p| p.name == EXTENDED_PARTITION_NAME) {
            let logical_specs: Vec<&PartitionSpec> = resolved
                .iter()
                .zip(specs.iter())
                .filter(|(p, _)| p.logical)
                .map(|(_, s)| s)
                .collect();
            for (ebr_offset, ebr_bytes) in
                build_ebr_chain(&logical_specs, extended.offset, image_align)
            {
                slots.push(Slot {
                    name: format!("[EBR @ 0x{ebr_offset:x}]"),
                    offset: ebr_offset,
                    size: 512,
                    body: SlotBody::Bytes(ebr_bytes.to_vec()),
                });
            }
        }
    }

    if table_type.has_gpt() {
        let gpt_partitions: Vec<PartitionSpec> = resolved
            .iter()
            .zip(specs.iter())
            .filter(|(p, _)| p.in_partition_table)
            .map(|(_, s)| s.clone())
            .collect();
        let table = GptTable::build(&gpt_partitions, codec.disk_uuid, total_size / 512, gpt_location, gpt_no_backup);

        slots.push(Slot {
            name: "[GPT header]".into(),
            offset: 512,
            size: 512,
            body: SlotBody::Bytes(pad_to(bytemuck::bytes_of(&table.primary_header), 512)),
        });
        slots.push(Slot {
            name: "[GPT array]".into(),
            offset: gpt_location,
            size: (GPT_SECTORS - 1) * 512,
            body: SlotBody::Bytes(table.entry_table_bytes()),
        });
        if !gpt_no_backup {
            let backup_offset = total_size - GPT_SECTORS * 512;
            slots.push(Slot {
                name: "[GPT backup array]".into(),
                offset: backup_offset,
                size: (GPT_SECTORS - 1) * 512,
                body: SlotBody::Bytes(table.entry_table_bytes()),
            });
            slots.push(Slot {
                name: "[GPT backup header]".into(),
                offset: total_size - 512,
                size: 512,
                body: SlotBody::Bytes(pad_to(bytemuck::bytes_of(&table.backup_header), 512)),
            });
        }
    }

    if toc_enable {
        let toc_offset = cfg
            .get("toc-offset")
            .map(|s| parse_size(s))
            .transpose()?
            .unwrap_or(0);
        let toc_bytes = build_toc(&specs);
        let toc_size = toc_bytes.len().max(64) as u64;
        slots.push(Slot {
            name: "[TOC]".into(),
            offset: toc_offset,
            size: toc_size,
            body: SlotBody::Bytes(toc_bytes),
        });
    }

    Ok((slots, total_size))
}

fn reserved_head(table_type: TableType, gpt_location: u64) -> u64 {
    match table_type {
        TableType::None => 0,
        TableType::Mbr => 512,
        TableType::Gpt | TableType::Hybrid => gpt_location + (GPT_SECTORS - 1) * 512,
    }
}

fn child_size(image: &Image, part: &Partition) -> Result<u64, ImageError> {
    let name = part
        .image
        .as_ref()
        .ok_or_else(|| ImageError::BadConfig(format!("partition `{}` has no size and no image", part.name)))?;
    let path = image
        .dependency_path(name)
        .ok_or_else(|| ImageError::MissingChild {
            partition: part.name.clone(),
            image: name.clone(),
        })?;
    Ok(std::fs::metadata(path).map_err(|e| ImageError::io(path, e))?.len())
}

fn to_partition_spec(part: &Partition, table_type: TableType) -> Result<PartitionSpec, ImageError> {
    let mbr_type = part
        .partition_type
        .as_deref()
        .map(parse_mbr_type)
        .transpose()?
        .unwrap_or(0x83);

    let gpt_type = if table_type.has_gpt() && part.in_partition_table {
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

fn parse_config_bool(s: &str) -> Result<bool, ImageError> {
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
