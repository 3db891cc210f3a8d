//! Shared partition-table composition logic used by the hdimage and
//! kdimage handlers.
//!
//! Grounded on `image_com.py`'s `ComImageHandler`. The upstream tool gets
//! this behavior through class inheritance; here it's a plain value,
//! `TableCodec`, that each handler builds during setup and threads through
//! its own layout/write passes instead.

use genimage_common::part::gpt::Guid;
use genimage_part::PartError;

use crate::error::ImageError;
use crate::model::{Image, Partition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    None,
    Mbr,
    Gpt,
    Hybrid,
}

impl TableType {
    pub fn has_mbr(self) -> bool {
        matches!(self, TableType::Mbr | TableType::Hybrid)
    }

    pub fn has_gpt(self) -> bool {
        matches!(self, TableType::Gpt | TableType::Hybrid)
    }
}

/// Parses the `partition-table-type` config key. kdimage rejects
/// `"hybrid"`; hdimage accepts it. Callers pass `allow_hybrid` accordingly.
pub fn parse_table_type(value: &str, allow_hybrid: bool) -> Result<TableType, ImageError> {
    match value {
        "none" => Ok(TableType::None),
        "mbr" | "dos" => Ok(TableType::Mbr),
        "gpt" => Ok(TableType::Gpt),
        "hybrid" if allow_hybrid => Ok(TableType::Hybrid),
        "hybrid" => Err(ImageError::Unsupported(
            "hybrid partition tables are not supported on kdimage".into(),
        )),
        other => Err(ImageError::BadConfig(format!(
            "partition table type `{other}` is not supported"
        ))),
    }
}

/// Resolves `partition-table-type` together with the deprecated boolean
/// pair `partition-table`/`gpt` it replaced. Either legacy key present
/// alongside an explicit `partition-table-type` is rejected as ambiguous;
/// accepting a legacy key on its own logs a warning naming the equivalent
/// `partition-table-type` value.
pub fn resolve_table_type(
    cfg: &std::collections::BTreeMap<String, String>,
    allow_hybrid: bool,
) -> Result<TableType, ImageError> {
    let explicit = cfg.get("partition-table-type");
    let legacy_partition_table = cfg.get("partition-table");
    let legacy_gpt = cfg.get("gpt");

    if explicit.is_some() && (legacy_partition_table.is_some() || legacy_gpt.is_some()) {
        return Err(ImageError::BadConfig(
            "`partition-table-type` cannot be combined with the deprecated `partition-table`/`gpt` keys".into(),
        ));
    }

    if let Some(v) = explicit {
        return parse_table_type(v, allow_hybrid);
    }

    if let Some(v) = legacy_gpt {
        let table_type = if parse_legacy_bool(v)? {
            TableType::Gpt
        } else {
            TableType::Mbr
        };
        log::warn!(
            "`gpt` is deprecated, use `partition-table-type = \"{}\"` instead",
            if table_type == TableType::Gpt { "gpt" } else { "mbr" }
        );
        return Ok(table_type);
    }

    if let Some(v) = legacy_partition_table {
        let table_type = if parse_legacy_bool(v)? {
            TableType::Mbr
        } else {
            TableType::None
        };
        log::warn!(
            "`partition-table` is deprecated, use `partition-table-type = \"{}\"` instead",
            if table_type == TableType::Mbr { "mbr" } else { "none" }
        );
        return Ok(table_type);
    }

    parse_table_type("none", allow_hybrid)
}

fn parse_legacy_bool(value: &str) -> Result<bool, ImageError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ImageError::BadConfig(format!("expected a boolean, found `{other}`"))),
    }
}

/// One disk's worth of table-level state: identity plus where the table
/// structures sit, decided once at setup and read by both the layout
/// solver and the byte emitter.
#[derive(Debug, Clone)]
pub struct TableCodec {
    pub table_type: TableType,
    pub disk_uuid: Guid,
    pub disk_signature: u32,
    pub gpt_location: u64,
    pub gpt_no_backup: bool,
}

/// The upstream `disk-signature = "random"` behavior derives the value from
/// the host's MAC address (`uuid.getnode()`), which isn't actually random.
/// This uses the real RNG instead; see DESIGN.md.
pub fn random_disk_signature() -> u32 {
    rand::random::<u32>()
}

pub fn setup_uuid(
    disk_uuid: Option<&str>,
    disk_signature: Option<&str>,
    table_type: TableType,
) -> Result<(Guid, u32), ImageError> {
    let uuid = match disk_uuid {
        None => Guid::random(),
        Some(s) => {
            let parsed = uuid::Uuid::parse_str(s)
                .map_err(|_| ImageError::BadConfig(format!("invalid disk-uuid `{s}`")))?;
            Guid::from_uuid(parsed)
        }
    };

    let signature = match disk_signature {
        None => 0,
        Some("random") => {
            if !table_type.has_mbr() {
                return Err(ImageError::BadConfig(
                    "disk-signature requires an MBR-capable partition table type".into(),
                ));
            }
            random_disk_signature()
        }
        Some(s) => {
            if !table_type.has_mbr() {
                return Err(ImageError::BadConfig(
                    "disk-signature requires an MBR-capable partition table type".into(),
                ));
            }
            parse_int_literal(s)
                .ok_or_else(|| ImageError::BadConfig(format!("invalid disk-signature `{s}`")))?
        }
    };

    Ok((uuid, signature))
}

fn parse_int_literal(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Validates that a hybrid table has between 1 and 3 in-table partitions,
/// since one legacy MBR slot is always reserved for the protective GPT
/// entry.
pub fn validate_hybrid_partition_table(partitions: &[Partition]) -> Result<(), ImageError> {
    let count = partitions
        .iter()
        .filter(|p| p.in_partition_table && p.partition_type.is_some())
        .count();
    if count == 0 {
        return Err(ImageError::BadConfig(
            "hybrid partition table must contain at least one MBR-typed partition".into(),
        ));
    }
    if count > 3 {
        return Err(ImageError::BadConfig(format!(
            "hybrid partition table supports max 3 partitions, currently has {count}"
        )));
    }
    Ok(())
}

pub fn validate_mbr_partition_count(partitions: &[Partition]) -> Result<(), ImageError> {
    let count = partitions
        .iter()
        .filter(|p| p.in_partition_table && !p.logical)
        .count();
    if count > 4 {
        return Err(ImageError::BadConfig(format!(
            "MBR partition table supports at most 4 primary partitions, currently has {count}"
        )));
    }
    Ok(())
}

/// Resolves a `partition-type`/`partition-type-uuid` alias or literal GUID
/// string to the GPT type GUID to embed in the entry, defaulting to the
/// Linux filesystem data type (alias `"L"`) for in-table partitions on a
/// GPT-capable table that didn't specify one.
pub fn resolve_gpt_type(alias_or_guid: Option<&str>) -> Result<Guid, ImageError> {
    let value = alias_or_guid.unwrap_or("L");
    PartError::resolve_type(value, Guid::BASIC_DATA_PART)
        .map_err(|e| ImageError::BadConfig(e.to_string()))
}

/// Hole-aware overlap check shared by both handlers: two partitions whose
/// byte ranges intersect are only permitted to do so if the intersection is
/// covered by a declared hole in one side's referenced child image (used
/// when more than one partition legitimately reuses a sparse region).
///
/// kdimage's upstream source uses a simpler sorted-adjacency check instead;
/// this engine applies the hole-aware version uniformly, since the engine
/// exposes a single `Overlap` error kind and the spec frames disjointness
/// as a property of the engine, not of one handler. See DESIGN.md.
pub fn check_overlap(partitions: &[Partition], image: &Image) -> Result<(), ImageError> {
    for i in 0..partitions.len() {
        for j in (i + 1)..partitions.len() {
            let a = &partitions[i];
            let b = &partitions[j];
            let a_end = a.offset + a.size;
            let b_end = b.offset + b.size;
            if a.offset >= b_end || b.offset >= a_end {
                continue;
            }

            let overlap_start = a.offset.max(b.offset);
            let overlap_end = a_end.min(b_end);
            if is_hole_covered(a, image, overlap_start, overlap_end)
                || is_hole_covered(b, image, overlap_start, overlap_end)
            {
                continue;
            }

            return Err(ImageError::Overlap {
                a_name: a.name.clone(),
                a_offset: a.offset,
                a_end,
                b_name: b.name.clone(),
                b_offset: b.offset,
                b_end,
            });
        }
    }
    Ok(())
}

fn is_hole_covered(part: &Partition, image: &Image, start: u64, end: u64) -> bool {
    if start < part.offset || end > part.offset + part.size {
        return false;
    }
    let rel_start = start - part.offset;
    let rel_end = end - part.offset;
    image
        .holes
        .iter()
        .any(|(hole_start, hole_end)| *hole_start <= rel_start && rel_end <= *hole_end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageKind;
    use std::path::PathBuf;

    fn part(name: &str, offset: u64, size: u64) -> Partition {
        Partition {
            name: name.into(),
            in_partition_table: true,
            offset,
            size,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_hybrid_on_kdimage() {
        let err = parse_table_type("hybrid", false).unwrap_err();
        assert!(matches!(err, ImageError::Unsupported(_)));
        assert!(parse_table_type("hybrid", true).is_ok());
    }

    #[test]
    fn unrecognized_table_type_is_bad_config() {
        let err = parse_table_type("btrfs", true).unwrap_err();
        assert!(matches!(err, ImageError::BadConfig(_)));
    }

    #[test]
    fn disjoint_partitions_pass() {
        let image = Image::new("disk.img", ImageKind::HdImage, PathBuf::from("disk.img"));
        let parts = vec![part("a", 0, 1024), part("b", 1024, 1024)];
        assert!(check_overlap(&parts, &image).is_ok());
    }

    #[test]
    fn overlapping_partitions_fail_without_a_hole() {
        let image = Image::new("disk.img", ImageKind::HdImage, PathBuf::from("disk.img"));
        let parts = vec![part("a", 0, 1024), part("b", 512, 1024)];
        let err = check_overlap(&parts, &image).unwrap_err();
        assert!(matches!(err, ImageError::Overlap { .. }));
    }

    #[test]
    fn overlap_covered_by_hole_is_allowed() {
        let mut image = Image::new("disk.img", ImageKind::HdImage, PathBuf::from("disk.img"));
        image.holes.push((512, 1024));
        let parts = vec![part("a", 0, 1024), part("b", 512, 1024)];
        assert!(check_overlap(&parts, &image).is_ok());
    }

    #[test]
    fn hybrid_validation_rejects_too_many() {
        let mut parts = vec![part("a", 0, 1), part("b", 1, 1), part("c", 2, 1), part("d", 3, 1)];
        for p in &mut parts {
            p.partition_type = Some("L".into());
        }
        let err = validate_hybrid_partition_table(&parts).unwrap_err();
        assert!(matches!(err, ImageError::BadConfig(_)));
    }
}
