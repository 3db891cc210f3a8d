//! Turns a parsed block tree into the `Image`/`Partition`/`FlashGeometry`
//! model, resolving each partition's child-image reference to an absolute
//! path along the way.
//!
//! Grounded on `genimage.py`'s `_process_image_block`/`_process_partition_block`:
//! a partition's `image =` value is first checked against the names of
//! other declared images (so one image's output can feed another's
//! partition) and falls back to a bare path under `rootpath` otherwise.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::ImageError;
use crate::model::{FlashGeometry, Image, ImageKind, Partition};
use crate::scratch::ScratchDir;
use crate::size::parse_size;

use super::tree::Block;

pub fn build_images(
    blocks: &[Block],
    rootpath: &Path,
    outputpath: &Path,
    scratch: &ScratchDir,
) -> Result<Vec<Image>, ImageError> {
    let flash_types = build_flash_types(blocks)?;

    let mut images: Vec<Image> = Vec::new();
    for block in blocks {
        match block.kind.as_str() {
            "image" => images.push(build_image(block, &flash_types, outputpath, scratch)?),
            "flash" => {}
            other => {
                return Err(ImageError::BadConfig(format!(
                    "unsupported top-level block type `{other}`"
                )))
            }
        }
    }

    let outfiles: BTreeMap<String, std::path::PathBuf> = images
        .iter()
        .map(|img| (img.name.clone(), img.outfile.clone()))
        .collect();

    for image in &mut images {
        for partition in &image.partitions {
            let Some(dep_name) = &partition.image else {
                continue;
            };
            let resolved = outfiles
                .get(dep_name)
                .cloned()
                .unwrap_or_else(|| rootpath.join(dep_name));
            image.dependencies.insert(dep_name.clone(), resolved);
        }
    }

    Ok(images)
}

fn build_flash_types(blocks: &[Block]) -> Result<BTreeMap<String, FlashGeometry>, ImageError> {
    let mut out = BTreeMap::new();
    for block in blocks {
        if block.kind != "flash" {
            continue;
        }
        let name = block
            .name
            .clone()
            .ok_or_else(|| ImageError::BadConfig("flash block is missing a name".into()))?;

        let mut flash = FlashGeometry {
            name: name.clone(),
            ..Default::default()
        };
        for (key, value) in block.key_values() {
            match key {
                "pagesize" => flash.page_size = parse_size(value)?,
                "sparesize" => flash.spare_size = parse_size(value)?,
                "pages-per-block" | "block-pages" => flash.pages_per_block = parse_size(value)?,
                "numblocks" | "total-blocks" => flash.total_blocks = parse_size(value)?,
                "ecc-option" | "ecc" => flash.ecc_option = value.to_string(),
                "pebsize" => flash.pebsize = parse_size(value)?,
                "lebsize" => flash.lebsize = parse_size(value)?,
                "numpebs" => flash.numpebs = parse_size(value)?,
                "minimum-io-unit-size" => flash.minimum_io_unit_size = parse_size(value)?,
                "vid-header-offset" => flash.vid_header_offset = parse_size(value)?,
                "sub-page-size" => flash.sub_page_size = parse_size(value)?,
                "status-offset" => flash.status_offset = parse_size(value)?,
                "is-uffs" => flash.is_uffs = parse_bool(value)?,
                other => {
                    return Err(ImageError::BadConfig(format!(
                        "unknown flash key `{other}`"
                    )))
                }
            }
        }
        out.insert(name, flash);
    }
    Ok(out)
}

fn build_image(
    block: &Block,
    flash_types: &BTreeMap<String, FlashGeometry>,
    outputpath: &Path,
    scratch: &ScratchDir,
) -> Result<Image, ImageError> {
    let name = block
        .name
        .clone()
        .ok_or_else(|| ImageError::BadConfig("image block is missing a name".into()))?;

    let handler = block.handler_block().ok_or_else(|| {
        ImageError::BadConfig(format!("image `{name}` has no handler sub-block"))
    })?;

    let kind = match handler.kind.as_str() {
        "hdimage" => ImageKind::HdImage,
        "kdimage" => ImageKind::KdImage,
        "vfat" | "vfat-image" => ImageKind::Vfat,
        "uffs" => ImageKind::Uffs,
        other => {
            return Err(ImageError::BadConfig(format!(
                "image `{name}` has unsupported handler type `{other}`"
            )))
        }
    };

    let temporary = block
        .get("temporary")
        .map(parse_bool)
        .transpose()?
        .unwrap_or(false);

    let outfile = if temporary {
        scratch.child(&name)
    } else {
        outputpath.join(&name)
    };

    let mut image = Image::new(name.clone(), kind, outfile);
    image.temporary = temporary;
    image.mountpoint = block.get("mountpoint").map(str::to_string);
    image.exec_pre = block.get("exec-pre").map(str::to_string);
    image.exec_post = block.get("exec-post").map(str::to_string);
    if let Some(size) = block.get("size") {
        image.size = Some(parse_size(size)?);
    }

    for (key, value) in handler.key_values() {
        image.handler_config.insert(key.to_string(), value.to_string());
    }

    if matches!(kind, ImageKind::Uffs | ImageKind::KdImage) {
        if let Some(flash_name) = handler.get("flashtype").or_else(|| block.get("flashtype")) {
            let geometry = flash_types.get(flash_name).ok_or_else(|| {
                ImageError::BadConfig(format!(
                    "image `{name}` references unknown flash type `{flash_name}`"
                ))
            })?;
            image.flash = Some(geometry.clone());
        }
    }

    for part_block in block.sub_blocks("partition") {
        image.partitions.push(build_partition(part_block)?);
    }

    Ok(image)
}

fn build_partition(block: &Block) -> Result<Partition, ImageError> {
    let name = block
        .name
        .clone()
        .ok_or_else(|| ImageError::BadConfig("partition block is missing a name".into()))?;

    let mut partition = Partition {
        name: name.clone(),
        in_partition_table: true,
        ..Default::default()
    };

    partition.image = block.get("image").map(str::to_string);
    partition.partition_type = block.get("partition-type").map(str::to_string);
    partition.partition_type_uuid = block.get("partition-type-uuid").map(str::to_string);
    partition.partition_uuid = block.get("partition-uuid").map(str::to_string);

    if let Some(v) = block.get("offset") {
        partition.explicit_offset = Some(parse_size(v)?);
    }
    if let Some(v) = block.get("size") {
        partition.explicit_size = Some(parse_size(v)?);
    }
    if let Some(v) = block.get("align") {
        partition.align = parse_size(v)?;
    }
    if let Some(v) = block.get("erase-size") {
        partition.erase_size = parse_size(v)?;
    }
    if let Some(v) = block.get("flag") {
        partition.flag = parse_size(v)?;
    }
    if let Some(v) = block.get("in-partition-table") {
        partition.in_partition_table = parse_bool(v)?;
    }
    if let Some(v) = block.get("bootable") {
        partition.bootable = parse_bool(v)?;
    }
    if let Some(v) = block.get("read-only") {
        partition.read_only = parse_bool(v)?;
    }
    if let Some(v) = block.get("hidden") {
        partition.hidden = parse_bool(v)?;
    }
    if let Some(v) = block.get("no-automount") {
        partition.no_automount = parse_bool(v)?;
    }
    if let Some(v) = block.get("autoresize") {
        partition.autoresize = parse_bool(v)?;
    }
    if let Some(v) = block.get("fill") {
        partition.fill = parse_bool(v)?;
    }
    if let Some(v) = block.get("logical") {
        partition.logical = parse_bool(v)?;
    }
    if let Some(v) = block.get("forced-primary") {
        partition.forced_primary = parse_bool(v)?;
    }
    if let Some(v) = block.get("load") {
        partition.load = parse_bool(v)?;
    }
    if let Some(v) = block.get("boot") {
        partition.boot = v
            .parse()
            .map_err(|_| ImageError::BadConfig(format!("invalid boot ordinal `{v}`")))?;
    }

    Ok(partition)
}

fn parse_bool(value: &str) -> Result<bool, ImageError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ImageError::BadConfig(format!(
            "expected a boolean, found `{other}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tokenizer::tokenize;
    use crate::config::tree::parse;

    #[test]
    fn resolves_partition_child_against_sibling_image() {
        let src = r#"
            image boot.vfat {
                vfat { }
            }
            image disk.img {
                hdimage {
                    partition-table-type = "gpt"
                }
                partition boot {
                    image = "boot.vfat"
                    size = "32M"
                }
                partition raw {
                    image = "extra.bin"
                }
            }
        "#;
        let tokens = tokenize(src).unwrap();
        let blocks = parse(&tokens).unwrap();

        let scratch = ScratchDir::new().unwrap();
        let root = Path::new("/root");
        let out = Path::new("/out");
        let images = build_images(&blocks, root, out, &scratch).unwrap();

        let disk = images.iter().find(|i| i.name == "disk.img").unwrap();
        assert_eq!(
            disk.dependencies.get("boot.vfat").unwrap(),
            &out.join("boot.vfat")
        );
        assert_eq!(
            disk.dependencies.get("extra.bin").unwrap(),
            &root.join("extra.bin")
        );
    }

    #[test]
    fn rejects_unknown_handler_type() {
        let src = r#"
            image disk.img {
                something-else { }
            }
        "#;
        let tokens = tokenize(src).unwrap();
        let blocks = parse(&tokens).unwrap();
        let scratch = ScratchDir::new().unwrap();
        let err = build_images(&blocks, Path::new("/root"), Path::new("/out"), &scratch)
            .unwrap_err();
        assert!(matches!(err, ImageError::BadConfig(_)));
    }
}
