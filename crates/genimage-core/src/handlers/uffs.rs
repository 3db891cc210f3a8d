//! The `uffs` handler: builds a UFFS NAND image by shelling out to
//! `mkuffs` against the declared flash geometry.
//!
//! Grounded on `image_uffs.py`: `mkuffs -f <out> -p <page> -s <spare> -b
//! <block_pages> -t <total_blocks> -x <ecc> -o 0 -d <mountpath> <extra>`.

use std::ffi::OsStr;

use crate::error::ImageError;
use crate::model::Image;
use crate::toolbox::FsToolbox;

pub fn generate(image: &Image, toolbox: &dyn FsToolbox) -> Result<(), ImageError> {
    let flash = image.flash.as_ref().ok_or_else(|| {
        ImageError::BadConfig(format!("uffs image `{}` has no flashtype", image.name))
    })?;
    let mountpoint = image.mountpoint.as_deref().ok_or_else(|| {
        ImageError::BadConfig(format!("uffs image `{}` has no mountpoint", image.name))
    })?;

    let ecc = if flash.ecc_option.is_empty() {
        "auto".to_string()
    } else {
        flash.ecc_option.clone()
    };

    let mut args = vec![
        "-f".to_string(),
        image.outfile.display().to_string(),
        "-p".to_string(),
        flash.page_size.to_string(),
        "-s".to_string(),
        flash.spare_size.to_string(),
        "-b".to_string(),
        flash.pages_per_block.to_string(),
        "-t".to_string(),
        flash.total_blocks.to_string(),
        "-x".to_string(),
        ecc,
        "-o".to_string(),
        "0".to_string(),
        "-d".to_string(),
        mountpoint.to_string(),
    ];
    if let Some(extraargs) = image.handler_config.get("extraargs") {
        args.extend(extraargs.split_whitespace().map(String::from));
    }

    let arg_refs: Vec<&OsStr> = args.iter().map(|a| OsStr::new(a.as_str())).collect();
    toolbox.run("mkuffs", &arg_refs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlashGeometry, ImageKind};
    use crate::toolbox::RecordingToolbox;

    #[test]
    fn invokes_mkuffs_with_flash_geometry() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("data.uffs", ImageKind::Uffs, dir.path().join("data.uffs"));
        image.mountpoint = Some("/tmp/rootfs".into());
        image.flash = Some(FlashGeometry {
            page_size: 2048,
            spare_size: 64,
            pages_per_block: 64,
            total_blocks: 1024,
            ecc_option: "soft".into(),
            ..Default::default()
        });

        let toolbox = RecordingToolbox::new();
        generate(&image, &toolbox).unwrap();

        let calls = toolbox.calls.borrow();
        assert_eq!(calls[0].0, "mkuffs");
        assert!(calls[0].1.contains(&"2048".to_string()));
        assert!(calls[0].1.contains(&"soft".to_string()));
    }

    #[test]
    fn extraargs_are_appended_after_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("data.uffs", ImageKind::Uffs, dir.path().join("data.uffs"));
        image.mountpoint = Some("/tmp/rootfs".into());
        image.handler_config.insert("extraargs".into(), "-q".into());
        image.flash = Some(FlashGeometry {
            page_size: 2048,
            spare_size: 64,
            pages_per_block: 64,
            total_blocks: 1024,
            ecc_option: "soft".into(),
            ..Default::default()
        });

        let toolbox = RecordingToolbox::new();
        generate(&image, &toolbox).unwrap();

        let calls = toolbox.calls.borrow();
        assert_eq!(calls[0].1.last().unwrap(), "-q");
    }

    #[test]
    fn rejects_missing_flashtype() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("data.uffs", ImageKind::Uffs, dir.path().join("data.uffs"));
        image.mountpoint = Some("/tmp/rootfs".into());
        let toolbox = RecordingToolbox::new();
        assert!(generate(&image, &toolbox).is_err());
    }
}
