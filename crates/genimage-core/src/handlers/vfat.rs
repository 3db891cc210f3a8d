//! The `vfat` handler: builds a FAT filesystem image by shelling out to
//! `mkdosfs`, populating it with `mmd`/`mcopy`, then optionally truncating
//! it down to its last used cluster.
//!
//! Grounded on `image_vfat.py`. The upstream tool walks the mountpoint
//! directory tree itself to build the `mmd`/`mcopy` argument list; this
//! keeps the same shape but drives it through `FsToolbox` so tests can
//! substitute a fake toolbox.

use std::ffi::OsStr;
use std::path::Path;

use crate::error::ImageError;
use crate::model::Image;
use crate::size::parse_size;
use crate::toolbox::FsToolbox;

pub fn generate(image: &Image, toolbox: &dyn FsToolbox) -> Result<(), ImageError> {
    let cfg = &image.handler_config;
    let size = image
        .size
        .ok_or_else(|| ImageError::BadConfig(format!("vfat image `{}` has no size", image.name)))?;

    let label = cfg.get("label").cloned();
    if let Some(label) = &label {
        if label.len() > 11 {
            return Err(ImageError::BadConfig(format!(
                "vfat label `{label}` is longer than 11 characters"
            )));
        }
    }
    let fat_size = cfg.get("fat-size").map(|s| s.as_str());
    let extraargs = cfg.get("extraargs").map(|s| s.as_str()).unwrap_or("");
    let minimize = cfg
        .get("minimize")
        .map(|s| parse_bool(s))
        .transpose()?
        .unwrap_or(false);

    let outfile = &image.outfile;
    std::fs::File::create(outfile)
        .and_then(|f| f.set_len(size))
        .map_err(|e| ImageError::io(outfile, e))?;

    let mut args: Vec<String> = extraargs.split_whitespace().map(String::from).collect();
    if let Some(label) = &label {
        args.push("-n".into());
        args.push(label.clone());
    }
    if let Some(fat_size) = fat_size {
        args.push("-F".into());
        args.push(fat_size.into());
    }
    args.push(outfile.display().to_string());
    args.push((size / 1024).to_string());

    let arg_refs: Vec<&OsStr> = args.iter().map(|a| OsStr::new(a.as_str())).collect();
    toolbox.run("mkdosfs", &arg_refs)?;

    if image.partitions.is_empty() {
        if let Some(mountpoint) = &image.mountpoint {
            populate_from_mountpoint(outfile, Path::new(mountpoint), toolbox)?;
        }
    } else {
        for part in &image.partitions {
            let image_name = part.image.as_ref().ok_or_else(|| {
                ImageError::BadConfig(format!("vfat partition `{}` has no image", part.name))
            })?;
            let src = image.dependency_path(image_name).ok_or_else(|| ImageError::MissingChild {
                partition: part.name.clone(),
                image: image_name.clone(),
            })?;

            let target = if part.name.is_empty() {
                src.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
            } else {
                part.name.clone()
            };

            if let Some((dir, _)) = target.rsplit_once('/') {
                let mmd_target = format!("::{dir}");
                let args = [
                    OsStr::new("-DsS"),
                    OsStr::new("-i"),
                    OsStr::new(outfile.as_os_str()),
                    OsStr::new(&mmd_target),
                ];
                toolbox.run("mmd", &args)?;
            }

            let mcopy_target = format!("::{target}");
            let src_str = src.display().to_string();
            let args = [
                OsStr::new("-sp"),
                OsStr::new("-i"),
                OsStr::new(outfile.as_os_str()),
                OsStr::new(src_str.as_str()),
                OsStr::new(&mcopy_target),
            ];
            toolbox.run("mcopy", &args)?;
        }
    }

    if minimize {
        match genimage_fat::minimize_image(outfile) {
            Ok(Some(new_size)) => log::info!("minimized {} to {new_size} bytes", outfile.display()),
            Ok(None) => {}
            Err(genimage_fat::MinimizeError::NotFat32(genimage_fat::FatType::Fat12)) => {
                return Err(ImageError::Unsupported(
                    "minimize is not supported on FAT12 images".into(),
                ))
            }
            Err(e) => return Err(ImageError::Internal(format!("minimize failed: {e}"))),
        }
    }

    Ok(())
}

/// Recreates a staging directory tree inside the freshly formatted image,
/// used when the vfat image has no declared partitions (§4.5's whole-
/// mountpoint-copy fallback), one `mmd`/`mcopy` call per directory/file, in
/// top-down order.
fn populate_from_mountpoint(outfile: &Path, root: &Path, toolbox: &dyn FsToolbox) -> Result<(), ImageError> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| ImageError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| ImageError::io(&dir, e))?;
            let path = entry.path();
            let rel = path.strip_prefix(root).unwrap_or(&path);
            let image_path = format!("::{}", rel.display());

            if path.is_dir() {
                let args = [
                    OsStr::new("-DsS"),
                    OsStr::new("-i"),
                    OsStr::new(outfile.as_os_str()),
                    OsStr::new(&image_path),
                ];
                toolbox.run("mmd", &args)?;
                stack.push(path);
            } else {
                let source = path.display().to_string();
                let args = [
                    OsStr::new("-sp"),
                    OsStr::new("-i"),
                    OsStr::new(outfile.as_os_str()),
                    OsStr::new(source.as_str()),
                    OsStr::new(&image_path),
                ];
                toolbox.run("mcopy", &args)?;
            }
        }
    }
    Ok(())
}

fn parse_bool(s: &str) -> Result<bool, ImageError> {
    match s {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(ImageError::BadConfig(format!("expected a boolean, found `{other}`"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ImageKind;
    use crate::toolbox::RecordingToolbox;

    #[test]
    fn formats_image_via_mkdosfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("boot.vfat", ImageKind::Vfat, dir.path().join("boot.vfat"));
        image.size = Some(parse_size("4M").unwrap());

        let toolbox = RecordingToolbox::new();
        generate(&image, &toolbox).unwrap();

        let calls = toolbox.calls.borrow();
        assert_eq!(calls[0].0, "mkdosfs");
        assert_eq!(std::fs::metadata(&image.outfile).unwrap().len(), image.size.unwrap());
    }

    #[test]
    fn populates_source_tree_via_mmd_and_mcopy() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub").join("a.txt"), b"hi").unwrap();

        let out_dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("boot.vfat", ImageKind::Vfat, out_dir.path().join("boot.vfat"));
        image.size = Some(parse_size("4M").unwrap());
        image.mountpoint = Some(src.path().display().to_string());

        let toolbox = RecordingToolbox::new();
        generate(&image, &toolbox).unwrap();

        let calls = toolbox.calls.borrow();
        assert!(calls.iter().any(|(tool, _)| tool == "mmd"));
        assert!(calls.iter().any(|(tool, _)| tool == "mcopy"));
    }

    #[test]
    fn declared_partitions_are_copied_in_by_name() {
        use crate::model::Partition;
        use std::io::Write as _;

        let dir = tempfile::tempdir().unwrap();
        let child_path = dir.path().join("boot.bin");
        std::fs::File::create(&child_path).unwrap().write_all(b"hello").unwrap();

        let mut image = Image::new("boot.vfat", ImageKind::Vfat, dir.path().join("boot.vfat"));
        image.size = Some(parse_size("4M").unwrap());
        image.dependencies.insert("boot.bin".into(), child_path);
        image.partitions.push(Partition {
            name: "EFI/BOOT/bootarm.efi".into(),
            image: Some("boot.bin".into()),
            ..Default::default()
        });

        let toolbox = RecordingToolbox::new();
        generate(&image, &toolbox).unwrap();

        let calls = toolbox.calls.borrow();
        let mmd_call = calls.iter().find(|(tool, _)| tool == "mmd").unwrap();
        assert!(mmd_call.1.iter().any(|a| a == "::EFI/BOOT"));
        let mcopy_call = calls.iter().find(|(tool, _)| tool == "mcopy").unwrap();
        assert!(mcopy_call.1.iter().any(|a| a == "::EFI/BOOT/bootarm.efi"));
    }

    #[test]
    fn oversized_label_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("boot.vfat", ImageKind::Vfat, dir.path().join("boot.vfat"));
        image.size = Some(parse_size("4M").unwrap());
        image.handler_config.insert("label".into(), "way-too-long-label".into());

        let toolbox = RecordingToolbox::new();
        let err = generate(&image, &toolbox).unwrap_err();
        assert!(matches!(err, ImageError::BadConfig(_)));
    }

    /// Stands in for `mkdosfs` by writing a real FAT12 boot sector into the
    /// outfile instead of just recording the call, so `minimize_image` has
    /// something to parse.
    struct Fat12FormattingToolbox;

    impl FsToolbox for Fat12FormattingToolbox {
        fn find(&self, tool: &str) -> Option<std::path::PathBuf> {
            Some(std::path::PathBuf::from(format!("/fake/bin/{tool}")))
        }

        fn run(&self, tool: &str, args: &[&OsStr]) -> Result<(), ImageError> {
            if tool == "mkdosfs" {
                let outfile = Path::new(args[args.len() - 2]);
                let mut boot = [0u8; 512];
                boot[0..3].copy_from_slice(&[0xEB, 0x00, 0x90]);
                boot[11..13].copy_from_slice(&512u16.to_le_bytes());
                boot[13] = 1;
                boot[14..16].copy_from_slice(&1u16.to_le_bytes());
                boot[16] = 1;
                boot[17..19].copy_from_slice(&16u16.to_le_bytes());
                boot[19..21].copy_from_slice(&100u16.to_le_bytes());
                boot[22..24].copy_from_slice(&1u16.to_le_bytes());
                std::fs::write(outfile, boot).map_err(|e| ImageError::io(outfile, e))?;
            }
            Ok(())
        }
    }

    #[test]
    fn minimize_rejects_fat12_image() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("boot.vfat", ImageKind::Vfat, dir.path().join("boot.vfat"));
        image.size = Some(parse_size("4M").unwrap());
        image.handler_config.insert("minimize".into(), "true".into());

        let toolbox = Fat12FormattingToolbox;
        let err = generate(&image, &toolbox).unwrap_err();
        assert!(matches!(err, ImageError::Unsupported(_)));
    }

    #[test]
    fn extraargs_are_forwarded_to_mkdosfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = Image::new("boot.vfat", ImageKind::Vfat, dir.path().join("boot.vfat"));
        image.size = Some(parse_size("4M").unwrap());
        image.handler_config.insert("extraargs".into(), "-r 512".into());

        let toolbox = RecordingToolbox::new();
        generate(&image, &toolbox).unwrap();

        let calls = toolbox.calls.borrow();
        let mkdosfs_call = &calls[0];
        assert_eq!(mkdosfs_call.1[0], "-r");
        assert_eq!(mkdosfs_call.1[1], "512");
    }
}
