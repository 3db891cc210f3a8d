//! Shrinks a FAT32 image down to the last cluster actually referenced by its
//! FAT table, after `mkdosfs`/`mmd`/`mcopy` have populated it.
//!
//! Grounded on the FAT32-only assumption of the upstream `minimize` option:
//! it reads `sectors_per_fat` from the FAT32 BPB extension at byte offset 36,
//! after confirming via the BPB sanity checks and `get_type()` that the image
//! actually is FAT32.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::structures::raw::boot_sector::{FatType, RawBootSector};

#[derive(Debug, thiserror::Error)]
pub enum MinimizeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no used clusters found in FAT table, nothing to minimize")]
    NoUsedClusters,
    #[error("boot sector failed sanity check: {0}")]
    InvalidBootSector(&'static str),
    #[error("image is {0:?}, minimize only supports FAT32")]
    NotFat32(FatType),
}

/// Byte offset one past the last cluster referenced anywhere in the FAT
/// table, i.e. the smallest size the image can be truncated to without
/// losing data.
pub fn find_last_valid_pos(path: &Path) -> Result<u64, MinimizeError> {
    let mut file = File::open(path)?;

    let mut boot_sector_bytes = [0u8; 512];
    file.read_exact(&mut boot_sector_bytes)?;
    let boot_sector = RawBootSector::from_bytes(&boot_sector_bytes);

    if !boot_sector.bpb.check_jump_boot() {
        return Err(MinimizeError::InvalidBootSector("bad jump instruction"));
    }
    if !boot_sector.bpb.check_bytes_per_sector() {
        return Err(MinimizeError::InvalidBootSector("bad bytes-per-sector"));
    }
    if !boot_sector.bpb.check_sectors_per_cluster() {
        return Err(MinimizeError::InvalidBootSector("bad sectors-per-cluster"));
    }
    if !boot_sector.bpb.check_reserved_sector_count() {
        return Err(MinimizeError::InvalidBootSector("bad reserved sector count"));
    }
    if !boot_sector.bpb.check_fat_count() {
        return Err(MinimizeError::InvalidBootSector("bad FAT count"));
    }
    let fat_type = boot_sector.get_type();
    if fat_type != FatType::Fat32 {
        return Err(MinimizeError::NotFat32(fat_type));
    }

    let bytes_per_sector = u16::from_le_bytes(boot_sector.bpb.bytes_per_sector) as u64;
    let sectors_per_cluster = boot_sector.bpb.sectors_per_cluster as u64;
    let reserved_sectors = u16::from_le_bytes(boot_sector.bpb.reserved_sector_count) as u64;
    let num_fats = boot_sector.bpb.fat_count as u64;
    // SAFETY: get_type() confirmed this is the FAT32 BPB extension variant.
    let sectors_per_fat = unsafe {
        u32::from_le_bytes(boot_sector.bpb_ext.bpb32.sectors_per_fat_32) as u64
    };

    let fat_offset = reserved_sectors * bytes_per_sector;
    let fat_size_bytes = sectors_per_fat * bytes_per_sector;
    let data_region_offset = (reserved_sectors + num_fats * sectors_per_fat) * bytes_per_sector;
    let cluster_size_bytes = sectors_per_cluster * bytes_per_sector;

    let num_entries = fat_size_bytes / 4;
    let mut last_used_cluster = 0u64;

    let mut entry_buf = [0u8; 4];
    for cluster in 2..num_entries {
        file.seek(SeekFrom::Start(fat_offset + cluster * 4))?;
        file.read_exact(&mut entry_buf)?;
        let entry = u32::from_le_bytes(entry_buf) & 0x0FFF_FFFF;
        if (0x0000_0001..=0x0FFF_FFF7).contains(&entry) {
            last_used_cluster = cluster;
        }
    }

    if last_used_cluster == 0 {
        return Err(MinimizeError::NoUsedClusters);
    }

    Ok(data_region_offset + last_used_cluster * cluster_size_bytes)
}

/// Truncates the image at `path` down to its last used cluster, if that's
/// smaller than its current size. Returns the new size, or `None` if the
/// image was already minimal.
pub fn minimize_image(path: &Path) -> Result<Option<u64>, MinimizeError> {
    let last_pos = find_last_valid_pos(path)?;
    let current_size = std::fs::metadata(path)?.len();

    if last_pos < current_size {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(last_pos)?;
        log::info!("minimized image to {last_pos} bytes (0x{last_pos:x})");
        Ok(Some(last_pos))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Builds a minimal FAT32 image: one boot sector, one FAT with clusters
    /// 2 and 3 marked in-use, then pads out past the data region so
    /// truncation has something to cut.
    fn fake_fat32_image() -> tempfile::NamedTempFile {
        const BYTES_PER_SECTOR: u16 = 512;
        const SECTORS_PER_CLUSTER: u8 = 1;
        const RESERVED_SECTORS: u16 = 32;
        const NUM_FATS: u8 = 1;
        const SECTORS_PER_FAT: u32 = 8;

        let mut boot = [0u8; 512];
        boot[0..3].copy_from_slice(&[0xEB, 0x00, 0x90]);
        boot[11..13].copy_from_slice(&BYTES_PER_SECTOR.to_le_bytes());
        boot[13] = SECTORS_PER_CLUSTER;
        boot[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
        boot[16] = NUM_FATS;
        boot[36..40].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&boot).unwrap();

        let fat_offset = RESERVED_SECTORS as u64 * BYTES_PER_SECTOR as u64;
        let fat_size = SECTORS_PER_FAT as u64 * BYTES_PER_SECTOR as u64;
        let mut fat = vec![0u8; fat_size as usize];
        fat[2 * 4..2 * 4 + 4].copy_from_slice(&0x0FFF_FFF8u32.to_le_bytes());
        fat[3 * 4..3 * 4 + 4].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        file.as_file_mut()
            .seek(SeekFrom::Start(fat_offset))
            .unwrap();
        file.write_all(&fat).unwrap();

        let data_region_offset = fat_offset + fat_size;
        let tail = vec![0u8; 64 * 1024];
        file.as_file_mut()
            .seek(SeekFrom::Start(data_region_offset + tail.len() as u64 - 1))
            .unwrap();
        file.write_all(&[0u8]).unwrap();

        file
    }

    #[test]
    fn finds_last_used_cluster() {
        let file = fake_fat32_image();
        let pos = find_last_valid_pos(file.path()).unwrap();

        let reserved_sectors = 32u64;
        let sectors_per_fat = 8u64;
        let data_region_offset = (reserved_sectors + sectors_per_fat) * 512;
        assert_eq!(pos, data_region_offset + 3 * 512);
    }

    #[test]
    fn minimizes_to_last_used_cluster() {
        let file = fake_fat32_image();
        let before = std::fs::metadata(file.path()).unwrap().len();
        let new_size = minimize_image(file.path()).unwrap().unwrap();
        let after = std::fs::metadata(file.path()).unwrap().len();

        assert!(new_size < before);
        assert_eq!(after, new_size);
    }

    #[test]
    fn reports_empty_fat() {
        const BYTES_PER_SECTOR: u16 = 512;
        let mut boot = [0u8; 512];
        boot[0..3].copy_from_slice(&[0xEB, 0x00, 0x90]);
        boot[11..13].copy_from_slice(&BYTES_PER_SECTOR.to_le_bytes());
        boot[13] = 1;
        boot[14..16].copy_from_slice(&32u16.to_le_bytes());
        boot[16] = 1;
        boot[36..40].copy_from_slice(&1u32.to_le_bytes());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&boot).unwrap();
        file.write_all(&vec![0u8; 512]).unwrap();

        let err = find_last_valid_pos(file.path()).unwrap_err();
        assert!(matches!(err, MinimizeError::NoUsedClusters));
    }

    #[test]
    fn rejects_bad_jump_instruction() {
        let mut file = fake_fat32_image();
        file.as_file_mut().seek(SeekFrom::Start(0)).unwrap();
        file.write_all(&[0x00, 0x00, 0x00]).unwrap();

        let err = find_last_valid_pos(file.path()).unwrap_err();
        assert!(matches!(err, MinimizeError::InvalidBootSector(_)));
    }

    #[test]
    fn rejects_fat16_image() {
        let mut file = fake_fat32_image();
        // FAT16 images carry their FAT size at offset 22, not 36; zeroing
        // the FAT32-only field makes get_type() fall through to FAT16/12.
        file.as_file_mut().seek(SeekFrom::Start(32)).unwrap();
        file.write_all(&1000u32.to_le_bytes()).unwrap();
        file.as_file_mut().seek(SeekFrom::Start(36)).unwrap();
        file.write_all(&0u32.to_le_bytes()).unwrap();
        file.as_file_mut().seek(SeekFrom::Start(22)).unwrap();
        file.write_all(&8u16.to_le_bytes()).unwrap();

        let err = find_last_valid_pos(file.path()).unwrap_err();
        assert!(matches!(err, MinimizeError::NotFat32(_)));
    }
}
