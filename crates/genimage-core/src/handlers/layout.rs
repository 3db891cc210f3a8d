//! The two-pass layout/emit split used by both the hdimage and kdimage
//! handlers.
//!
//! Pass A (each handler's own `layout` function) turns a declarative
//! partition list into a finalized, ordered list of `Slot`s with resolved
//! absolute offsets. Pass B (`write_slots`, shared here) is the only code
//! that touches the output file.
//!
//! This replaces the upstream tool's `setup()`, which both validates and
//! mutates `image.partitions` in place by appending bookkeeping entries
//! (`[MBR]`, `[GPT header]`, `[TOC]`) as it goes.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::error::ImageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadPolicy {
    Zero,
    ErasedFlash,
}

impl PadPolicy {
    pub fn byte(self) -> u8 {
        match self {
            PadPolicy::Zero => 0x00,
            PadPolicy::ErasedFlash => 0xFF,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SlotBody {
    /// Nothing to copy; the region is left at the pad byte.
    Empty,
    /// Raw bytes generated in memory (an MBR tail, a GPT header, a TOC
    /// block).
    Bytes(Vec<u8>),
    /// Copy the full contents of a file on disk (a child image).
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub struct Slot {
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub body: SlotBody,
}

/// Writes every slot into `outfile`, padding the whole file out to
/// `total_size` bytes with `pad.byte()` first.
pub fn write_slots(
    outfile: &std::path::Path,
    total_size: u64,
    slots: &[Slot],
    pad: PadPolicy,
) -> Result<(), ImageError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(outfile)
        .map_err(|e| ImageError::io(outfile, e))?;

    file.set_len(total_size).map_err(|e| ImageError::io(outfile, e))?;
    if pad.byte() != 0x00 {
        fill(&mut file, outfile, total_size, pad.byte())?;
    }

    for slot in slots {
        write_slot(&mut file, outfile, slot)?;
    }

    file.sync_all().map_err(|e| ImageError::io(outfile, e))?;
    Ok(())
}

fn fill(file: &mut File, path: &std::path::Path, total_size: u64, byte: u8) -> Result<(), ImageError> {
    const CHUNK: usize = 64 * 1024;
    let buf = vec![byte; CHUNK];
    file.seek(SeekFrom::Start(0)).map_err(|e| ImageError::io(path, e))?;
    let mut remaining = total_size;
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        file.write_all(&buf[..n]).map_err(|e| ImageError::io(path, e))?;
        remaining -= n as u64;
    }
    Ok(())
}

fn write_slot(file: &mut File, outfile: &std::path::Path, slot: &Slot) -> Result<(), ImageError> {
    file.seek(SeekFrom::Start(slot.offset))
        .map_err(|e| ImageError::io(outfile, e))?;

    match &slot.body {
        SlotBody::Empty => {}
        SlotBody::Bytes(bytes) => {
            if bytes.len() as u64 > slot.size {
                return Err(ImageError::SizeOverflow {
                    partition: slot.name.clone(),
                    slot_size: slot.size,
                    content_size: bytes.len() as u64,
                });
            }
            file.write_all(bytes).map_err(|e| ImageError::io(outfile, e))?;
        }
        SlotBody::File(path) => {
            let content_size = std::fs::metadata(path)
                .map_err(|e| ImageError::io(path, e))?
                .len();
            if content_size > slot.size {
                return Err(ImageError::SizeOverflow {
                    partition: slot.name.clone(),
                    slot_size: slot.size,
                    content_size,
                });
            }
            let mut src = File::open(path).map_err(|e| ImageError::io(path, e))?;
            std::io::copy(&mut src, file).map_err(|e| ImageError::io(outfile, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_slots_at_their_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let outfile = dir.path().join("out.img");
        let slots = vec![
            Slot {
                name: "a".into(),
                offset: 0,
                size: 4,
                body: SlotBody::Bytes(vec![1, 2, 3, 4]),
            },
            Slot {
                name: "b".into(),
                offset: 8,
                size: 4,
                body: SlotBody::Bytes(vec![9, 9, 9, 9]),
            },
        ];
        write_slots(&outfile, 16, &slots, PadPolicy::Zero).unwrap();
        let data = std::fs::read(&outfile).unwrap();
        assert_eq!(&data[0..4], &[1, 2, 3, 4]);
        assert_eq!(&data[4..8], &[0, 0, 0, 0]);
        assert_eq!(&data[8..12], &[9, 9, 9, 9]);
        assert_eq!(data.len(), 16);
    }

    #[test]
    fn oversized_slot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outfile = dir.path().join("out.img");
        let slots = vec![Slot {
            name: "a".into(),
            offset: 0,
            size: 2,
            body: SlotBody::Bytes(vec![1, 2, 3, 4]),
        }];
        let err = write_slots(&outfile, 16, &slots, PadPolicy::Zero).unwrap_err();
        assert!(matches!(err, ImageError::SizeOverflow { .. }));
    }

    #[test]
    fn erased_flash_pads_with_0xff() {
        let dir = tempfile::tempdir().unwrap();
        let outfile = dir.path().join("out.img");
        write_slots(&outfile, 8, &[], PadPolicy::ErasedFlash).unwrap();
        let data = std::fs::read(&outfile).unwrap();
        assert_eq!(data, vec![0xFFu8; 8]);
    }
}
