//! Structures for the FAT32 file system.
//!
//! The actual filesystem content is created by shelling out to `mkdosfs`,
//! `mmd`, and `mcopy` (see the `minimize` module's caller in genimage-core);
//! what lives here is just enough of the on-disk layout to read a boot
//! sector back and walk its FAT table, which is what the minimize step
//! needs.

use core::str;

pub mod raw;

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FatStr<const N: usize> {
    pub raw: [u8; N],
}

impl<const N: usize> core::fmt::Debug for FatStr<N> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let str = str::from_utf8(&self.raw).unwrap();
        f.debug_struct("FatStr")
            .field("max_len", &Self::MAX_LEN)
            .field("str", &str)
            .finish()
    }
}

impl<const N: usize> Default for FatStr<N> {
    fn default() -> Self {
        Self {
            // Fat often uses spaces for padding
            raw: [b' '; N],
        }
    }
}

impl<const N: usize> FatStr<N> {
    pub const MAX_LEN: usize = N;

    pub fn new_truncate(s: &str) -> Self {
        // TODO: We need to convert everything to uppercase
        if s.len() > N {
            Self::from_slice_unchecked(&s.as_bytes()[..N])
        } else {
            Self::from_slice_unchecked(s.as_bytes())
        }
    }

    pub fn clear(&mut self) {
        self.raw = [b' '; N];
    }

    pub fn try_new(s: &str) -> Result<Self, ()> {
        if s.len() > N {
            return Err(());
        }

        Ok(Self::from_slice_unchecked(s.as_bytes()))
    }

    pub fn from_bytes(bytes: [u8; N]) -> Self {
        Self::from_slice_unchecked(&bytes)
    }

    pub fn from_slice_unchecked(slice: &[u8]) -> Self {
        let mut str = Self::default();
        str.raw[..slice.len()].copy_from_slice(slice);
        str
    }

    pub fn len(&self) -> usize {
        self.raw
            .iter()
            .position(|b| *b == b' ')
            .unwrap_or(Self::MAX_LEN)
    }

    pub fn as_str(&self) -> &str {
        str::from_utf8(&self.raw).unwrap()
    }

    pub fn as_slice(&self) -> &[u8; N] {
        &self.raw
    }

    pub fn copy_from_slice(&mut self, slice: &[u8]) {
        self.raw[..slice.len()].copy_from_slice(slice);
    }
}

unsafe impl<const N: usize> bytemuck::Zeroable for FatStr<N> {}
unsafe impl<const N: usize> bytemuck::NoUninit for FatStr<N> {}
unsafe impl<const N: usize> bytemuck::AnyBitPattern for FatStr<N> {}
