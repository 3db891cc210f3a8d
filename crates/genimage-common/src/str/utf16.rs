use crate::types::{
    endian::{Endian, LittleEndian},
    number::U16,
};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FixedUtf16Str<const N: usize> {
    data: [U16<LittleEndian>; N],
}

impl<const N: usize> FixedUtf16Str<N> {
    pub fn to_string(&self) -> Result<String, ()> {
        // For now we just take the lower u8 of each character
        let data = self.data.iter().map(|c| c.get() as u8).collect::<Vec<u8>>();
        String::from_utf8(data).map_err(|_| ())
    }

    pub fn from_units(data: [U16<LittleEndian>; N]) -> Self {
        Self { data }
    }
}

impl<const N: usize> Default for FixedUtf16Str<N> {
    fn default() -> Self {
        Self {
            data: [U16::new(0); N],
        }
    }
}

unsafe impl<const N: usize> bytemuck::Pod for FixedUtf16Str<N> {}
unsafe impl<const N: usize> bytemuck::Zeroable for FixedUtf16Str<N> {}
