/// Fixed-width UTF-16LE string fields, as used by GPT partition names.
pub mod utf16;
