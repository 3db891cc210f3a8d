/// Endianness markers and runtime-endian helpers.
pub mod endian;
/// Endian-tagged fixed-width integers (`U16`, `U32`, `U64`).
pub mod number;
