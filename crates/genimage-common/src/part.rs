/// MBR partition tables, CHS geometry, and the historical partition type byte codes.
pub mod mbr;
/// GPT headers, partition entries, and well-known partition type GUIDs.
pub mod gpt;
/// Partition type GUID aliases recognized in configuration files.
pub mod gpt_types;
/// The fixed-record table-of-contents format used by hdimage and kdimage outputs.
pub mod toc;
