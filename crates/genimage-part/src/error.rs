use genimage_common::part::gpt::Guid;

#[derive(Debug, thiserror::Error)]
pub enum PartError {
    #[error("partition table supports at most {max} entries, got {got}")]
    TooManyPartitions { max: usize, got: usize },
    #[error("hybrid MBR supports at most 3 partitions in the legacy table, got {got}")]
    TooManyHybridPartitions { got: usize },
    #[error("partition type alias `{0}` is not a recognized GPT partition type")]
    UnknownPartitionTypeAlias(String),
    #[error("invalid GUID string `{0}`")]
    InvalidGuid(String),
    #[error("disk is too small: need at least {needed} bytes, have {have}")]
    DiskTooSmall { needed: u64, have: u64 },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartError {
    pub fn resolve_type(
        alias_or_guid: &str,
        default: Guid,
    ) -> Result<Guid, PartError> {
        if alias_or_guid.is_empty() {
            return Ok(default);
        }
        if let Ok(uuid) = uuid::Uuid::parse_str(alias_or_guid) {
            return Ok(Guid::from_uuid(uuid));
        }
        genimage_common::part::gpt_types::lookup_partition_type_alias(alias_or_guid)
            .ok_or_else(|| PartError::UnknownPartitionTypeAlias(alias_or_guid.to_string()))
    }
}
