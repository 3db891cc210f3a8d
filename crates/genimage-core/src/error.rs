use std::path::PathBuf;

/// The engine-wide error type. Every handler and the config layer funnel
/// their failures through one of these variants so a caller can match on
/// kind without caring which stage produced it.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("{0}")]
    BadConfig(String),
    #[error("{0}")]
    BadSize(String),
    #[error(
        "partition `{a_name}` (0x{a_offset:x}..0x{a_end:x}) overlaps `{b_name}` (0x{b_offset:x}..0x{b_end:x})"
    )]
    Overlap {
        a_name: String,
        a_offset: u64,
        a_end: u64,
        b_name: String,
        b_offset: u64,
        b_end: u64,
    },
    #[error("partition `{partition}` references unknown image `{image}`")]
    MissingChild { partition: String, image: String },
    #[error(
        "partition `{partition}` is too small for its content: slot is {slot_size} bytes, content is {content_size} bytes"
    )]
    SizeOverflow {
        partition: String,
        slot_size: u64,
        content_size: u64,
    },
    #[error("{0}")]
    Unsupported(String),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl ImageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
