use thiserror::Error;

/// Errors produced by type construction and validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error(
        "invalid channel count {0}: must be a power of two in [1, {max}]",
        max = crate::ids::ChannelCount::MAX
    )]
    InvalidChannelCount(u32),

    #[error("channel index {index} out of range for {count} channels")]
    ChannelIndexOutOfRange { index: u32, count: u32 },
}
