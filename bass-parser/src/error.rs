//! Error types for advertising data decoding

use thiserror::Error;

/// Errors that can occur while decoding broadcast advertising data
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A field needed more bytes than were left in the buffer
    #[error("{context}: needed {needed} bytes but only {remaining} remain")]
    UnexpectedDataLength {
        context: &'static str,
        needed: usize,
        remaining: usize,
    },

    /// The BASE declared zero subgroups
    #[error("BASE declares an invalid subgroup count: {0}")]
    InvalidSubgroupCount(u8),

    /// A subgroup declared zero BIS entries
    #[error("subgroup {subgroup} declares an invalid BIS count: {count}")]
    InvalidBisCount { subgroup: usize, count: u8 },

    /// Broadcast IDs are 24-bit values
    #[error("broadcast id {0:#x} does not fit in 24 bits")]
    BroadcastIdOutOfRange(u32),

    /// A length-prefixed field did not consume exactly what it declared
    #[error("{context}: declared {declared} bytes but consumed {consumed}")]
    LengthMismatch {
        context: &'static str,
        declared: usize,
        consumed: usize,
    },
}

/// Result type alias for decoding operations
pub type ParseResult<T> = Result<T, ParseError>;
