//! 24-bit broadcast identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};

/// Identifier carried in the Broadcast Audio Announcement service data.
///
/// Only the lower 24 bits are meaningful and the value is sent little-endian
/// on the air. An unknown broadcast is represented as `Option<BroadcastId>`
/// rather than with a sentinel value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BroadcastId(u32);

impl BroadcastId {
    /// Encoded size on the air
    pub const BYTE_SIZE: usize = 3;

    /// Largest representable id
    pub const MAX: u32 = 0x00FF_FFFF;

    pub fn new(raw: u32) -> ParseResult<Self> {
        Self::try_from(raw)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Decode from the first three bytes of `buf`
    pub fn decode(buf: &[u8]) -> ParseResult<Self> {
        match buf {
            [b0, b1, b2, ..] => Ok(Self(u32::from_le_bytes([*b0, *b1, *b2, 0]))),
            _ => Err(ParseError::UnexpectedDataLength {
                context: "broadcast id",
                needed: Self::BYTE_SIZE,
                remaining: buf.len(),
            }),
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        let [b0, b1, b2, _] = self.0.to_le_bytes();
        [b0, b1, b2]
    }
}

impl TryFrom<u32> for BroadcastId {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        if value > Self::MAX {
            return Err(ParseError::BroadcastIdOutOfRange(value));
        }
        Ok(Self(value))
    }
}

impl From<BroadcastId> for u32 {
    fn from(value: BroadcastId) -> Self {
        value.0
    }
}

impl fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#08x}", self.0)
    }
}
