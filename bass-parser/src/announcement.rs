//! Advertising records and the announcements carried in them

use serde::{Deserialize, Serialize};

use crate::error::{ParseError, ParseResult};
use crate::ltv::Metadata;

/// 16-bit service UUID of the Broadcast Audio Announcement (carries the broadcast id)
pub const BROADCAST_AUDIO_ANNOUNCEMENT_UUID: u16 = 0x1852;
/// 16-bit service UUID of the Basic Audio Announcement (carries the BASE)
pub const BASIC_AUDIO_ANNOUNCEMENT_UUID: u16 = 0x1851;
/// 16-bit service UUID of the Public Broadcast Announcement
pub const PUBLIC_BROADCAST_ANNOUNCEMENT_UUID: u16 = 0x1856;
/// AD type of the Broadcast Name
pub const BROADCAST_NAME_AD_TYPE: u8 = 0x30;

/// The parts of an extended or periodic advertising payload the assistant reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisingRecord {
    service_data: Vec<(u16, Vec<u8>)>,
    broadcast_name: Option<String>,
}

impl AdvertisingRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_data(mut self, uuid: u16, data: impl Into<Vec<u8>>) -> Self {
        self.service_data.push((uuid, data.into()));
        self
    }

    pub fn with_broadcast_name(mut self, name: impl Into<String>) -> Self {
        self.broadcast_name = Some(name.into());
        self
    }

    /// Service data for `uuid`, first occurrence wins
    pub fn service_data(&self, uuid: u16) -> Option<&[u8]> {
        self.service_data
            .iter()
            .find(|(u, _)| *u == uuid)
            .map(|(_, data)| data.as_slice())
    }

    pub fn broadcast_name(&self) -> Option<&str> {
        self.broadcast_name.as_deref()
    }
}

/// Public Broadcast Announcement: feature flags and program metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicBroadcastAnnouncement {
    pub features: u8,
    pub metadata: Metadata,
}

impl PublicBroadcastAnnouncement {
    const ENCRYPTED: u8 = 0x01;
    const STANDARD_QUALITY: u8 = 0x02;
    const HIGH_QUALITY: u8 = 0x04;

    pub fn decode(buf: &[u8]) -> ParseResult<Self> {
        let [features, len, rest @ ..] = buf else {
            return Err(ParseError::UnexpectedDataLength {
                context: "public broadcast announcement",
                needed: 2,
                remaining: buf.len(),
            });
        };

        let len = *len as usize;
        if rest.len() < len {
            return Err(ParseError::UnexpectedDataLength {
                context: "public broadcast metadata",
                needed: len,
                remaining: rest.len(),
            });
        }

        Ok(Self { features: *features, metadata: Metadata::from_raw(&rest[..len]) })
    }

    pub fn is_encrypted(&self) -> bool {
        self.features & Self::ENCRYPTED != 0
    }

    pub fn has_standard_quality(&self) -> bool {
        self.features & Self::STANDARD_QUALITY != 0
    }

    pub fn has_high_quality(&self) -> bool {
        self.features & Self::HIGH_QUALITY != 0
    }
}
