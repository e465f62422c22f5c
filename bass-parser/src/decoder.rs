//! Stateless decoding of the fields the sync engine reads from advertising

use crate::announcement::{
    AdvertisingRecord, PublicBroadcastAnnouncement, BASIC_AUDIO_ANNOUNCEMENT_UUID,
    BROADCAST_AUDIO_ANNOUNCEMENT_UUID, PUBLIC_BROADCAST_ANNOUNCEMENT_UUID,
};
use crate::base::Base;
use crate::broadcast_id::BroadcastId;
use crate::error::{ParseError, ParseResult};

/// Result of decoding a BASE from a fresh periodic advertising report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The report carried a well-formed BASE
    Updated(Base),
    /// The report carried a malformed BASE; whatever was known before stays valid
    Retained(ParseError),
    /// The report carried no Basic Audio Announcement
    NoBase,
}

/// Decoder for broadcast announcements. Holds no state.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseDecoder;

impl BaseDecoder {
    /// Broadcast id from the Broadcast Audio Announcement, `None` if absent
    pub fn broadcast_id(record: &AdvertisingRecord) -> ParseResult<Option<BroadcastId>> {
        record
            .service_data(BROADCAST_AUDIO_ANNOUNCEMENT_UUID)
            .map(BroadcastId::decode)
            .transpose()
    }

    pub fn public_broadcast(
        record: &AdvertisingRecord,
    ) -> ParseResult<Option<PublicBroadcastAnnouncement>> {
        record
            .service_data(PUBLIC_BROADCAST_ANNOUNCEMENT_UUID)
            .map(PublicBroadcastAnnouncement::decode)
            .transpose()
    }

    pub fn broadcast_name(record: &AdvertisingRecord) -> Option<String> {
        record.broadcast_name().map(str::to_owned)
    }

    /// BASE from the Basic Audio Announcement, `None` if absent
    pub fn base(record: &AdvertisingRecord) -> ParseResult<Option<Base>> {
        record
            .service_data(BASIC_AUDIO_ANNOUNCEMENT_UUID)
            .map(Base::decode)
            .transpose()
    }

    /// Decode a BASE without ever discarding a previously valid one
    pub fn refresh(record: &AdvertisingRecord) -> DecodeOutcome {
        match Self::base(record) {
            Ok(Some(base)) => DecodeOutcome::Updated(base),
            Ok(None) => DecodeOutcome::NoBase,
            Err(e) => DecodeOutcome::Retained(e),
        }
    }
}
