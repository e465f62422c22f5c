//! # bass-parser
//!
//! Decoders for the LE Audio broadcast advertising structures a Broadcast
//! Audio Scan Service assistant consumes: the broadcast id, the Public
//! Broadcast Announcement, the Broadcast Name and the Broadcast Audio
//! Source Endpoint (BASE).
//!
//! ## Usage
//!
//! ```rust
//! use bass_parser::{AdvertisingRecord, BaseDecoder};
//!
//! let record = AdvertisingRecord::new().with_service_data(0x1852, [0x56, 0x34, 0x12]);
//! let id = BaseDecoder::broadcast_id(&record).unwrap().unwrap();
//! assert_eq!(id.value(), 0x123456);
//! ```

pub mod announcement;
pub mod base;
pub mod broadcast_id;
pub mod decoder;
pub mod error;
pub mod ltv;

pub use announcement::{AdvertisingRecord, PublicBroadcastAnnouncement};
pub use base::{Base, Bis, CodecId, Subgroup};
pub use broadcast_id::BroadcastId;
pub use decoder::{BaseDecoder, DecodeOutcome};
pub use error::{ParseError, ParseResult};
pub use ltv::{CodecConfiguration, Ltv, Metadata};
