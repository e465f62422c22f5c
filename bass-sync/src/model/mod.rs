//! Data model shared by every engine component

pub mod ids;
pub mod metadata;
pub mod receive_state;

pub use bass_parser::BroadcastId;
pub use ids::{AddressType, AdvertisingSid, DeviceAddress, SourceId, SyncHandle};
pub use metadata::{BroadcastMetadata, HasBroadcastId};
pub use receive_state::{BigEncryption, PaSync, PaSyncState, ReceiveState, BIS_SYNC_NO_PREFERENCE};
