//! Broadcast Receive State as reported by a receiver

use bass_parser::BroadcastId;
use serde::{Deserialize, Serialize};

use super::ids::{DeviceAddress, SourceId};

/// BIS sync value meaning "no preference" in requests and "failed" in reports
pub const BIS_SYNC_NO_PREFERENCE: u32 = 0xFFFF_FFFF;

/// Receiver's periodic advertising sync state for one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaSyncState {
    Idle,
    /// The receiver asks the assistant for a sync transfer
    SyncInfoRequest,
    Synchronized,
    FailedToSync,
    NoPast,
}

/// Receiver's BIG encryption state for one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BigEncryption {
    #[default]
    NotEncrypted,
    CodeRequired,
    Decrypting,
    BadCode,
}

/// PA sync request an assistant sends along with a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaSync {
    DoNotSync,
    SyncPastAvailable,
    SyncPastNotAvailable,
}

/// One receive state slot on a receiver
///
/// An empty slot has no broadcast id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveState {
    pub source_id: SourceId,
    pub source_device: Option<DeviceAddress>,
    pub broadcast_id: Option<BroadcastId>,
    pub pa_sync_state: PaSyncState,
    pub bis_sync_state: Vec<u32>,
    pub big_encryption: BigEncryption,
}

impl ReceiveState {
    pub fn empty(source_id: SourceId) -> Self {
        Self {
            source_id,
            source_device: None,
            broadcast_id: None,
            pa_sync_state: PaSyncState::Idle,
            bis_sync_state: Vec::new(),
            big_encryption: BigEncryption::NotEncrypted,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.broadcast_id.is_none()
    }

    pub fn is_pa_synced(&self) -> bool {
        self.pa_sync_state == PaSyncState::Synchronized
    }

    pub fn is_bis_synced(&self) -> bool {
        self.bis_sync_state
            .iter()
            .any(|&mask| mask != 0 && mask != BIS_SYNC_NO_PREFERENCE)
    }

    /// Whether the receiver is following the source in any way
    pub fn is_synced(&self) -> bool {
        self.is_pa_synced() || self.is_bis_synced()
    }
}
