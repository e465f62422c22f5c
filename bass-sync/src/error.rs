//! Error types for the broadcast sync engine

use bass_parser::{BroadcastId, ParseError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::DeviceAddress;

/// Reason attached to a failed add, modify or remove notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// The local controller could not give the broadcast a sync slot
    LocalNotEnoughResources,
    /// The request itself was invalid
    BadParameters,
    /// The receiver was not reachable
    RemoteLinkError,
    /// The receiver had no receive state left for the source
    RemoteNotEnoughResources,
}

/// Errors that can occur inside the sync engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Advertising data could not be decoded
    #[error("malformed advertising data: {0}")]
    MalformedAdvertisingData(#[from] ParseError),

    /// The controller reported a failed periodic advertising sync
    #[error("sync establishment failed for broadcast {broadcast_id} with status {status}")]
    SyncEstablishmentFailure {
        broadcast_id: BroadcastId,
        status: u8,
    },

    /// The operation named a source or device that does not exist
    #[error("invalid operation target: {0}")]
    InvalidOperationTarget(String),

    /// The receiver is not connected
    #[error("receiver {0} is not connected")]
    LinkUnavailable(DeviceAddress),

    /// Every sync slot is held by a higher-ranked broadcast
    #[error("all {capacity} sync slots are in use")]
    ResourceExhausted { capacity: usize },

    /// The receiver has no free receive state
    #[error("receiver {0} has no free receive state")]
    RemoteResourceExhausted(DeviceAddress),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The engine worker is no longer running
    #[error("engine worker has shut down")]
    WorkerDisconnected,
}

impl SyncError {
    /// Reason reported to the caller when this error fails an operation
    pub fn reason(&self) -> FailureReason {
        match self {
            SyncError::SyncEstablishmentFailure { .. }
            | SyncError::ResourceExhausted { .. }
            | SyncError::WorkerDisconnected => FailureReason::LocalNotEnoughResources,
            SyncError::MalformedAdvertisingData(_)
            | SyncError::InvalidOperationTarget(_)
            | SyncError::Configuration(_) => FailureReason::BadParameters,
            SyncError::LinkUnavailable(_) => FailureReason::RemoteLinkError,
            SyncError::RemoteResourceExhausted(_) => FailureReason::RemoteNotEnoughResources,
        }
    }
}

/// Result type for sync engine operations
pub type Result<T> = std::result::Result<T, SyncError>;
