//! Inputs to and outputs from the engine
//!
//! Every stimulus, whether it comes from the radio, a receiver, a timer or
//! the application, is an [`Event`]. The engine reports back to the
//! application with [`Notification`]s.

use bass_parser::{AdvertisingRecord, Base, BroadcastId};

use crate::error::FailureReason;
use crate::model::{
    AddressType, AdvertisingSid, BroadcastMetadata, DeviceAddress, ReceiveState, SourceId,
    SyncHandle,
};
use crate::timeouts::TimeoutKind;
use crate::transport::{ScanFilter, ScanResult, SyncStatus};

/// Everything the engine reacts to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ScanResult(ScanResult),
    SyncEstablished {
        sync_handle: SyncHandle,
        device: DeviceAddress,
        address_type: AddressType,
        advertising_sid: AdvertisingSid,
        pa_interval: u16,
        status: SyncStatus,
    },
    SyncLost {
        sync_handle: SyncHandle,
    },
    PeriodicAdvertisingReport {
        sync_handle: SyncHandle,
        record: AdvertisingRecord,
    },
    BigInfoReport {
        sync_handle: SyncHandle,
        encrypted: bool,
    },
    ReceiveStateChanged {
        device: DeviceAddress,
        state: ReceiveState,
    },
    ConnectionStateChanged {
        device: DeviceAddress,
        connected: bool,
    },
    TimerFired {
        broadcast_id: BroadcastId,
        kind: TimeoutKind,
        generation: u64,
    },
    Operation(Operation),
}

impl From<Operation> for Event {
    fn from(op: Operation) -> Self {
        Event::Operation(op)
    }
}

/// Requests from the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    StartSearching {
        filters: Vec<ScanFilter>,
    },
    StopSearching,
    AddSource {
        device: DeviceAddress,
        metadata: BroadcastMetadata,
        is_group_op: bool,
    },
    ModifySource {
        device: DeviceAddress,
        source_id: SourceId,
        metadata: BroadcastMetadata,
    },
    RemoveSource {
        device: DeviceAddress,
        source_id: SourceId,
    },
    SwitchSource {
        device: DeviceAddress,
        old_source_id: SourceId,
        metadata: BroadcastMetadata,
    },
    SuspendReceivers {
        broadcast_id: BroadcastId,
    },
    SuspendAllReceivers,
    ResumeReceivers,
    StopReceivers {
        broadcast_id: BroadcastId,
    },
}

/// Callbacks delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    SearchStarted,
    SearchStopped,
    SourceFound(BroadcastMetadata),
    SourceAdded {
        device: DeviceAddress,
        source_id: SourceId,
        broadcast_id: BroadcastId,
    },
    SourceAddFailed {
        device: DeviceAddress,
        metadata: BroadcastMetadata,
        reason: FailureReason,
    },
    SourceModifyFailed {
        device: DeviceAddress,
        source_id: SourceId,
        reason: FailureReason,
    },
    SourceRemoveFailed {
        device: DeviceAddress,
        source_id: SourceId,
        reason: FailureReason,
    },
    SourceLost {
        broadcast_id: BroadcastId,
    },
}

/// Read-only questions answered from engine state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    ActiveSyncedSources,
    DeviceForSyncHandle(SyncHandle),
    BroadcastIdForSyncHandle(SyncHandle),
    Base(SyncHandle),
    IsSearching,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryReply {
    SyncHandles(Vec<SyncHandle>),
    Device(Option<DeviceAddress>),
    BroadcastId(Option<BroadcastId>),
    Base(Option<Base>),
    Searching(bool),
}
