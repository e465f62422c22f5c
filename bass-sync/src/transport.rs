//! Collaborators the engine drives
//!
//! The engine never talks to a radio or a GATT client itself. It calls
//! these traits from its worker thread and learns about results through
//! [`Event`](crate::event::Event)s fed back in.

use std::time::Duration;

use bass_parser::{AdvertisingRecord, BroadcastId};
use serde::{Deserialize, Serialize};

use crate::model::{
    AddressType, AdvertisingSid, BroadcastMetadata, DeviceAddress, PaSync, ReceiveState, SourceId,
    SyncHandle,
};

/// Filter handed to the scanner when searching starts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub broadcast_id: Option<BroadcastId>,
    pub broadcast_name: Option<String>,
    pub device: Option<DeviceAddress>,
}

/// Extended advertising report from the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    pub device: DeviceAddress,
    pub address_type: AddressType,
    pub advertising_sid: AdvertisingSid,
    pub rssi: i8,
    pub pa_interval: Option<u16>,
    pub record: AdvertisingRecord,
}

/// Request to create a periodic advertising sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub broadcast_id: BroadcastId,
    pub device: DeviceAddress,
    pub address_type: AddressType,
    pub advertising_sid: AdvertisingSid,
    pub skip: u16,
    pub timeout: Duration,
}

/// Identity of a registered sync, used to cancel or terminate it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncTarget {
    pub device: DeviceAddress,
    pub advertising_sid: AdvertisingSid,
    /// Present once the sync was established
    pub sync_handle: Option<SyncHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Success,
    Failure(u8),
}

/// Messages the engine sends to a receiver's Broadcast Audio Scan Service client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiverMessage {
    AddSource {
        source_id: SourceId,
        metadata: BroadcastMetadata,
        pa_sync: PaSync,
    },
    UpdateSource {
        source_id: SourceId,
        metadata: Option<BroadcastMetadata>,
        pa_sync: PaSync,
    },
    RemoveSource {
        source_id: SourceId,
    },
    SwitchSource {
        old_source_id: SourceId,
        metadata: BroadcastMetadata,
        pa_sync: PaSync,
    },
    StartScanOffload,
    StopScanOffload,
    InitiatePaSyncTransfer {
        sync_handle: SyncHandle,
        source_id: SourceId,
    },
    ReachedMaxSourceLimit {
        broadcast_id: BroadcastId,
    },
}

/// LE scanner and periodic sync manager
pub trait ScanTransport: Send {
    fn start_scan(&mut self, filters: &[ScanFilter]);

    fn stop_scan(&mut self);

    /// Ask the controller to sync. The result arrives as `Event::SyncEstablished`.
    fn register_sync(&mut self, request: &SyncRequest);

    /// Cancel a pending sync or terminate an established one
    fn unregister_sync(&mut self, target: &SyncTarget);
}

/// Per-receiver Broadcast Audio Scan Service clients
pub trait ReceiverStateMachines: Send {
    fn send_message(&mut self, device: &DeviceAddress, message: ReceiverMessage);

    /// Every receive state slot of `device`, empty ones included
    fn all_sources(&self, device: &DeviceAddress) -> Vec<ReceiveState>;

    fn current_broadcast_metadata(
        &self,
        device: &DeviceAddress,
        source_id: SourceId,
    ) -> Option<BroadcastMetadata>;

    fn is_synced_to_source(&self, device: &DeviceAddress, source_id: SourceId) -> bool;

    fn connected_devices(&self) -> Vec<DeviceAddress>;

    fn is_connected(&self, device: &DeviceAddress) -> bool {
        self.connected_devices().contains(device)
    }
}

/// Coordinated-set membership of receivers
pub trait GroupMembership: Send {
    /// Members of the group `device` belongs to, `device` included; empty if ungrouped
    fn group_devices(&self, device: &DeviceAddress) -> Vec<DeviceAddress>;
}

/// Broadcasts this host is transmitting itself
pub trait LocalBroadcastSource: Send {
    fn active_broadcast_ids(&self) -> Vec<BroadcastId>;

    fn is_playing(&self, broadcast_id: BroadcastId) -> bool;
}

/// Group membership for hosts without coordinated sets
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGroups;

impl GroupMembership for NoGroups {
    fn group_devices(&self, _device: &DeviceAddress) -> Vec<DeviceAddress> {
        Vec::new()
    }
}

/// Local broadcast source for hosts that never broadcast
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocalBroadcast;

impl LocalBroadcastSource for NoLocalBroadcast {
    fn active_broadcast_ids(&self) -> Vec<BroadcastId> {
        Vec::new()
    }

    fn is_playing(&self, _broadcast_id: BroadcastId) -> bool {
        false
    }
}
