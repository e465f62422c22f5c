//! Recording fakes for the engine's collaborators
//!
//! Every fake is a cheap clone around shared state, so a test keeps one
//! handle for assertions and gives another to the controller.

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use bass_parser::announcement::{BASIC_AUDIO_ANNOUNCEMENT_UUID, BROADCAST_AUDIO_ANNOUNCEMENT_UUID};
use bass_parser::{AdvertisingRecord, BroadcastId};
use parking_lot::Mutex;

use crate::clock::ManualClock;
use crate::config::SyncConfig;
use crate::controller::{BroadcastLifecycleController, Collaborators};
use crate::event::{Event, Notification, Operation};
use crate::model::{
    AddressType, AdvertisingSid, BigEncryption, BroadcastMetadata, DeviceAddress, PaSyncState,
    ReceiveState, SourceId, SyncHandle,
};
use crate::transport::{
    GroupMembership, LocalBroadcastSource, ReceiverMessage, ReceiverStateMachines, ScanFilter,
    ScanResult, ScanTransport, SyncRequest, SyncStatus, SyncTarget,
};

/// Advertising SID every fixture broadcaster uses
pub const FIXTURE_SID: AdvertisingSid = AdvertisingSid(1);

/// BASE with one LC3 subgroup carrying BIS 1, 40 ms presentation delay
pub const MINIMAL_BASE: [u8; 14] = [
    0x40, 0x9C, 0x00, // presentation delay
    0x01, // subgroups
    0x01, // BIS in subgroup
    0x06, 0x00, 0x00, 0x00, 0x00, // LC3
    0x00, // codec configuration
    0x00, // metadata
    0x01, 0x00, // BIS 1, no configuration
];

/// Broadcaster address derived from the broadcast id
pub fn broadcaster(broadcast_id: BroadcastId) -> DeviceAddress {
    let [b0, b1, b2] = broadcast_id.to_bytes();
    DeviceAddress::new(format!("BC:00:00:{b2:02X}:{b1:02X}:{b0:02X}"))
}

/// Receiver address `AA:AA:AA:AA:AA:<last>`
pub fn receiver(last: u8) -> DeviceAddress {
    DeviceAddress::new(format!("AA:AA:AA:AA:AA:{last:02X}"))
}

pub fn metadata_for(broadcast_id: BroadcastId) -> BroadcastMetadata {
    BroadcastMetadata::new(
        broadcaster(broadcast_id),
        AddressType::Public,
        FIXTURE_SID,
        broadcast_id,
    )
}

/// Receive state for a fixture broadcast with a single subgroup mask
pub fn receive_state(
    source_id: u8,
    broadcast_id: BroadcastId,
    pa_sync_state: PaSyncState,
    bis_mask: u32,
) -> ReceiveState {
    ReceiveState {
        source_id: SourceId(source_id),
        source_device: Some(broadcaster(broadcast_id)),
        broadcast_id: Some(broadcast_id),
        pa_sync_state,
        bis_sync_state: vec![bis_mask],
        big_encryption: BigEncryption::NotEncrypted,
    }
}

pub fn announcement(broadcast_id: BroadcastId) -> AdvertisingRecord {
    AdvertisingRecord::new()
        .with_service_data(BROADCAST_AUDIO_ANNOUNCEMENT_UUID, broadcast_id.to_bytes())
}

pub fn scan_result(broadcast_id: BroadcastId, rssi: i8) -> ScanResult {
    ScanResult {
        device: broadcaster(broadcast_id),
        address_type: AddressType::Public,
        advertising_sid: FIXTURE_SID,
        rssi,
        pa_interval: Some(0x0120),
        record: announcement(broadcast_id),
    }
}

pub fn base_report() -> AdvertisingRecord {
    AdvertisingRecord::new().with_service_data(BASIC_AUDIO_ANNOUNCEMENT_UUID, MINIMAL_BASE)
}

/// Calls the engine made on the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    StartScan(Vec<ScanFilter>),
    StopScan,
    RegisterSync(SyncRequest),
    UnregisterSync(SyncTarget),
}

#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    pub fn take_calls(&self) -> Vec<TransportCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Broadcast ids of every sync registration so far
    pub fn registered(&self) -> Vec<BroadcastId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::RegisterSync(request) => Some(request.broadcast_id),
                _ => None,
            })
            .collect()
    }

    /// Broadcaster addresses of every sync torn down so far
    pub fn unregistered(&self) -> Vec<DeviceAddress> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                TransportCall::UnregisterSync(target) => Some(target.device.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ScanTransport for FakeTransport {
    fn start_scan(&mut self, filters: &[ScanFilter]) {
        self.calls.lock().push(TransportCall::StartScan(filters.to_vec()));
    }

    fn stop_scan(&mut self) {
        self.calls.lock().push(TransportCall::StopScan);
    }

    fn register_sync(&mut self, request: &SyncRequest) {
        self.calls.lock().push(TransportCall::RegisterSync(request.clone()));
    }

    fn unregister_sync(&mut self, target: &SyncTarget) {
        self.calls.lock().push(TransportCall::UnregisterSync(target.clone()));
    }
}

#[derive(Debug, Default)]
struct FakeDevice {
    connected: bool,
    states: Vec<ReceiveState>,
    metadata: BTreeMap<SourceId, BroadcastMetadata>,
}

#[derive(Debug, Default)]
struct ReceiversInner {
    devices: BTreeMap<DeviceAddress, FakeDevice>,
    sent: Vec<(DeviceAddress, ReceiverMessage)>,
}

/// Receivers with a fixed number of receive-state slots each
///
/// Messages are only recorded. Tests report the resulting receive states
/// themselves through [`FakeReceivers::set_state`].
#[derive(Debug, Clone, Default)]
pub struct FakeReceivers {
    inner: Arc<Mutex<ReceiversInner>>,
}

impl FakeReceivers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a receiver with `slots` empty receive states, ids starting at 1
    pub fn add_device(&self, device: &DeviceAddress, slots: u8) {
        let states = (1..=slots).map(|id| ReceiveState::empty(SourceId(id))).collect();
        self.inner.lock().devices.insert(
            device.clone(),
            FakeDevice { connected: true, states, metadata: BTreeMap::new() },
        );
    }

    pub fn set_connected(&self, device: &DeviceAddress, connected: bool) {
        if let Some(d) = self.inner.lock().devices.get_mut(device) {
            d.connected = connected;
        }
    }

    /// Replace the receive state with the same source id
    pub fn set_state(&self, device: &DeviceAddress, state: ReceiveState) {
        let mut inner = self.inner.lock();
        let Some(d) = inner.devices.get_mut(device) else {
            return;
        };
        match d.states.iter_mut().find(|s| s.source_id == state.source_id) {
            Some(slot) => *slot = state,
            None => d.states.push(state),
        }
    }

    pub fn state(&self, device: &DeviceAddress, source_id: SourceId) -> Option<ReceiveState> {
        self.inner
            .lock()
            .devices
            .get(device)?
            .states
            .iter()
            .find(|s| s.source_id == source_id)
            .cloned()
    }

    pub fn set_metadata(
        &self,
        device: &DeviceAddress,
        source_id: SourceId,
        metadata: BroadcastMetadata,
    ) {
        if let Some(d) = self.inner.lock().devices.get_mut(device) {
            d.metadata.insert(source_id, metadata);
        }
    }

    pub fn sent(&self) -> Vec<(DeviceAddress, ReceiverMessage)> {
        self.inner.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<(DeviceAddress, ReceiverMessage)> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn sent_to(&self, device: &DeviceAddress) -> Vec<ReceiverMessage> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(d, _)| d == device)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl ReceiverStateMachines for FakeReceivers {
    fn send_message(&mut self, device: &DeviceAddress, message: ReceiverMessage) {
        self.inner.lock().sent.push((device.clone(), message));
    }

    fn all_sources(&self, device: &DeviceAddress) -> Vec<ReceiveState> {
        self.inner
            .lock()
            .devices
            .get(device)
            .map(|d| d.states.clone())
            .unwrap_or_default()
    }

    fn current_broadcast_metadata(
        &self,
        device: &DeviceAddress,
        source_id: SourceId,
    ) -> Option<BroadcastMetadata> {
        self.inner.lock().devices.get(device)?.metadata.get(&source_id).cloned()
    }

    fn is_synced_to_source(&self, device: &DeviceAddress, source_id: SourceId) -> bool {
        self.state(device, source_id).is_some_and(|s| s.is_synced())
    }

    fn connected_devices(&self) -> Vec<DeviceAddress> {
        self.inner
            .lock()
            .devices
            .iter()
            .filter(|(_, d)| d.connected)
            .map(|(address, _)| address.clone())
            .collect()
    }
}

/// A single coordinated set, or none
#[derive(Debug, Clone, Default)]
pub struct FakeGroups {
    members: Arc<Mutex<Vec<DeviceAddress>>>,
}

impl FakeGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_group(&self, members: &[DeviceAddress]) {
        *self.members.lock() = members.to_vec();
    }
}

impl GroupMembership for FakeGroups {
    fn group_devices(&self, device: &DeviceAddress) -> Vec<DeviceAddress> {
        let members = self.members.lock();
        if members.contains(device) {
            members.clone()
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeLocalSource {
    playing: Arc<Mutex<BTreeMap<BroadcastId, bool>>>,
}

impl FakeLocalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start, pause or resume a local broadcast
    pub fn set_broadcast(&self, broadcast_id: BroadcastId, playing: bool) {
        self.playing.lock().insert(broadcast_id, playing);
    }

    pub fn stop_broadcast(&self, broadcast_id: BroadcastId) {
        self.playing.lock().remove(&broadcast_id);
    }
}

impl LocalBroadcastSource for FakeLocalSource {
    fn active_broadcast_ids(&self) -> Vec<BroadcastId> {
        self.playing.lock().keys().copied().collect()
    }

    fn is_playing(&self, broadcast_id: BroadcastId) -> bool {
        self.playing.lock().get(&broadcast_id).copied().unwrap_or(false)
    }
}

/// A controller wired to fakes and a manual clock
pub struct Harness {
    pub controller: BroadcastLifecycleController,
    pub transport: FakeTransport,
    pub receivers: FakeReceivers,
    pub groups: FakeGroups,
    pub local: FakeLocalSource,
    pub clock: ManualClock,
    notifications: mpsc::Receiver<Notification>,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        let transport = FakeTransport::new();
        let receivers = FakeReceivers::new();
        let groups = FakeGroups::new();
        let local = FakeLocalSource::new();
        let clock = ManualClock::new();
        let (tx, notifications) = mpsc::channel();

        let collaborators = Collaborators {
            transport: Box::new(transport.clone()),
            receivers: Box::new(receivers.clone()),
            groups: Box::new(groups.clone()),
            local_source: Box::new(local.clone()),
            clock: Box::new(clock.clone()),
        };

        Self {
            controller: BroadcastLifecycleController::new(config, collaborators, tx),
            transport,
            receivers,
            groups,
            local,
            clock,
            notifications,
        }
    }

    pub fn apply(&mut self, op: Operation) {
        self.controller.apply(op);
    }

    pub fn start_searching(&mut self) {
        self.apply(Operation::StartSearching { filters: Vec::new() });
    }

    pub fn stop_searching(&mut self) {
        self.apply(Operation::StopSearching);
    }

    pub fn scan(&mut self, broadcast_id: BroadcastId, rssi: i8) {
        self.controller.handle(Event::ScanResult(scan_result(broadcast_id, rssi)));
    }

    pub fn establish(&mut self, broadcast_id: BroadcastId, handle: SyncHandle) {
        self.sync_result(broadcast_id, handle, SyncStatus::Success);
    }

    pub fn fail_sync(&mut self, broadcast_id: BroadcastId, status: u8) {
        self.sync_result(broadcast_id, SyncHandle(0xFFFF), SyncStatus::Failure(status));
    }

    fn sync_result(&mut self, broadcast_id: BroadcastId, handle: SyncHandle, status: SyncStatus) {
        self.controller.handle(Event::SyncEstablished {
            sync_handle: handle,
            device: broadcaster(broadcast_id),
            address_type: AddressType::Public,
            advertising_sid: FIXTURE_SID,
            pa_interval: 0x0120,
            status,
        });
    }

    pub fn lose_sync(&mut self, handle: SyncHandle) {
        self.controller.handle(Event::SyncLost { sync_handle: handle });
    }

    pub fn report_base(&mut self, handle: SyncHandle) {
        self.controller.handle(Event::PeriodicAdvertisingReport {
            sync_handle: handle,
            record: base_report(),
        });
    }

    pub fn report_big_info(&mut self, handle: SyncHandle) {
        self.controller.handle(Event::BigInfoReport { sync_handle: handle, encrypted: false });
    }

    /// Scan, sync and fully discover a broadcast
    pub fn discover(&mut self, broadcast_id: BroadcastId, handle: SyncHandle) {
        self.scan(broadcast_id, -50);
        self.establish(broadcast_id, handle);
        self.report_base(handle);
        self.report_big_info(handle);
    }

    /// Connect a receiver with `slots` empty receive states
    pub fn connect(&mut self, device: &DeviceAddress, slots: u8) {
        self.receivers.add_device(device, slots);
        self.controller.handle(Event::ConnectionStateChanged {
            device: device.clone(),
            connected: true,
        });
    }

    pub fn disconnect(&mut self, device: &DeviceAddress) {
        self.receivers.set_connected(device, false);
        self.controller.handle(Event::ConnectionStateChanged {
            device: device.clone(),
            connected: false,
        });
    }

    /// Store a receive state in the fake receiver and report it
    pub fn report_state(&mut self, device: &DeviceAddress, state: ReceiveState) {
        self.receivers.set_state(device, state.clone());
        self.controller.handle(Event::ReceiveStateChanged { device: device.clone(), state });
    }

    /// Move the clock forward and fire whatever came due
    pub fn advance(&mut self, by: Duration) {
        self.clock.advance(by);
        self.controller.fire_due_timers();
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.try_iter().collect()
    }
}
