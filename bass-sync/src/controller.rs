//! The engine proper
//!
//! [`BroadcastLifecycleController`] owns every piece of engine state and
//! reacts to one [`Event`] at a time. It is driven either directly (tests,
//! embedders with their own loop) or by the worker thread behind
//! [`BroadcastAssistant`](crate::BroadcastAssistant).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::mpsc;
use std::time::Instant;

use bass_parser::{Base, BaseDecoder, BroadcastId, DecodeOutcome};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::desync::{DesyncCause, DesyncPolicyEngine, HostIntent, PauseCause, SyncLostAction};
use crate::error::{FailureReason, SyncError};
use crate::event::{Event, Notification, Operation, Query, QueryReply};
use crate::group::{Attribution, FanOutReport, GroupOperationState, GroupSourceCoordinator};
use crate::model::{
    AdvertisingSid, BroadcastMetadata, DeviceAddress, PaSync, PaSyncState, ReceiveState, SourceId,
    SyncHandle,
};
use crate::scheduler::{
    BroadcastCandidate, OfferOutcome, SchedulerAction, SyncResourceScheduler, SyncSlot,
};
use crate::source_cache::SourceCache;
use crate::timeouts::{TimeoutCoordinator, TimeoutKind};
use crate::transport::{
    GroupMembership, LocalBroadcastSource, ReceiverMessage, ReceiverStateMachines, ScanFilter,
    ScanResult, ScanTransport, SyncStatus, SyncTarget,
};

/// Everything outside the engine it needs to talk to
pub struct Collaborators {
    pub transport: Box<dyn ScanTransport>,
    pub receivers: Box<dyn ReceiverStateMachines>,
    pub groups: Box<dyn GroupMembership>,
    pub local_source: Box<dyn LocalBroadcastSource>,
    pub clock: Box<dyn Clock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    Add,
    Modify { source_id: SourceId },
    Switch { old_source_id: SourceId },
    /// Undo a pause on one receiver only
    Resume { source_id: SourceId },
}

/// A source operation waiting for the engine to sync to its broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSourceOp {
    pub device: DeviceAddress,
    pub metadata: BroadcastMetadata,
    pub kind: PendingKind,
    pub is_group_op: bool,
}

/// When dropping a broadcast, whether to tell the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LostReport {
    Always,
    IfAnnounced,
}

pub struct BroadcastLifecycleController {
    config: SyncConfig,
    transport: Box<dyn ScanTransport>,
    receivers: Box<dyn ReceiverStateMachines>,
    groups: Box<dyn GroupMembership>,
    local_source: Box<dyn LocalBroadcastSource>,
    clock: Box<dyn Clock>,
    cache: SourceCache,
    scheduler: SyncResourceScheduler,
    timeouts: TimeoutCoordinator,
    coordinator: GroupSourceCoordinator,
    desync: DesyncPolicyEngine,
    pending: BTreeMap<(DeviceAddress, BroadcastId), PendingSourceOp>,
    searching: bool,
    filters: Vec<ScanFilter>,
    notifications: mpsc::Sender<Notification>,
}

impl BroadcastLifecycleController {
    pub fn new(
        config: SyncConfig,
        collaborators: Collaborators,
        notifications: mpsc::Sender<Notification>,
    ) -> Self {
        let Collaborators { transport, receivers, groups, local_source, clock } = collaborators;
        Self {
            scheduler: SyncResourceScheduler::new(&config),
            config,
            transport,
            receivers,
            groups,
            local_source,
            clock,
            cache: SourceCache::new(),
            timeouts: TimeoutCoordinator::new(),
            coordinator: GroupSourceCoordinator::new(),
            desync: DesyncPolicyEngine::new(),
            pending: BTreeMap::new(),
            searching: false,
            filters: Vec::new(),
            notifications,
        }
    }

    /// React to one event
    pub fn handle(&mut self, event: Event) {
        match event {
            Event::ScanResult(result) => self.on_scan_result(result),
            Event::SyncEstablished {
                sync_handle,
                device,
                advertising_sid,
                pa_interval,
                status,
                ..
            } => match status {
                SyncStatus::Success => {
                    self.on_sync_established(sync_handle, &device, advertising_sid, pa_interval)
                }
                SyncStatus::Failure(code) => self.on_sync_failed(&device, advertising_sid, code),
            },
            Event::SyncLost { sync_handle } => self.on_sync_lost(sync_handle),
            Event::PeriodicAdvertisingReport { sync_handle, record } => {
                self.on_periodic_report(sync_handle, &record)
            }
            Event::BigInfoReport { sync_handle, encrypted } => {
                self.on_big_info(sync_handle, encrypted)
            }
            Event::ReceiveStateChanged { device, state } => self.on_receive_state(&device, &state),
            Event::ConnectionStateChanged { device, connected } => {
                self.on_connection_state(&device, connected)
            }
            Event::TimerFired { broadcast_id, kind, generation } => {
                self.on_timer(broadcast_id, kind, generation)
            }
            Event::Operation(op) => self.apply(op),
        }
    }

    pub fn apply(&mut self, op: Operation) {
        match op {
            Operation::StartSearching { filters } => self.start_searching(filters),
            Operation::StopSearching => self.stop_searching(),
            Operation::AddSource { device, metadata, is_group_op } => {
                self.add_source(&device, metadata, is_group_op)
            }
            Operation::ModifySource { device, source_id, metadata } => {
                self.modify_source(&device, source_id, metadata)
            }
            Operation::RemoveSource { device, source_id } => self.remove_source(&device, source_id),
            Operation::SwitchSource { device, old_source_id, metadata } => {
                self.switch_source(&device, old_source_id, metadata)
            }
            Operation::SuspendReceivers { broadcast_id } => self.suspend_receivers(broadcast_id),
            Operation::SuspendAllReceivers => self.suspend_all_receivers(),
            Operation::ResumeReceivers => self.resume_receivers(),
            Operation::StopReceivers { broadcast_id } => self.stop_receivers(broadcast_id),
        }
    }

    pub fn query(&self, query: Query) -> QueryReply {
        match query {
            Query::ActiveSyncedSources => QueryReply::SyncHandles(self.active_synced_sources()),
            Query::DeviceForSyncHandle(handle) => {
                QueryReply::Device(self.device_for_sync_handle(handle))
            }
            Query::BroadcastIdForSyncHandle(handle) => {
                QueryReply::BroadcastId(self.broadcast_id_for_sync_handle(handle))
            }
            Query::Base(handle) => QueryReply::Base(self.base(handle)),
            Query::IsSearching => QueryReply::Searching(self.searching),
        }
    }

    // ==================== Searching ====================

    pub fn start_searching(&mut self, filters: Vec<ScanFilter>) {
        if self.searching {
            tracing::debug!("Search already running");
            return;
        }
        tracing::info!("Starting broadcast search with {} filter(s)", filters.len());

        self.searching = true;
        self.scheduler.start();
        self.cache.clear_notified_flags();
        for id in self.timeouts.cancel_kind(TimeoutKind::SyncTimeout) {
            tracing::debug!("Search started, keeping sync to {}", id);
        }

        self.transport.start_scan(&filters);
        self.filters = filters;
        for device in self.receivers.connected_devices() {
            self.receivers.send_message(&device, ReceiverMessage::StartScanOffload);
        }
        self.notify(Notification::SearchStarted);
    }

    pub fn stop_searching(&mut self) {
        if !self.searching {
            tracing::debug!("No search running");
            return;
        }
        tracing::info!("Stopping broadcast search");

        self.searching = false;
        self.transport.stop_scan();
        for action in self.scheduler.stop() {
            if let SchedulerAction::Unregister { broadcast_id, target } = action {
                self.release_target(broadcast_id, &target);
            }
        }
        for id in self.timeouts.cancel_kind(TimeoutKind::SyncLostTimeout) {
            self.drop_broadcast(id, LostReport::Always);
        }
        for device in self.receivers.connected_devices() {
            self.receivers.send_message(&device, ReceiverMessage::StopScanOffload);
        }

        // Operations and paused receivers still need their syncs.
        let wanted: BTreeSet<BroadcastId> = self
            .pending
            .keys()
            .map(|(_, id)| *id)
            .chain(self.desync.unintentional_broadcasts())
            .collect();
        for id in wanted {
            self.request_sync(id);
        }
        self.pump();
        self.prune_cache();

        self.notify(Notification::SearchStopped);
    }

    /// Forget discovered broadcasts that no slot, operation or receiver needs
    fn prune_cache(&mut self) {
        let mut needed = self.broadcasts_in_use();
        needed.extend(self.scheduler.slots().iter().map(SyncSlot::broadcast_id));
        needed.extend(self.scheduler.queued().iter().map(|c| c.broadcast_id));

        let desync = &self.desync;
        let pruned = self.cache.retain(|id| needed.contains(&id) || desync.has_paused(id));
        if pruned > 0 {
            tracing::debug!("Forgot {} broadcast(s) after the search", pruned);
        }
    }

    pub fn is_searching(&self) -> bool {
        self.searching
    }

    fn matches_filters(
        &self,
        result: &ScanResult,
        broadcast_id: BroadcastId,
        name: Option<&str>,
    ) -> bool {
        self.filters.is_empty()
            || self.filters.iter().any(|f| {
                f.broadcast_id.map_or(true, |id| id == broadcast_id)
                    && f.device.as_ref().map_or(true, |d| d == &result.device)
                    && f.broadcast_name.as_deref().map_or(true, |n| name == Some(n))
            })
    }

    fn on_scan_result(&mut self, result: ScanResult) {
        if !self.searching {
            tracing::trace!("Ignoring scan result from {} while not searching", result.device);
            return;
        }

        let broadcast_id = match BaseDecoder::broadcast_id(&result.record) {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(
                    "Dropping scan result from {}: {}",
                    result.device,
                    SyncError::from(e)
                );
                return;
            }
        };
        let public_broadcast = BaseDecoder::public_broadcast(&result.record).unwrap_or_else(|e| {
            tracing::warn!("Ignoring public broadcast announcement of {}: {}", broadcast_id, e);
            None
        });
        let name = BaseDecoder::broadcast_name(&result.record);
        if !self.matches_filters(&result, broadcast_id, name.as_deref()) {
            return;
        }

        if self.cache.record_scan(&result, broadcast_id, public_broadcast, name) {
            tracing::debug!("Discovered broadcast {} from {}", broadcast_id, result.device);
        }
        if self.timeouts.cancel(broadcast_id, TimeoutKind::SyncLostTimeout) {
            tracing::info!("Broadcast {} is back in range", broadcast_id);
        }

        let priority_boost = self.needs_priority(broadcast_id);
        let known =
            self.scheduler.slot(broadcast_id).is_some() || self.scheduler.is_queued(broadcast_id);
        if !known && !priority_boost && self.cache.is_evicted(broadcast_id) {
            tracing::trace!("Not requeueing evicted broadcast {}", broadcast_id);
            return;
        }

        let candidate = BroadcastCandidate {
            broadcast_id,
            device: result.device.clone(),
            address_type: result.address_type,
            advertising_sid: result.advertising_sid,
            rssi: result.rssi,
            priority_boost,
            fail_count: 0,
        };
        if self.scheduler.offer(candidate) == OfferOutcome::Queued {
            self.pump();
        }
    }

    // ==================== Sync slots ====================

    /// Queue a sync for a broadcast the cache knows about
    fn request_sync(&mut self, broadcast_id: BroadcastId) -> bool {
        let Some(entry) = self.cache.discovered(broadcast_id) else {
            tracing::debug!("No metadata to sync to {}", broadcast_id);
            return false;
        };
        let candidate = BroadcastCandidate::from_metadata(
            &entry.metadata,
            entry.rssi,
            self.needs_priority(broadcast_id),
        );
        self.scheduler.offer(candidate);
        true
    }

    /// Whether something other than discovery wants a sync to `broadcast_id`
    fn needs_priority(&self, broadcast_id: BroadcastId) -> bool {
        self.has_pending(broadcast_id)
            || self.desync.has_unintentional(broadcast_id)
            || self
                .coordinator
                .known_states_for(broadcast_id)
                .iter()
                .any(|(_, s)| s.pa_sync_state == PaSyncState::SyncInfoRequest)
    }

    fn broadcasts_in_use(&self) -> HashSet<BroadcastId> {
        let mut in_use = self.coordinator.followed_broadcasts();
        in_use.extend(self.pending.keys().map(|(_, id)| *id));
        in_use.extend(self.desync.unintentional_broadcasts());
        in_use
    }

    fn pump(&mut self) {
        let in_use = self.broadcasts_in_use();
        for action in self.scheduler.pump(&in_use) {
            match action {
                SchedulerAction::Register(request) => {
                    tracing::debug!(
                        "Registering sync to {} at {}",
                        request.broadcast_id,
                        request.device
                    );
                    self.transport.register_sync(&request);
                }
                SchedulerAction::Unregister { broadcast_id, target } => {
                    self.release_target(broadcast_id, &target);
                    self.cache.mark_evicted(broadcast_id);
                    self.fail_pending(broadcast_id, FailureReason::LocalNotEnoughResources);
                }
                SchedulerAction::Exhausted(candidate) => self.on_resources_exhausted(&candidate),
            }
        }
    }

    fn release_target(&mut self, broadcast_id: BroadcastId, target: &SyncTarget) {
        self.transport.unregister_sync(target);
        if let Some(handle) = target.sync_handle {
            self.cache.unbind_handle(handle);
        }
        self.timeouts.cancel(broadcast_id, TimeoutKind::SyncTimeout);
    }

    fn release_sync(&mut self, broadcast_id: BroadcastId) {
        let released = self.scheduler.release(broadcast_id);
        if let Some(SchedulerAction::Unregister { target, .. }) = released {
            tracing::debug!("Releasing sync to {}", broadcast_id);
            self.release_target(broadcast_id, &target);
        }
    }

    /// Release a sync nothing depends on any more, unless a search wants it
    fn release_if_unneeded(&mut self, broadcast_id: BroadcastId) {
        if !self.searching && !self.needs_priority(broadcast_id) {
            self.release_sync(broadcast_id);
        }
    }

    fn on_resources_exhausted(&mut self, candidate: &BroadcastCandidate) {
        let broadcast_id = candidate.broadcast_id;
        if !self.has_pending(broadcast_id) {
            tracing::debug!("No sync slot free for {}", broadcast_id);
            return;
        }

        let error = SyncError::ResourceExhausted { capacity: self.scheduler.capacity() };
        tracing::warn!("Cannot sync to {}: {}", broadcast_id, error);
        for op in self.take_pending(broadcast_id) {
            self.receivers
                .send_message(&op.device, ReceiverMessage::ReachedMaxSourceLimit { broadcast_id });
            self.notify_op_failed(&op, error.reason());
        }

        if self.searching {
            self.request_sync(broadcast_id);
        } else if !self.needs_priority(broadcast_id) {
            self.scheduler.dequeue(broadcast_id);
        }
    }

    fn on_sync_established(
        &mut self,
        handle: SyncHandle,
        device: &DeviceAddress,
        advertising_sid: AdvertisingSid,
        pa_interval: u16,
    ) {
        let Some(broadcast_id) =
            self.scheduler.on_sync_established(device, advertising_sid, handle, pa_interval)
        else {
            tracing::warn!(
                "Unexpected sync {} from {} sid {}, terminating",
                handle,
                device,
                advertising_sid
            );
            self.transport.unregister_sync(&SyncTarget {
                device: device.clone(),
                advertising_sid,
                sync_handle: Some(handle),
            });
            return;
        };

        tracing::info!("Synced to broadcast {} on handle {}", broadcast_id, handle);
        self.cache.bind_handle(handle, broadcast_id, pa_interval);
        if self.timeouts.cancel(broadcast_id, TimeoutKind::BroadcastMonitorTimeout)
            && self.desync.has_unintentional(broadcast_id)
        {
            tracing::debug!("Broadcast {} is back, watching its receivers again", broadcast_id);
            self.arm_if_idle(broadcast_id, TimeoutKind::BigMonitorTimeout);
        }
        if !self.searching {
            self.arm(broadcast_id, TimeoutKind::SyncTimeout);
        }

        for op in self.take_pending(broadcast_id) {
            self.dispatch(op, PaSync::SyncPastAvailable);
        }
        for (receiver, state) in self.coordinator.known_states_for(broadcast_id) {
            if state.pa_sync_state == PaSyncState::SyncInfoRequest
                && self.receivers.is_connected(&receiver)
            {
                self.receivers.send_message(
                    &receiver,
                    ReceiverMessage::InitiatePaSyncTransfer {
                        sync_handle: handle,
                        source_id: state.source_id,
                    },
                );
            }
        }
    }

    fn on_sync_failed(
        &mut self,
        device: &DeviceAddress,
        advertising_sid: AdvertisingSid,
        status: u8,
    ) {
        let Some(attempt) = self.scheduler.on_sync_failed(device, advertising_sid) else {
            tracing::debug!(
                "Sync failure from {} sid {} with no registration",
                device,
                advertising_sid
            );
            return;
        };
        let broadcast_id = attempt.candidate.broadcast_id;
        let error = SyncError::SyncEstablishmentFailure { broadcast_id, status };
        tracing::warn!("{} (attempt {})", error, attempt.candidate.fail_count);

        if self.desync.has_unintentional(broadcast_id) {
            self.monitor_broadcast(broadcast_id);
            if !attempt.requeued {
                self.scheduler.offer(attempt.candidate);
            }
        } else if self.has_pending(broadcast_id) || !attempt.requeued {
            self.drop_broadcast(broadcast_id, LostReport::IfAnnounced);
            self.fail_pending(broadcast_id, error.reason());
        } else if !self.searching {
            self.scheduler.dequeue(broadcast_id);
        }

        self.pump();
    }

    fn on_sync_lost(&mut self, handle: SyncHandle) {
        let Some(slot) = self.scheduler.on_sync_lost(handle) else {
            tracing::debug!("Lost unknown sync {}", handle);
            return;
        };
        let broadcast_id = slot.broadcast_id();
        tracing::info!("Lost sync to broadcast {}", broadcast_id);
        self.cache.unbind_handle(handle);
        self.timeouts.cancel(broadcast_id, TimeoutKind::SyncTimeout);

        let paused = self.desync.has_unintentional(broadcast_id);
        match DesyncPolicyEngine::on_sync_lost(self.searching, paused) {
            SyncLostAction::ArmSyncLostTimeout => {
                self.arm(broadcast_id, TimeoutKind::SyncLostTimeout)
            }
            SyncLostAction::ArmBroadcastMonitor { resync } => {
                self.monitor_broadcast(broadcast_id);
                if resync {
                    self.request_sync(broadcast_id);
                }
            }
            SyncLostAction::DropNow => self.drop_broadcast(broadcast_id, LostReport::Always),
        }

        self.pump();
    }

    /// The broadcaster itself is gone while receivers wait for it. Its
    /// receivers stop being watched and the broadcast gets the longer grace
    /// period instead.
    fn monitor_broadcast(&mut self, broadcast_id: BroadcastId) {
        self.timeouts.cancel(broadcast_id, TimeoutKind::BigMonitorTimeout);
        if self.timeouts.is_armed(broadcast_id, TimeoutKind::BroadcastMonitorTimeout) {
            return;
        }
        tracing::info!("Broadcast {} unreachable, monitoring it", broadcast_id);
        self.arm(broadcast_id, TimeoutKind::BroadcastMonitorTimeout);
    }

    /// Forget a broadcast entirely
    fn drop_broadcast(&mut self, broadcast_id: BroadcastId, report: LostReport) {
        self.release_sync(broadcast_id);
        self.timeouts.cancel(broadcast_id, TimeoutKind::SyncLostTimeout);
        let Some(entry) = self.cache.remove(broadcast_id) else {
            return;
        };
        if report == LostReport::Always || entry.is_notified() {
            tracing::info!("Broadcast {} lost", broadcast_id);
            self.notify(Notification::SourceLost { broadcast_id });
        }
    }

    // ==================== Periodic advertising ====================

    fn on_periodic_report(&mut self, handle: SyncHandle, record: &bass_parser::AdvertisingRecord) {
        let Some(broadcast_id) = self.cache.broadcast_id_for_handle(handle) else {
            tracing::trace!("Report on unbound handle {}", handle);
            return;
        };
        match BaseDecoder::refresh(record) {
            DecodeOutcome::Updated(base) => {
                self.cache.put_base(handle, base);
            }
            DecodeOutcome::Retained(e) => {
                tracing::warn!("Keeping previous BASE of {}: {}", broadcast_id, SyncError::from(e));
            }
            DecodeOutcome::NoBase => {}
        }
        self.announce_if_ready(handle);
    }

    fn on_big_info(&mut self, handle: SyncHandle, encrypted: bool) {
        let Some(broadcast_id) = self.cache.broadcast_id_for_handle(handle) else {
            tracing::trace!("BIG info on unbound handle {}", handle);
            return;
        };
        self.cache.record_big_info(handle, encrypted);
        self.announce_if_ready(handle);

        for paused in self.desync.take_resumable(broadcast_id) {
            tracing::info!("BIG of {} is back, resuming {}", broadcast_id, paused.device);
            self.resume_sink(&paused.device, paused.metadata);
        }
    }

    fn announce_if_ready(&mut self, handle: SyncHandle) {
        if !self.searching {
            return;
        }
        if let Some(metadata) = self.cache.take_found(handle) {
            tracing::info!(
                "Found broadcast {} ({:?})",
                metadata.broadcast_id,
                metadata.broadcast_name
            );
            self.notify(Notification::SourceFound(metadata));
        }
    }

    // ==================== Receivers ====================

    fn on_receive_state(&mut self, device: &DeviceAddress, state: &ReceiveState) {
        let delta = self.coordinator.on_receive_state(device, state);
        tracing::debug!(
            "Receive state {} on {}: {:?} {:?} ({:?})",
            state.source_id,
            device,
            state.broadcast_id,
            state.pa_sync_state,
            delta.attribution
        );

        if delta.remove_now {
            tracing::debug!("Completing removal of source {} on {}", state.source_id, device);
            self.receivers
                .send_message(device, ReceiverMessage::RemoveSource { source_id: state.source_id });
        }
        if let (Some(broadcast_id), Attribution::Host) = (delta.added, delta.attribution) {
            self.notify(Notification::SourceAdded {
                device: device.clone(),
                source_id: state.source_id,
                broadcast_id,
            });
        }
        if let Some(broadcast_id) = delta.resynced {
            self.on_sink_following(device, broadcast_id);
        }
        if let Some(broadcast_id) = delta.desynced {
            self.on_sink_desynced(device, state, broadcast_id);
        }

        let newly_requested = delta
            .previous
            .as_ref()
            .map_or(true, |p| p.pa_sync_state != PaSyncState::SyncInfoRequest);
        if let (Some(broadcast_id), PaSyncState::SyncInfoRequest, true) =
            (state.broadcast_id, state.pa_sync_state, newly_requested)
        {
            self.on_sync_info_request(device, state.source_id, broadcast_id);
        }
    }

    fn on_sink_following(&mut self, device: &DeviceAddress, broadcast_id: BroadcastId) {
        if self.desync.clear_paused(device, broadcast_id).is_some()
            && !self.desync.has_unintentional(broadcast_id)
        {
            tracing::debug!("Every receiver of {} resumed", broadcast_id);
            self.timeouts.cancel(broadcast_id, TimeoutKind::BigMonitorTimeout);
            self.timeouts.cancel(broadcast_id, TimeoutKind::BroadcastMonitorTimeout);
        }
        if self.timeouts.cancel(broadcast_id, TimeoutKind::SyncTimeout) {
            self.release_if_unneeded(broadcast_id);
        }
    }

    fn on_sink_desynced(
        &mut self,
        device: &DeviceAddress,
        state: &ReceiveState,
        broadcast_id: BroadcastId,
    ) {
        let local_paused = self.cache.is_local_broadcast(&broadcast_id, self.local_source.as_ref())
            && !self.local_source.is_playing(broadcast_id);
        let cause = self.desync.classify(device, broadcast_id, local_paused);
        let decision = DesyncPolicyEngine::decide(cause, self.searching);
        tracing::info!("{} stopped following {}: {:?}", device, broadcast_id, cause);

        if decision.cache_paused {
            let metadata = self
                .receivers
                .current_broadcast_metadata(device, state.source_id)
                .or_else(|| self.cache.metadata(broadcast_id));
            match metadata {
                Some(metadata) => {
                    self.cache.remember(&metadata);
                    let pause = match cause {
                        DesyncCause::SinkUnintentional => PauseCause::Sink,
                        DesyncCause::HostSuspend | DesyncCause::HostRemove => PauseCause::Host,
                    };
                    self.desync.cache_paused(device, metadata, pause);
                }
                None => {
                    tracing::warn!("No metadata to resume {} on {} later", broadcast_id, device)
                }
            }
        }
        if decision.arm_big_monitor
            && !self.timeouts.is_armed(broadcast_id, TimeoutKind::BroadcastMonitorTimeout)
        {
            self.arm_if_idle(broadcast_id, TimeoutKind::BigMonitorTimeout);
        }
        if decision.force_resync
            && self.scheduler.slot(broadcast_id).is_none()
            && self.request_sync(broadcast_id)
        {
            self.pump();
        }
    }

    fn on_sync_info_request(
        &mut self,
        device: &DeviceAddress,
        source_id: SourceId,
        broadcast_id: BroadcastId,
    ) {
        if self.cache.is_local_broadcast(&broadcast_id, self.local_source.as_ref()) {
            tracing::debug!("{} asks for sync info of local broadcast {}", device, broadcast_id);
            return;
        }
        match self.scheduler.synced_handle(broadcast_id) {
            Some(sync_handle) => {
                tracing::debug!("Transferring sync {} to {}", sync_handle, device);
                self.receivers.send_message(
                    device,
                    ReceiverMessage::InitiatePaSyncTransfer { sync_handle, source_id },
                );
            }
            None => {
                if self.cache.discovered(broadcast_id).is_none() {
                    let metadata = self.receivers.current_broadcast_metadata(device, source_id);
                    if let Some(metadata) = metadata {
                        self.cache.remember(&metadata);
                    }
                }
                if self.request_sync(broadcast_id) {
                    self.pump();
                }
            }
        }
    }

    fn on_connection_state(&mut self, device: &DeviceAddress, connected: bool) {
        if connected {
            tracing::info!("Receiver {} connected", device);
            if self.searching {
                self.receivers.send_message(device, ReceiverMessage::StartScanOffload);
            }
            return;
        }

        tracing::info!("Receiver {} disconnected", device);
        let keys: Vec<_> = self.pending.keys().filter(|(d, _)| d == device).cloned().collect();
        for key in keys {
            if let Some(op) = self.pending.remove(&key) {
                self.notify_op_failed(&op, FailureReason::RemoteLinkError);
            }
        }
        self.coordinator.forget_device(device);
        self.desync.forget_device(device);
    }

    // ==================== Timers ====================

    fn arm(&mut self, broadcast_id: BroadcastId, kind: TimeoutKind) {
        let now = self.clock.now();
        self.timeouts.arm(broadcast_id, kind, now, kind.duration(&self.config));
    }

    fn arm_if_idle(&mut self, broadcast_id: BroadcastId, kind: TimeoutKind) {
        let now = self.clock.now();
        self.timeouts.arm_if_idle(broadcast_id, kind, now, kind.duration(&self.config));
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timeouts.next_deadline()
    }

    /// Fire every timer whose deadline has passed on the engine clock
    pub fn fire_due_timers(&mut self) {
        let now = self.clock.now();
        for due in self.timeouts.due(now) {
            self.handle(Event::TimerFired {
                broadcast_id: due.broadcast_id,
                kind: due.kind,
                generation: due.generation,
            });
        }
    }

    fn on_timer(&mut self, broadcast_id: BroadcastId, kind: TimeoutKind, generation: u64) {
        if !self.timeouts.fire(broadcast_id, kind, generation) {
            tracing::debug!("Ignoring stale {} timer for {}", kind, broadcast_id);
            return;
        }
        tracing::info!("{} timer expired for {}", kind, broadcast_id);

        match kind {
            TimeoutKind::SyncTimeout => {
                self.fail_pending(broadcast_id, FailureReason::LocalNotEnoughResources);
                if !self.searching {
                    self.release_sync(broadcast_id);
                }
            }
            TimeoutKind::SyncLostTimeout => self.drop_broadcast(broadcast_id, LostReport::Always),
            TimeoutKind::BigMonitorTimeout => {
                for paused in self.desync.take_unintentional(broadcast_id) {
                    self.remove_paused_sink(&paused.device, broadcast_id);
                }
                self.timeouts.cancel(broadcast_id, TimeoutKind::BroadcastMonitorTimeout);
                self.release_if_unneeded(broadcast_id);
            }
            TimeoutKind::BroadcastMonitorTimeout => {
                tracing::warn!(
                    "Broadcast {} did not come back, stopping its receivers",
                    broadcast_id
                );
                self.stop_receivers(broadcast_id);
                self.drop_broadcast(broadcast_id, LostReport::Always);
            }
        }

        self.pump();
    }

    fn remove_paused_sink(&mut self, device: &DeviceAddress, broadcast_id: BroadcastId) {
        tracing::info!("{} did not resume {}, removing it", device, broadcast_id);
        let Some(source_id) = self.occupied_source(device, broadcast_id) else {
            return;
        };
        self.desync.record_intent(device, broadcast_id, HostIntent::Remove);
        let removed =
            self.coordinator.remove_source(self.receivers.as_mut(), device, source_id, false);
        if let Err(e) = removed {
            tracing::warn!("Could not remove {} from {}: {}", broadcast_id, device, e);
        }
    }

    // ==================== Source operations ====================

    fn has_sync_or_is_local(&self, metadata: &BroadcastMetadata) -> bool {
        self.scheduler.synced_handle(metadata.broadcast_id).is_some()
            || self.cache.is_local_broadcast(metadata, self.local_source.as_ref())
    }

    fn occupied_source(
        &self,
        device: &DeviceAddress,
        broadcast_id: BroadcastId,
    ) -> Option<SourceId> {
        self.receivers
            .all_sources(device)
            .into_iter()
            .find(|s| s.broadcast_id == Some(broadcast_id))
            .map(|s| s.source_id)
    }

    fn enrich(&self, mut metadata: BroadcastMetadata) -> BroadcastMetadata {
        if let Some(cached) = self.cache.metadata(metadata.broadcast_id) {
            metadata.merge_missing(&cached);
        }
        metadata
    }

    /// Park an operation until its broadcast is synced. Replaces an earlier
    /// operation for the same receiver and broadcast.
    fn defer(&mut self, op: PendingSourceOp) {
        let broadcast_id = op.metadata.broadcast_id;
        tracing::debug!(
            "Deferring {:?} on {} until {} is synced",
            op.kind,
            op.device,
            broadcast_id
        );
        self.cache.remember(&op.metadata);
        self.pending.insert((op.device.clone(), broadcast_id), op);
    }

    pub fn add_source(
        &mut self,
        device: &DeviceAddress,
        metadata: BroadcastMetadata,
        is_group_op: bool,
    ) {
        if !self.receivers.is_connected(device) {
            let error = SyncError::LinkUnavailable(device.clone());
            tracing::warn!("Cannot add {}: {}", metadata.broadcast_id, error);
            self.notify(Notification::SourceAddFailed {
                device: device.clone(),
                metadata,
                reason: error.reason(),
            });
            return;
        }

        let metadata = self.enrich(metadata);
        let targets = self.coordinator.targets(
            self.groups.as_ref(),
            self.receivers.as_ref(),
            device,
            is_group_op,
        );

        if self.has_sync_or_is_local(&metadata) {
            let report = self.coordinator.add_source(
                self.receivers.as_mut(),
                &targets,
                &metadata,
                PaSync::SyncPastAvailable,
                is_group_op,
            );
            self.report_add(&metadata, report);
            return;
        }

        for target in targets {
            self.defer(PendingSourceOp {
                device: target,
                metadata: metadata.clone(),
                kind: PendingKind::Add,
                is_group_op,
            });
        }
        self.request_sync(metadata.broadcast_id);
        self.pump();
    }

    pub fn modify_source(
        &mut self,
        device: &DeviceAddress,
        source_id: SourceId,
        metadata: BroadcastMetadata,
    ) {
        let error = if !self.receivers.is_connected(device) {
            Some(SyncError::LinkUnavailable(device.clone()))
        } else if !self
            .receivers
            .all_sources(device)
            .iter()
            .any(|s| s.source_id == source_id && !s.is_empty())
        {
            Some(SyncError::InvalidOperationTarget(format!("no source {source_id} on {device}")))
        } else {
            None
        };
        if let Some(error) = error {
            tracing::warn!("Cannot modify source {} on {}: {}", source_id, device, error);
            self.notify(Notification::SourceModifyFailed {
                device: device.clone(),
                source_id,
                reason: error.reason(),
            });
            return;
        }

        let metadata = self.enrich(metadata);
        let op = PendingSourceOp {
            device: device.clone(),
            metadata,
            kind: PendingKind::Modify { source_id },
            is_group_op: false,
        };
        if self.has_sync_or_is_local(&op.metadata) {
            self.dispatch(op, PaSync::SyncPastAvailable);
        } else {
            let broadcast_id = op.metadata.broadcast_id;
            self.defer(op);
            self.request_sync(broadcast_id);
            self.pump();
        }
    }

    pub fn remove_source(&mut self, device: &DeviceAddress, source_id: SourceId) {
        if !self.receivers.is_connected(device) {
            let reason = SyncError::LinkUnavailable(device.clone()).reason();
            self.notify(Notification::SourceRemoveFailed {
                device: device.clone(),
                source_id,
                reason,
            });
            return;
        }
        let broadcast_id = self
            .receivers
            .all_sources(device)
            .into_iter()
            .find(|s| s.source_id == source_id)
            .and_then(|s| s.broadcast_id);

        match self.coordinator.remove_source(self.receivers.as_mut(), device, source_id, true) {
            Ok(report) => {
                if let Some(broadcast_id) = broadcast_id {
                    for (member, _) in &report.dispatched {
                        self.desync.record_intent(member, broadcast_id, HostIntent::Remove);
                        self.desync.clear_paused(member, broadcast_id);
                        self.pending.remove(&(member.clone(), broadcast_id));
                    }
                    if !self.desync.has_unintentional(broadcast_id) {
                        self.timeouts.cancel(broadcast_id, TimeoutKind::BigMonitorTimeout);
                        self.timeouts.cancel(broadcast_id, TimeoutKind::BroadcastMonitorTimeout);
                    }
                }
                for (member, error) in report.failed {
                    self.notify(Notification::SourceRemoveFailed {
                        device: member,
                        source_id,
                        reason: error.reason(),
                    });
                }
            }
            Err(error) => {
                tracing::warn!("Cannot remove source {} on {}: {}", source_id, device, error);
                self.notify(Notification::SourceRemoveFailed {
                    device: device.clone(),
                    source_id,
                    reason: error.reason(),
                });
            }
        }
    }

    pub fn switch_source(
        &mut self,
        device: &DeviceAddress,
        old_source_id: SourceId,
        metadata: BroadcastMetadata,
    ) {
        if !self.receivers.is_connected(device) {
            let reason = SyncError::LinkUnavailable(device.clone()).reason();
            self.notify(Notification::SourceAddFailed { device: device.clone(), metadata, reason });
            return;
        }

        let metadata = self.enrich(metadata);
        let op = PendingSourceOp {
            device: device.clone(),
            metadata,
            kind: PendingKind::Switch { old_source_id },
            is_group_op: false,
        };
        if self.has_sync_or_is_local(&op.metadata) {
            self.dispatch(op, PaSync::SyncPastAvailable);
        } else {
            let broadcast_id = op.metadata.broadcast_id;
            self.defer(op);
            self.request_sync(broadcast_id);
            self.pump();
        }
    }

    /// Ask every receiver following `broadcast_id` to stop, remembering them for `resume`
    pub fn suspend_receivers(&mut self, broadcast_id: BroadcastId) {
        tracing::info!("Suspending receivers of {}", broadcast_id);
        for device in self.receivers.connected_devices() {
            let states: Vec<ReceiveState> = self
                .receivers
                .all_sources(&device)
                .into_iter()
                .filter(|s| s.broadcast_id == Some(broadcast_id))
                .collect();
            for state in states {
                let metadata = self
                    .receivers
                    .current_broadcast_metadata(&device, state.source_id)
                    .or_else(|| self.cache.metadata(broadcast_id));
                if let Some(metadata) = &metadata {
                    self.cache.remember(metadata);
                    self.desync.cache_paused(&device, metadata.clone(), PauseCause::Host);
                }
                if state.is_synced() {
                    self.desync.record_intent(&device, broadcast_id, HostIntent::Suspend);
                    if let Err(e) = self.coordinator.update_source(
                        self.receivers.as_mut(),
                        &device,
                        state.source_id,
                        metadata,
                        PaSync::DoNotSync,
                    ) {
                        tracing::warn!("Could not suspend {} on {}: {}", broadcast_id, device, e);
                    }
                }
            }
        }
        self.timeouts.cancel(broadcast_id, TimeoutKind::BigMonitorTimeout);
        self.timeouts.cancel(broadcast_id, TimeoutKind::BroadcastMonitorTimeout);
    }

    pub fn suspend_all_receivers(&mut self) {
        let broadcasts: BTreeSet<BroadcastId> = self
            .receivers
            .connected_devices()
            .iter()
            .flat_map(|d| self.receivers.all_sources(d))
            .filter_map(|s| s.broadcast_id)
            .collect();
        for broadcast_id in broadcasts {
            self.suspend_receivers(broadcast_id);
        }
    }

    /// Re-add every paused receiver
    pub fn resume_receivers(&mut self) {
        let paused = self.desync.take_all();
        if paused.is_empty() {
            tracing::debug!("Nothing to resume");
            return;
        }

        let broadcasts: BTreeSet<BroadcastId> =
            paused.iter().map(|p| p.metadata.broadcast_id).collect();
        for broadcast_id in broadcasts {
            self.timeouts.cancel(broadcast_id, TimeoutKind::BigMonitorTimeout);
            self.timeouts.cancel(broadcast_id, TimeoutKind::BroadcastMonitorTimeout);
        }
        for sink in paused {
            self.resume_sink(&sink.device, sink.metadata);
        }
        self.pump();
    }

    fn resume_sink(&mut self, device: &DeviceAddress, metadata: BroadcastMetadata) {
        if !self.receivers.is_connected(device) {
            tracing::debug!("Not resuming {} on disconnected {}", metadata.broadcast_id, device);
            return;
        }
        let metadata = self.enrich(metadata);
        let kind = match self.occupied_source(device, metadata.broadcast_id) {
            Some(source_id) => PendingKind::Resume { source_id },
            None => PendingKind::Add,
        };
        let op = PendingSourceOp { device: device.clone(), metadata, kind, is_group_op: false };

        if self.has_sync_or_is_local(&op.metadata) {
            self.dispatch(op, PaSync::SyncPastAvailable);
        } else {
            let broadcast_id = op.metadata.broadcast_id;
            self.defer(op);
            if self.request_sync(broadcast_id) {
                self.pump();
            }
        }
    }

    /// Remove `broadcast_id` from every receiver and stop supervising it
    pub fn stop_receivers(&mut self, broadcast_id: BroadcastId) {
        tracing::info!("Stopping receivers of {}", broadcast_id);
        for device in self.receivers.connected_devices() {
            let Some(source_id) = self.occupied_source(&device, broadcast_id) else {
                continue;
            };
            self.desync.record_intent(&device, broadcast_id, HostIntent::Stop);
            let removed =
                self.coordinator.remove_source(self.receivers.as_mut(), &device, source_id, false);
            if let Err(e) = removed {
                tracing::warn!("Could not remove {} from {}: {}", broadcast_id, device, e);
            }
        }

        self.desync.clear_broadcast(broadcast_id);
        self.timeouts.cancel(broadcast_id, TimeoutKind::BigMonitorTimeout);
        self.timeouts.cancel(broadcast_id, TimeoutKind::BroadcastMonitorTimeout);
        for op in self.take_pending(broadcast_id) {
            tracing::debug!("Dropping deferred {:?} on {}", op.kind, op.device);
        }
        if !self.searching {
            self.release_sync(broadcast_id);
        }
    }

    fn dispatch(&mut self, op: PendingSourceOp, pa_sync: PaSync) {
        let metadata = self.enrich(op.metadata);
        let device = op.device;
        match op.kind {
            PendingKind::Add => {
                let report = self.coordinator.add_source(
                    self.receivers.as_mut(),
                    std::slice::from_ref(&device),
                    &metadata,
                    pa_sync,
                    op.is_group_op,
                );
                self.report_add(&metadata, report);
            }
            PendingKind::Modify { source_id } => {
                let modified = self.coordinator.modify_source(
                    self.receivers.as_mut(),
                    &device,
                    source_id,
                    &metadata,
                    pa_sync,
                );
                match modified {
                    Ok(report) => {
                        for (member, error) in report.failed {
                            self.notify(Notification::SourceModifyFailed {
                                device: member,
                                source_id,
                                reason: error.reason(),
                            });
                        }
                    }
                    Err(error) => self.notify(Notification::SourceModifyFailed {
                        device,
                        source_id,
                        reason: error.reason(),
                    }),
                }
            }
            PendingKind::Switch { old_source_id } => {
                let switched = self.coordinator.switch_source(
                    self.receivers.as_mut(),
                    &device,
                    old_source_id,
                    &metadata,
                    pa_sync,
                );
                match switched {
                    Ok(report) => self.report_add(&metadata, report),
                    Err(error) => self.notify(Notification::SourceAddFailed {
                        device,
                        metadata,
                        reason: error.reason(),
                    }),
                }
            }
            PendingKind::Resume { source_id } => {
                if let Err(error) = self.coordinator.update_source(
                    self.receivers.as_mut(),
                    &device,
                    source_id,
                    Some(metadata.clone()),
                    pa_sync,
                ) {
                    tracing::debug!(
                        "Source {} left {} before resuming: {}",
                        source_id,
                        device,
                        error
                    );
                    let report = self.coordinator.add_source(
                        self.receivers.as_mut(),
                        std::slice::from_ref(&device),
                        &metadata,
                        pa_sync,
                        false,
                    );
                    self.report_add(&metadata, report);
                }
            }
        }
    }

    fn report_add(&self, metadata: &BroadcastMetadata, report: FanOutReport) {
        for (device, error) in report.failed {
            tracing::warn!("Adding {} to {} failed: {}", metadata.broadcast_id, device, error);
            self.notify(Notification::SourceAddFailed {
                device,
                metadata: metadata.clone(),
                reason: error.reason(),
            });
        }
    }

    // ==================== Pending operations ====================

    fn has_pending(&self, broadcast_id: BroadcastId) -> bool {
        self.pending.keys().any(|(_, id)| *id == broadcast_id)
    }

    fn take_pending(&mut self, broadcast_id: BroadcastId) -> Vec<PendingSourceOp> {
        let keys: Vec<_> =
            self.pending.keys().filter(|(_, id)| *id == broadcast_id).cloned().collect();
        keys.into_iter().filter_map(|k| self.pending.remove(&k)).collect()
    }

    fn fail_pending(&mut self, broadcast_id: BroadcastId, reason: FailureReason) {
        for op in self.take_pending(broadcast_id) {
            self.notify_op_failed(&op, reason);
        }
    }

    fn notify_op_failed(&self, op: &PendingSourceOp, reason: FailureReason) {
        let device = op.device.clone();
        let notification = match op.kind {
            PendingKind::Add | PendingKind::Switch { .. } | PendingKind::Resume { .. } => {
                Notification::SourceAddFailed { device, metadata: op.metadata.clone(), reason }
            }
            PendingKind::Modify { source_id } => {
                Notification::SourceModifyFailed { device, source_id, reason }
            }
        };
        self.notify(notification);
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::trace!("Notification receiver dropped");
        }
    }

    // ==================== Queries ====================

    pub fn active_synced_sources(&self) -> Vec<SyncHandle> {
        self.scheduler.synced_handles()
    }

    pub fn device_for_sync_handle(&self, handle: SyncHandle) -> Option<DeviceAddress> {
        self.scheduler.slot_for_handle(handle).map(|s| s.candidate.device.clone())
    }

    pub fn broadcast_id_for_sync_handle(&self, handle: SyncHandle) -> Option<BroadcastId> {
        self.scheduler.slot_for_handle(handle).map(|s| s.broadcast_id())
    }

    pub fn base(&self, handle: SyncHandle) -> Option<Base> {
        self.cache.base(handle).cloned()
    }

    pub fn pending_ops(&self) -> impl Iterator<Item = &PendingSourceOp> {
        self.pending.values()
    }

    pub fn scheduler(&self) -> &SyncResourceScheduler {
        &self.scheduler
    }

    pub fn timeouts(&self) -> &TimeoutCoordinator {
        &self.timeouts
    }

    pub fn cache(&self) -> &SourceCache {
        &self.cache
    }

    pub fn desync(&self) -> &DesyncPolicyEngine {
        &self.desync
    }

    pub fn group_state(&self) -> &GroupOperationState {
        self.coordinator.group_state()
    }

    /// Stop searching and release every sync
    pub fn shutdown(&mut self) {
        self.stop_searching();
        let held: Vec<BroadcastId> =
            self.scheduler.slots().iter().map(SyncSlot::broadcast_id).collect();
        for broadcast_id in held {
            self.release_sync(broadcast_id);
        }
        for (_, op) in std::mem::take(&mut self.pending) {
            self.notify_op_failed(&op, FailureReason::LocalNotEnoughResources);
        }
    }
}
