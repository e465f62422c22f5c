//! Arbitration of the controller's periodic advertising sync slots
//!
//! The scheduler is pure bookkeeping: it never calls the transport. Each
//! mutating call returns the [`SchedulerAction`]s the caller has to carry out.
//!
//! Candidates are ranked by `(priority boost, rssi, fewest failures)`. When
//! every slot is taken the best queued candidate may evict the lowest-ranked
//! slot that is not in use (oldest first on ties), as long as it ranks at
//! least as high as that victim. A slot is in use when a receiver follows it
//! or an operation awaits it. When every slot is in use, a candidate evicts
//! the oldest-admitted slot it strictly outranks.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bass_parser::BroadcastId;

use crate::config::SyncConfig;
use crate::model::{AddressType, AdvertisingSid, BroadcastMetadata, DeviceAddress, SyncHandle};
use crate::transport::{SyncRequest, SyncTarget};

/// A broadcast wanting a sync slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastCandidate {
    pub broadcast_id: BroadcastId,
    pub device: DeviceAddress,
    pub address_type: AddressType,
    pub advertising_sid: AdvertisingSid,
    pub rssi: i8,
    pub priority_boost: bool,
    pub fail_count: u32,
}

impl BroadcastCandidate {
    pub fn from_metadata(metadata: &BroadcastMetadata, rssi: i8, priority_boost: bool) -> Self {
        Self {
            broadcast_id: metadata.broadcast_id,
            device: metadata.source_device.clone(),
            address_type: metadata.address_type,
            advertising_sid: metadata.advertising_sid,
            rssi,
            priority_boost,
            fail_count: 0,
        }
    }

    fn rank(&self) -> (bool, i8, Reverse<u32>) {
        (self.priority_boost, self.rssi, Reverse(self.fail_count))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Registered with the controller, no result yet
    Registering,
    Synced { handle: SyncHandle, pa_interval: u16 },
}

/// A sync slot held by one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSlot {
    pub candidate: BroadcastCandidate,
    pub state: SlotState,
}

impl SyncSlot {
    pub fn broadcast_id(&self) -> BroadcastId {
        self.candidate.broadcast_id
    }

    pub fn sync_handle(&self) -> Option<SyncHandle> {
        match self.state {
            SlotState::Synced { handle, .. } => Some(handle),
            SlotState::Registering => None,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self.state, SlotState::Synced { .. })
    }

    pub fn target(&self) -> SyncTarget {
        SyncTarget {
            device: self.candidate.device.clone(),
            advertising_sid: self.candidate.advertising_sid,
            sync_handle: self.sync_handle(),
        }
    }
}

/// Work the caller must perform after a scheduler call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAction {
    Register(SyncRequest),
    Unregister { broadcast_id: BroadcastId, target: SyncTarget },
    /// The best queued candidate could not displace any slot
    Exhausted(BroadcastCandidate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The broadcast already holds a slot; its rank was refreshed
    UpdatedSlot,
    /// The broadcast was already queued; its rank was refreshed
    UpdatedQueued,
    Queued,
}

/// Outcome of a failed sync attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedAttempt {
    pub candidate: BroadcastCandidate,
    /// Whether the candidate went back into the queue
    pub requeued: bool,
}

#[derive(Debug)]
pub struct SyncResourceScheduler {
    capacity: usize,
    max_failures: u32,
    skip: u16,
    timeout: Duration,
    slots: Vec<SyncSlot>,
    queue: Vec<BroadcastCandidate>,
    fail_counts: HashMap<BroadcastId, u32>,
    active: bool,
}

impl SyncResourceScheduler {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            capacity: config.max_sync_slots,
            max_failures: config.max_sync_failures,
            skip: config.sync_skip,
            timeout: config.sync_register_timeout,
            slots: Vec::new(),
            queue: Vec::new(),
            fail_counts: HashMap::new(),
            active: false,
        }
    }

    /// Begin a search epoch. Returns false if one is already running.
    pub fn start(&mut self) -> bool {
        if self.active {
            return false;
        }
        self.active = true;
        true
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Release every slot and forget the queue and failure history
    pub fn stop(&mut self) -> Vec<SchedulerAction> {
        self.active = false;
        self.queue.clear();
        self.fail_counts.clear();
        self.slots
            .drain(..)
            .map(|slot| SchedulerAction::Unregister {
                broadcast_id: slot.broadcast_id(),
                target: slot.target(),
            })
            .collect()
    }

    /// Queue a candidate, or refresh its rank if it is already known
    pub fn offer(&mut self, candidate: BroadcastCandidate) -> OfferOutcome {
        let id = candidate.broadcast_id;

        if let Some(slot) = self.slots.iter_mut().find(|s| s.broadcast_id() == id) {
            slot.candidate.rssi = candidate.rssi;
            slot.candidate.priority_boost = candidate.priority_boost;
            return OfferOutcome::UpdatedSlot;
        }

        if let Some(queued) = self.queue.iter_mut().find(|c| c.broadcast_id == id) {
            queued.rssi = candidate.rssi;
            queued.priority_boost = candidate.priority_boost;
            return OfferOutcome::UpdatedQueued;
        }

        let fail_count = self.fail_counts.get(&id).copied().unwrap_or(0);
        self.queue.push(BroadcastCandidate { fail_count, ..candidate });
        OfferOutcome::Queued
    }

    /// Admit queued candidates while slots are free or can be taken over
    pub fn pump(&mut self, in_use: &HashSet<BroadcastId>) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        let mut admitted: HashSet<BroadcastId> = HashSet::new();

        while let Some(best) = self.best_queued() {
            if self.slots.len() < self.capacity {
                let candidate = self.queue.remove(best);
                admitted.insert(candidate.broadcast_id);
                actions.push(self.admit(candidate));
                continue;
            }

            let Some(victim) = self.select_victim(&self.queue[best], in_use, &admitted) else {
                actions.push(SchedulerAction::Exhausted(self.queue[best].clone()));
                break;
            };

            let evicted = self.slots.remove(victim);
            tracing::debug!(
                "Evicting broadcast {} for {}",
                evicted.broadcast_id(),
                self.queue[best].broadcast_id
            );
            actions.push(SchedulerAction::Unregister {
                broadcast_id: evicted.broadcast_id(),
                target: evicted.target(),
            });
            let candidate = self.queue.remove(best);
            admitted.insert(candidate.broadcast_id);
            actions.push(self.admit(candidate));
        }

        actions
    }

    /// Highest-ranked queued candidate, earliest queued on ties
    fn best_queued(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (idx, candidate) in self.queue.iter().enumerate() {
            match best {
                Some(b) if self.queue[b].rank() >= candidate.rank() => {}
                _ => best = Some(idx),
            }
        }
        best
    }

    /// Slot `candidate` may take over, if any
    ///
    /// Prefers the lowest-ranked slot not in use, oldest on ties. With every
    /// slot in use, falls back to the oldest slot `candidate` strictly
    /// outranks. Slots admitted during the current pump are never taken.
    fn select_victim(
        &self,
        candidate: &BroadcastCandidate,
        in_use: &HashSet<BroadcastId>,
        admitted: &HashSet<BroadcastId>,
    ) -> Option<usize> {
        let settled = |slot: &&SyncSlot| !admitted.contains(&slot.broadcast_id());

        let mut unused: Option<(usize, &SyncSlot)> = None;
        for (idx, slot) in self.slots.iter().enumerate().filter(|(_, s)| settled(s)) {
            if in_use.contains(&slot.broadcast_id()) {
                continue;
            }
            match unused {
                Some((_, lowest)) if lowest.candidate.rank() <= slot.candidate.rank() => {}
                _ => unused = Some((idx, slot)),
            }
        }
        if let Some((idx, slot)) = unused {
            return (candidate.rank() >= slot.candidate.rank()).then_some(idx);
        }

        self.slots
            .iter()
            .position(|slot| settled(&slot) && candidate.rank() > slot.candidate.rank())
    }

    fn admit(&mut self, candidate: BroadcastCandidate) -> SchedulerAction {
        let request = SyncRequest {
            broadcast_id: candidate.broadcast_id,
            device: candidate.device.clone(),
            address_type: candidate.address_type,
            advertising_sid: candidate.advertising_sid,
            skip: self.skip,
            timeout: self.timeout,
        };
        self.slots.push(SyncSlot { candidate, state: SlotState::Registering });
        SchedulerAction::Register(request)
    }

    /// Mark the registering slot for `(device, sid)` as synced
    ///
    /// Returns `None` when no registration matches, in which case the caller
    /// should terminate the sync.
    pub fn on_sync_established(
        &mut self,
        device: &DeviceAddress,
        advertising_sid: AdvertisingSid,
        handle: SyncHandle,
        pa_interval: u16,
    ) -> Option<BroadcastId> {
        let slot = self.slots.iter_mut().find(|s| {
            s.state == SlotState::Registering
                && &s.candidate.device == device
                && s.candidate.advertising_sid == advertising_sid
        })?;
        slot.state = SlotState::Synced { handle, pa_interval };
        slot.candidate.fail_count = 0;
        self.fail_counts.remove(&slot.candidate.broadcast_id);
        Some(slot.broadcast_id())
    }

    /// Free the slot of a failed registration and requeue it while under the failure limit
    pub fn on_sync_failed(
        &mut self,
        device: &DeviceAddress,
        advertising_sid: AdvertisingSid,
    ) -> Option<FailedAttempt> {
        let idx = self.slots.iter().position(|s| {
            s.state == SlotState::Registering
                && &s.candidate.device == device
                && s.candidate.advertising_sid == advertising_sid
        })?;
        let mut candidate = self.slots.remove(idx).candidate;
        candidate.fail_count += 1;
        self.fail_counts.insert(candidate.broadcast_id, candidate.fail_count);

        let requeued = candidate.fail_count < self.max_failures;
        if requeued {
            self.queue.push(candidate.clone());
        }
        Some(FailedAttempt { candidate, requeued })
    }

    /// Free the slot of a sync the controller lost
    pub fn on_sync_lost(&mut self, handle: SyncHandle) -> Option<SyncSlot> {
        let idx = self.slots.iter().position(|s| s.sync_handle() == Some(handle))?;
        Some(self.slots.remove(idx))
    }

    /// Give up on a broadcast: drop it from the queue and release its slot
    pub fn release(&mut self, broadcast_id: BroadcastId) -> Option<SchedulerAction> {
        self.dequeue(broadcast_id);
        let idx = self.slots.iter().position(|s| s.broadcast_id() == broadcast_id)?;
        let slot = self.slots.remove(idx);
        Some(SchedulerAction::Unregister { broadcast_id, target: slot.target() })
    }

    pub fn dequeue(&mut self, broadcast_id: BroadcastId) -> bool {
        let before = self.queue.len();
        self.queue.retain(|c| c.broadcast_id != broadcast_id);
        before != self.queue.len()
    }

    pub fn slot(&self, broadcast_id: BroadcastId) -> Option<&SyncSlot> {
        self.slots.iter().find(|s| s.broadcast_id() == broadcast_id)
    }

    pub fn slot_for_handle(&self, handle: SyncHandle) -> Option<&SyncSlot> {
        self.slots.iter().find(|s| s.sync_handle() == Some(handle))
    }

    pub fn synced_handle(&self, broadcast_id: BroadcastId) -> Option<SyncHandle> {
        self.slot(broadcast_id).and_then(SyncSlot::sync_handle)
    }

    pub fn is_queued(&self, broadcast_id: BroadcastId) -> bool {
        self.queue.iter().any(|c| c.broadcast_id == broadcast_id)
    }

    /// Slots in admission order
    pub fn slots(&self) -> &[SyncSlot] {
        &self.slots
    }

    pub fn queued(&self) -> &[BroadcastCandidate] {
        &self.queue
    }

    pub fn synced_handles(&self) -> Vec<SyncHandle> {
        self.slots.iter().filter_map(SyncSlot::sync_handle).collect()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fail_count(&self, broadcast_id: BroadcastId) -> u32 {
        self.fail_counts.get(&broadcast_id).copied().unwrap_or(0)
    }
}
