//! Fan-out of source operations across coordinated receivers
//!
//! A group add marks the broadcast "sticky" on every member it reached, so
//! later modify, remove and switch calls on one member are mirrored to the
//! others. The mark on a member is dropped when that member changes its
//! source on its own, or when the broadcast is removed.
//!
//! The coordinator also tracks which receive-state changes it asked for, so
//! each reported change can be attributed to the host or to the receiver.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use bass_parser::BroadcastId;

use crate::error::SyncError;
use crate::model::{BroadcastMetadata, DeviceAddress, PaSync, ReceiveState, SourceId};
use crate::transport::{GroupMembership, ReceiverMessage, ReceiverStateMachines};

/// Broadcasts that were added to a group, per member
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GroupOperationState {
    sticky: BTreeSet<(BroadcastId, DeviceAddress)>,
}

impl GroupOperationState {
    pub fn mark(&mut self, broadcast_id: BroadcastId, device: &DeviceAddress) {
        self.sticky.insert((broadcast_id, device.clone()));
    }

    pub fn clear(&mut self, broadcast_id: BroadcastId, device: &DeviceAddress) -> bool {
        self.sticky.remove(&(broadcast_id, device.clone()))
    }

    pub fn is_sticky(&self, broadcast_id: BroadcastId, device: &DeviceAddress) -> bool {
        self.sticky.contains(&(broadcast_id, device.clone()))
    }

    pub fn members(&self, broadcast_id: BroadcastId) -> Vec<DeviceAddress> {
        self.sticky
            .iter()
            .filter(|(id, _)| *id == broadcast_id)
            .map(|(_, device)| device.clone())
            .collect()
    }

    fn forget_device(&mut self, device: &DeviceAddress) {
        self.sticky.retain(|(_, d)| d != device);
    }

    fn rename(&mut self, from: BroadcastId, to: BroadcastId, device: &DeviceAddress) {
        if self.clear(from, device) {
            self.mark(to, device);
        }
    }
}

/// Who caused a receive-state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribution {
    Host,
    Autonomous,
}

/// What changed in one receive-state report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveStateDelta {
    pub previous: Option<ReceiveState>,
    pub attribution: Attribution,
    /// Broadcast that newly occupies the slot
    pub added: Option<BroadcastId>,
    /// Broadcast that left the slot
    pub removed: Option<BroadcastId>,
    /// Same broadcast, was synced, is no longer
    pub desynced: Option<BroadcastId>,
    /// Broadcast the receiver is now following after not following it
    pub resynced: Option<BroadcastId>,
    /// A deferred removal can now be sent
    pub remove_now: bool,
}

/// Per-device outcome of a fanned-out operation
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOutReport {
    pub dispatched: Vec<(DeviceAddress, SourceId)>,
    pub failed: Vec<(DeviceAddress, SyncError)>,
}

impl FanOutReport {
    fn dispatched(&mut self, device: &DeviceAddress, source_id: SourceId) {
        self.dispatched.push((device.clone(), source_id));
    }

    fn failed(&mut self, device: &DeviceAddress, error: SyncError) {
        self.failed.push((device.clone(), error));
    }
}

#[derive(Debug, Default)]
pub struct GroupSourceCoordinator {
    state: GroupOperationState,
    /// Slots this engine filled, per device and broadcast
    reservations: HashMap<(DeviceAddress, BroadcastId), SourceId>,
    awaiting: HashSet<(DeviceAddress, BroadcastId)>,
    pending_removals: HashSet<(DeviceAddress, SourceId)>,
    known: BTreeMap<(DeviceAddress, SourceId), ReceiveState>,
}

impl GroupSourceCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_state(&self) -> &GroupOperationState {
        &self.state
    }

    /// Devices an add should reach: the requested one, then connected group members
    pub fn targets(
        &self,
        groups: &dyn GroupMembership,
        receivers: &dyn ReceiverStateMachines,
        device: &DeviceAddress,
        is_group_op: bool,
    ) -> Vec<DeviceAddress> {
        let mut targets = vec![device.clone()];
        if is_group_op {
            for member in groups.group_devices(device) {
                if !targets.contains(&member) && receivers.is_connected(&member) {
                    targets.push(member);
                }
            }
        }
        targets
    }

    /// Slot `device` uses for `broadcast_id`, reported or reserved
    pub fn source_id_for(
        &self,
        receivers: &dyn ReceiverStateMachines,
        device: &DeviceAddress,
        broadcast_id: BroadcastId,
    ) -> Option<SourceId> {
        receivers
            .all_sources(device)
            .iter()
            .find(|s| s.broadcast_id == Some(broadcast_id))
            .map(|s| s.source_id)
            .or_else(|| self.reservations.get(&(device.clone(), broadcast_id)).copied())
    }

    /// An empty slot on `device`
    ///
    /// Slots held for adds the receiver has not reported yet are only handed
    /// out when no other slot is empty, and then that stale reservation is dropped.
    fn free_source_id(
        &mut self,
        states: &[ReceiveState],
        device: &DeviceAddress,
    ) -> Option<SourceId> {
        let reserved: HashMap<SourceId, BroadcastId> = self
            .reservations
            .iter()
            .filter(|((d, _), _)| d == device)
            .map(|((_, id), source_id)| (*source_id, *id))
            .collect();
        let mut empty = states.iter().filter(|s| s.is_empty()).map(|s| s.source_id);

        if let Some(free) = empty.clone().find(|id| !reserved.contains_key(id)) {
            return Some(free);
        }
        let (source_id, stale) = empty.find_map(|id| reserved.get(&id).map(|b| (id, *b)))?;
        tracing::debug!(
            "Add of {} to {} never showed up, reusing source {}",
            stale,
            device,
            source_id
        );
        self.reservations.remove(&(device.clone(), stale));
        self.awaiting.remove(&(device.clone(), stale));
        Some(source_id)
    }

    /// A slot this engine filled whose receiver is not following it
    fn switchable(
        &self,
        states: &[ReceiveState],
        device: &DeviceAddress,
    ) -> Option<(SourceId, BroadcastId)> {
        states.iter().find_map(|s| {
            let id = s.broadcast_id?;
            let ours = self.reservations.get(&(device.clone(), id)) == Some(&s.source_id);
            (ours && !s.is_synced()).then_some((s.source_id, id))
        })
    }

    fn reserve(&mut self, device: &DeviceAddress, broadcast_id: BroadcastId, source_id: SourceId) {
        self.reservations.insert((device.clone(), broadcast_id), source_id);
    }

    fn move_reservation(
        &mut self,
        device: &DeviceAddress,
        from: BroadcastId,
        to: BroadcastId,
        source_id: SourceId,
    ) {
        self.reservations.remove(&(device.clone(), from));
        self.reserve(device, to, source_id);
    }

    fn expect_change(&mut self, device: &DeviceAddress, broadcast_id: BroadcastId) {
        self.awaiting.insert((device.clone(), broadcast_id));
    }

    /// Add a source to every target, each with its own slot
    pub fn add_source(
        &mut self,
        receivers: &mut dyn ReceiverStateMachines,
        targets: &[DeviceAddress],
        metadata: &BroadcastMetadata,
        pa_sync: PaSync,
        is_group_op: bool,
    ) -> FanOutReport {
        let broadcast_id = metadata.broadcast_id;
        let mut report = FanOutReport::default();

        for device in targets {
            if !receivers.is_connected(device) {
                report.failed(device, SyncError::LinkUnavailable(device.clone()));
                continue;
            }

            let states = receivers.all_sources(device);
            let (source_id, message) = if let Some(existing) =
                states.iter().find(|s| s.broadcast_id == Some(broadcast_id))
            {
                let message = ReceiverMessage::UpdateSource {
                    source_id: existing.source_id,
                    metadata: Some(metadata.clone()),
                    pa_sync,
                };
                (existing.source_id, message)
            } else if let Some(source_id) = self.free_source_id(&states, device) {
                self.reserve(device, broadcast_id, source_id);
                let message = ReceiverMessage::AddSource {
                    source_id,
                    metadata: metadata.clone(),
                    pa_sync,
                };
                (source_id, message)
            } else if let Some((old_source_id, old_id)) = self.switchable(&states, device) {
                tracing::debug!(
                    "{} is full, switching out {} for {}",
                    device,
                    old_id,
                    broadcast_id
                );
                self.move_reservation(device, old_id, broadcast_id, old_source_id);
                self.expect_change(device, old_id);
                let message = ReceiverMessage::SwitchSource {
                    old_source_id,
                    metadata: metadata.clone(),
                    pa_sync,
                };
                (old_source_id, message)
            } else {
                tracing::warn!("{} has no receive state left for {}", device, broadcast_id);
                receivers
                    .send_message(device, ReceiverMessage::ReachedMaxSourceLimit { broadcast_id });
                report.failed(device, SyncError::RemoteResourceExhausted(device.clone()));
                continue;
            };

            receivers.send_message(device, message);
            self.expect_change(device, broadcast_id);
            if is_group_op {
                self.state.mark(broadcast_id, device);
            }
            report.dispatched(device, source_id);
        }

        report
    }

    /// Broadcast occupying `source_id` on `device`
    fn occupant(
        receivers: &dyn ReceiverStateMachines,
        device: &DeviceAddress,
        source_id: SourceId,
    ) -> Result<BroadcastId, SyncError> {
        receivers
            .all_sources(device)
            .into_iter()
            .find(|s| s.source_id == source_id)
            .and_then(|s| s.broadcast_id)
            .ok_or_else(|| {
                SyncError::InvalidOperationTarget(format!("no source {source_id} on {device}"))
            })
    }

    /// `device` first, then the other members the broadcast is sticky on
    fn mirrored_members(
        &self,
        broadcast_id: BroadcastId,
        device: &DeviceAddress,
    ) -> Vec<DeviceAddress> {
        let mut members = vec![device.clone()];
        if self.state.is_sticky(broadcast_id, device) {
            members.extend(self.state.members(broadcast_id).into_iter().filter(|m| m != device));
        }
        members
    }

    /// Modify a source, mirroring the change to sticky group members
    pub fn modify_source(
        &mut self,
        receivers: &mut dyn ReceiverStateMachines,
        device: &DeviceAddress,
        source_id: SourceId,
        metadata: &BroadcastMetadata,
        pa_sync: PaSync,
    ) -> Result<FanOutReport, SyncError> {
        let old_id = Self::occupant(receivers, device, source_id)?;
        let new_id = metadata.broadcast_id;
        let mut report = FanOutReport::default();

        for member in self.mirrored_members(old_id, device) {
            if !receivers.is_connected(&member) {
                report.failed(&member, SyncError::LinkUnavailable(member.clone()));
                continue;
            }
            let member_source = if &member == device {
                Some(source_id)
            } else {
                self.source_id_for(receivers, &member, old_id)
            };
            let Some(member_source) = member_source else {
                continue;
            };
            let member_pa_sync = if &member == device {
                pa_sync
            } else {
                PaSync::SyncPastAvailable
            };

            receivers.send_message(
                &member,
                ReceiverMessage::UpdateSource {
                    source_id: member_source,
                    metadata: Some(metadata.clone()),
                    pa_sync: member_pa_sync,
                },
            );
            self.expect_change(&member, new_id);
            if new_id != old_id {
                self.expect_change(&member, old_id);
                self.move_reservation(&member, old_id, new_id, member_source);
                self.state.rename(old_id, new_id, &member);
            }
            report.dispatched(&member, member_source);
        }

        Ok(report)
    }

    /// Update one receiver's source without touching the rest of its group
    pub fn update_source(
        &mut self,
        receivers: &mut dyn ReceiverStateMachines,
        device: &DeviceAddress,
        source_id: SourceId,
        metadata: Option<BroadcastMetadata>,
        pa_sync: PaSync,
    ) -> Result<(), SyncError> {
        let broadcast_id = Self::occupant(receivers, device, source_id)?;
        receivers.send_message(
            device,
            ReceiverMessage::UpdateSource {
                source_id,
                metadata,
                pa_sync,
            },
        );
        self.expect_change(device, broadcast_id);
        Ok(())
    }

    /// Remove a source; a receiver still following it is first told to stop
    /// and removed once it reports unsynced.
    pub fn remove_source(
        &mut self,
        receivers: &mut dyn ReceiverStateMachines,
        device: &DeviceAddress,
        source_id: SourceId,
        fan_out: bool,
    ) -> Result<FanOutReport, SyncError> {
        let broadcast_id = Self::occupant(receivers, device, source_id)?;
        let members = if fan_out {
            self.mirrored_members(broadcast_id, device)
        } else {
            vec![device.clone()]
        };
        let mut report = FanOutReport::default();

        for member in &members {
            if !receivers.is_connected(member) {
                report.failed(member, SyncError::LinkUnavailable(member.clone()));
                continue;
            }
            let member_source = if member == device {
                Some(source_id)
            } else {
                self.source_id_for(receivers, member, broadcast_id)
            };
            let Some(member_source) = member_source else {
                continue;
            };

            if receivers.is_synced_to_source(member, member_source) {
                let metadata = receivers.current_broadcast_metadata(member, member_source);
                receivers.send_message(
                    member,
                    ReceiverMessage::UpdateSource {
                        source_id: member_source,
                        metadata,
                        pa_sync: PaSync::DoNotSync,
                    },
                );
                self.pending_removals.insert((member.clone(), member_source));
            } else {
                receivers.send_message(
                    member,
                    ReceiverMessage::RemoveSource {
                        source_id: member_source,
                    },
                );
            }
            self.expect_change(member, broadcast_id);
            report.dispatched(member, member_source);
        }

        for member in &members {
            self.state.clear(broadcast_id, member);
        }
        Ok(report)
    }

    /// Replace a source with another broadcast, mirrored to sticky members
    pub fn switch_source(
        &mut self,
        receivers: &mut dyn ReceiverStateMachines,
        device: &DeviceAddress,
        old_source_id: SourceId,
        metadata: &BroadcastMetadata,
        pa_sync: PaSync,
    ) -> Result<FanOutReport, SyncError> {
        let old_id = Self::occupant(receivers, device, old_source_id)?;
        let new_id = metadata.broadcast_id;
        let mut report = FanOutReport::default();

        for member in self.mirrored_members(old_id, device) {
            if !receivers.is_connected(&member) {
                report.failed(&member, SyncError::LinkUnavailable(member.clone()));
                continue;
            }
            let member_source = if &member == device {
                Some(old_source_id)
            } else {
                self.source_id_for(receivers, &member, old_id)
            };
            let Some(member_source) = member_source else {
                continue;
            };

            receivers.send_message(
                &member,
                ReceiverMessage::SwitchSource {
                    old_source_id: member_source,
                    metadata: metadata.clone(),
                    pa_sync,
                },
            );
            self.expect_change(&member, old_id);
            self.expect_change(&member, new_id);
            self.move_reservation(&member, old_id, new_id, member_source);
            self.state.rename(old_id, new_id, &member);
            report.dispatched(&member, member_source);
        }

        Ok(report)
    }

    /// Record a receive-state report and work out what it means
    pub fn on_receive_state(
        &mut self,
        device: &DeviceAddress,
        state: &ReceiveState,
    ) -> ReceiveStateDelta {
        let key = (device.clone(), state.source_id);
        let previous = self.known.insert(key.clone(), state.clone());
        let previous_id = previous.as_ref().and_then(|p| p.broadcast_id);
        let current_id = state.broadcast_id;

        let added = current_id.filter(|id| previous_id != Some(*id));
        let removed = previous_id.filter(|id| current_id != Some(*id));
        let mut attribution = Attribution::Host;

        for id in added.iter().chain(removed.iter()) {
            if !self.awaiting.remove(&(device.clone(), *id)) {
                attribution = Attribution::Autonomous;
            }
        }

        if let Some(id) = removed {
            if self.reservations.get(&(device.clone(), id)) == Some(&state.source_id) {
                self.reservations.remove(&(device.clone(), id));
            }
            if attribution == Attribution::Autonomous && self.state.clear(id, device) {
                tracing::debug!("{} left {} on its own, group link dropped", device, id);
            }
        }
        if let Some(id) = added {
            if attribution == Attribution::Host {
                self.reserve(device, id, state.source_id);
            }
        }
        if added.is_none() && removed.is_none() {
            if let Some(id) = current_id {
                if !self.awaiting.remove(&(device.clone(), id)) {
                    attribution = Attribution::Autonomous;
                }
            }
        }

        let was_synced = previous.as_ref().is_some_and(ReceiveState::is_synced);
        let same_source = previous_id.is_some() && previous_id == current_id;
        let desynced = current_id.filter(|_| same_source && was_synced && !state.is_synced());
        let resynced = current_id.filter(|_| state.is_synced() && (!same_source || !was_synced));

        let remove_now = if current_id.is_none() {
            self.pending_removals.remove(&key);
            false
        } else {
            !state.is_synced() && self.pending_removals.remove(&key)
        };

        ReceiveStateDelta { previous, attribution, added, removed, desynced, resynced, remove_now }
    }

    /// Last reported states that name `broadcast_id`
    pub fn known_states_for(
        &self,
        broadcast_id: BroadcastId,
    ) -> Vec<(DeviceAddress, ReceiveState)> {
        self.known
            .iter()
            .filter(|(_, s)| s.broadcast_id == Some(broadcast_id))
            .map(|((device, _), s)| (device.clone(), s.clone()))
            .collect()
    }

    /// Broadcasts some receiver is currently following
    pub fn followed_broadcasts(&self) -> HashSet<BroadcastId> {
        self.known
            .values()
            .filter(|s| s.is_synced())
            .filter_map(|s| s.broadcast_id)
            .collect()
    }

    /// Drop everything tied to a receiver that went away
    pub fn forget_device(&mut self, device: &DeviceAddress) {
        self.state.forget_device(device);
        self.reservations.retain(|(d, _), _| d != device);
        self.awaiting.retain(|(d, _)| d != device);
        self.pending_removals.retain(|(d, _)| d != device);
        self.known.retain(|(d, _), _| d != device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PaSyncState;
    use crate::testing::{metadata_for, receive_state, FakeGroups, FakeReceivers};

    fn bid(raw: u32) -> BroadcastId {
        BroadcastId::new(raw).unwrap()
    }

    fn dev(last: u8) -> DeviceAddress {
        DeviceAddress::new(format!("AA:AA:AA:AA:AA:{last:02X}"))
    }

    fn add(
        coordinator: &mut GroupSourceCoordinator,
        receivers: &mut FakeReceivers,
        targets: &[DeviceAddress],
        broadcast_id: BroadcastId,
        is_group_op: bool,
    ) -> FanOutReport {
        let metadata = metadata_for(broadcast_id);
        let pa_sync = PaSync::SyncPastAvailable;
        coordinator.add_source(receivers, targets, &metadata, pa_sync, is_group_op)
    }

    #[test]
    fn test_group_add_picks_independent_source_ids() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 2);
        receivers.add_device(&dev(2), 2);
        receivers.set_state(&dev(2), receive_state(1, bid(9), PaSyncState::Synchronized, 1));
        let groups = FakeGroups::new();
        groups.set_group(&[dev(1), dev(2)]);

        let mut coordinator = GroupSourceCoordinator::new();
        let targets = coordinator.targets(&groups, &receivers, &dev(1), true);
        assert_eq!(targets, vec![dev(1), dev(2)]);

        let mut handle = receivers.clone();
        let report = add(&mut coordinator, &mut handle, &targets, bid(5), true);
        assert_eq!(report.dispatched, vec![(dev(1), SourceId(1)), (dev(2), SourceId(2))]);
        assert!(coordinator.group_state().is_sticky(bid(5), &dev(1)));
        assert!(coordinator.group_state().is_sticky(bid(5), &dev(2)));
    }

    #[test]
    fn test_reserved_slot_not_reused_before_report() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 2);
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();

        add(&mut coordinator, &mut handle, &[dev(1)], bid(1), false);
        let report = add(&mut coordinator, &mut handle, &[dev(1)], bid(2), false);
        assert_eq!(report.dispatched, vec![(dev(1), SourceId(2))]);
        assert_eq!(coordinator.source_id_for(&receivers, &dev(1), bid(1)), Some(SourceId(1)));
    }

    #[test]
    fn test_unanswered_add_does_not_hold_last_slot() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 1);
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();

        add(&mut coordinator, &mut handle, &[dev(1)], bid(1), false);
        receivers.take_sent();
        let report = add(&mut coordinator, &mut handle, &[dev(1)], bid(2), false);

        assert_eq!(report.dispatched, vec![(dev(1), SourceId(1))]);
        assert!(report.failed.is_empty());
        assert!(matches!(
            receivers.sent_to(&dev(1)).as_slice(),
            [ReceiverMessage::AddSource { source_id: SourceId(1), .. }]
        ));
        assert_eq!(coordinator.source_id_for(&receivers, &dev(1), bid(1)), None);
        assert_eq!(coordinator.source_id_for(&receivers, &dev(1), bid(2)), Some(SourceId(1)));
    }

    #[test]
    fn test_full_device_switches_unsynced_own_source() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 1);
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();

        add(&mut coordinator, &mut handle, &[dev(1)], bid(1), false);
        let state = receive_state(1, bid(1), PaSyncState::Idle, 0);
        receivers.set_state(&dev(1), state.clone());
        coordinator.on_receive_state(&dev(1), &state);
        receivers.take_sent();

        let report = add(&mut coordinator, &mut handle, &[dev(1)], bid(2), false);
        assert_eq!(report.dispatched, vec![(dev(1), SourceId(1))]);
        assert!(matches!(
            receivers.sent_to(&dev(1)).as_slice(),
            [ReceiverMessage::SwitchSource { old_source_id: SourceId(1), .. }]
        ));
    }

    #[test]
    fn test_full_device_reports_max_source_limit() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 1);
        receivers.set_state(&dev(1), receive_state(1, bid(9), PaSyncState::Synchronized, 1));
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();

        let report = add(&mut coordinator, &mut handle, &[dev(1)], bid(2), false);
        assert!(report.dispatched.is_empty());
        assert_eq!(report.failed, vec![(dev(1), SyncError::RemoteResourceExhausted(dev(1)))]);
        assert_eq!(
            receivers.sent_to(&dev(1)),
            vec![ReceiverMessage::ReachedMaxSourceLimit { broadcast_id: bid(2) }]
        );
    }

    #[test]
    fn test_remove_synced_source_is_deferred() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 2);
        let synced = receive_state(1, bid(3), PaSyncState::Synchronized, 1);
        receivers.set_state(&dev(1), synced.clone());
        let mut coordinator = GroupSourceCoordinator::new();
        coordinator.on_receive_state(&dev(1), &synced);
        let mut handle = receivers.clone();

        coordinator.remove_source(&mut handle, &dev(1), SourceId(1), true).unwrap();
        assert!(matches!(
            receivers.sent_to(&dev(1)).as_slice(),
            [ReceiverMessage::UpdateSource { pa_sync: PaSync::DoNotSync, .. }]
        ));

        let unsynced = receive_state(1, bid(3), PaSyncState::Idle, 0);
        let delta = coordinator.on_receive_state(&dev(1), &unsynced);
        assert!(delta.remove_now);
        assert_eq!(delta.desynced, Some(bid(3)));

        let again = coordinator.on_receive_state(&dev(1), &unsynced);
        assert!(!again.remove_now);
    }

    #[test]
    fn test_remove_unknown_source() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 2);
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();
        let err = coordinator.remove_source(&mut handle, &dev(1), SourceId(2), true).unwrap_err();
        assert!(matches!(err, SyncError::InvalidOperationTarget(_)));
    }

    #[test]
    fn test_autonomous_change_clears_sticky() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 2);
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();
        add(&mut coordinator, &mut handle, &[dev(1)], bid(4), true);

        let added = receive_state(1, bid(4), PaSyncState::Synchronized, 1);
        let delta = coordinator.on_receive_state(&dev(1), &added);
        assert_eq!(delta.attribution, Attribution::Host);
        assert_eq!(delta.added, Some(bid(4)));
        assert!(coordinator.group_state().is_sticky(bid(4), &dev(1)));

        let replaced = receive_state(1, bid(8), PaSyncState::Synchronized, 1);
        let delta = coordinator.on_receive_state(&dev(1), &replaced);
        assert_eq!(delta.attribution, Attribution::Autonomous);
        assert_eq!(delta.removed, Some(bid(4)));
        assert!(!coordinator.group_state().is_sticky(bid(4), &dev(1)));
    }

    #[test]
    fn test_modify_mirrors_to_sticky_members() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 1);
        receivers.add_device(&dev(2), 1);
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();
        add(&mut coordinator, &mut handle, &[dev(1), dev(2)], bid(6), true);
        for device in [dev(1), dev(2)] {
            let state = receive_state(1, bid(6), PaSyncState::Synchronized, 1);
            receivers.set_state(&device, state.clone());
            coordinator.on_receive_state(&device, &state);
        }
        receivers.take_sent();

        let report = coordinator
            .modify_source(
                &mut handle,
                &dev(2),
                SourceId(1),
                &metadata_for(bid(6)),
                PaSync::SyncPastAvailable,
            )
            .unwrap();
        assert_eq!(report.dispatched, vec![(dev(2), SourceId(1)), (dev(1), SourceId(1))]);
    }

    #[test]
    fn test_forget_device() {
        let receivers = FakeReceivers::new();
        receivers.add_device(&dev(1), 1);
        let mut coordinator = GroupSourceCoordinator::new();
        let mut handle = receivers.clone();
        add(&mut coordinator, &mut handle, &[dev(1)], bid(6), true);
        coordinator.forget_device(&dev(1));
        assert!(!coordinator.group_state().is_sticky(bid(6), &dev(1)));
        assert_eq!(coordinator.source_id_for(&receivers, &dev(1), bid(6)), None);
    }
}
