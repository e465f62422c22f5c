//! Policy for receivers that stop following a broadcast
//!
//! A receiver going unsynced is either something the host asked for
//! (suspend, remove, a paused local broadcast) or something the receiver
//! did on its own. Host-caused pauses are remembered so `resume` can undo
//! them; receiver-caused pauses are supervised with timers and resumed
//! automatically when the BIG comes back.

use std::collections::{BTreeMap, HashMap};

use bass_parser::BroadcastId;

use crate::model::{BroadcastMetadata, DeviceAddress};

/// What the host asked a receiver to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostIntent {
    Suspend,
    Remove,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesyncCause {
    HostSuspend,
    HostRemove,
    SinkUnintentional,
}

/// Reaction to a receiver going unsynced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DesyncDecision {
    pub cache_paused: bool,
    pub arm_big_monitor: bool,
    pub force_resync: bool,
}

/// Reaction to the engine losing its own sync to a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLostAction {
    /// Forget the broadcast and report it lost
    DropNow,
    /// Give the scanner a grace period to see it again
    ArmSyncLostTimeout,
    /// Paused receivers are waiting on it; keep trying for a while
    ArmBroadcastMonitor { resync: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseCause {
    Host,
    Sink,
}

/// A receiver that stopped following a broadcast it may resume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PausedSink {
    pub device: DeviceAddress,
    pub metadata: BroadcastMetadata,
    pub cause: PauseCause,
    pub resume_requested: bool,
}

#[derive(Debug, Default)]
pub struct DesyncPolicyEngine {
    intents: HashMap<(DeviceAddress, BroadcastId), HostIntent>,
    paused: BTreeMap<(BroadcastId, DeviceAddress), PausedSink>,
}

impl DesyncPolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decide(cause: DesyncCause, scanning: bool) -> DesyncDecision {
        match cause {
            DesyncCause::HostSuspend => DesyncDecision { cache_paused: true, ..Default::default() },
            DesyncCause::HostRemove => DesyncDecision::default(),
            DesyncCause::SinkUnintentional => DesyncDecision {
                cache_paused: true,
                arm_big_monitor: true,
                force_resync: !scanning,
            },
        }
    }

    pub fn on_sync_lost(scanning: bool, has_unintentional_pauses: bool) -> SyncLostAction {
        match (scanning, has_unintentional_pauses) {
            (false, false) => SyncLostAction::DropNow,
            (true, false) => SyncLostAction::ArmSyncLostTimeout,
            (false, true) => SyncLostAction::ArmBroadcastMonitor { resync: true },
            (true, true) => SyncLostAction::ArmBroadcastMonitor { resync: false },
        }
    }

    /// Remember that the next unsync of `device` from `broadcast_id` is ours
    pub fn record_intent(
        &mut self,
        device: &DeviceAddress,
        broadcast_id: BroadcastId,
        intent: HostIntent,
    ) {
        self.intents.insert((device.clone(), broadcast_id), intent);
    }

    /// Classify an unsync, consuming any recorded intent
    pub fn classify(
        &mut self,
        device: &DeviceAddress,
        broadcast_id: BroadcastId,
        local_paused: bool,
    ) -> DesyncCause {
        match self.intents.remove(&(device.clone(), broadcast_id)) {
            Some(HostIntent::Suspend) => DesyncCause::HostSuspend,
            Some(HostIntent::Remove | HostIntent::Stop) => DesyncCause::HostRemove,
            None if local_paused => DesyncCause::HostSuspend,
            None => DesyncCause::SinkUnintentional,
        }
    }

    /// Cache a paused receiver. A host pause overrides a receiver pause, never the reverse.
    pub fn cache_paused(
        &mut self,
        device: &DeviceAddress,
        metadata: BroadcastMetadata,
        cause: PauseCause,
    ) {
        let key = (metadata.broadcast_id, device.clone());
        match self.paused.get_mut(&key) {
            Some(existing) if cause == PauseCause::Host => {
                existing.cause = PauseCause::Host;
                existing.metadata = metadata;
                existing.resume_requested = false;
            }
            Some(_) => {}
            None => {
                self.paused.insert(
                    key,
                    PausedSink { device: device.clone(), metadata, cause, resume_requested: false },
                );
            }
        }
    }

    pub fn clear_paused(
        &mut self,
        device: &DeviceAddress,
        broadcast_id: BroadcastId,
    ) -> Option<PausedSink> {
        self.paused.remove(&(broadcast_id, device.clone()))
    }

    pub fn clear_broadcast(&mut self, broadcast_id: BroadcastId) -> Vec<PausedSink> {
        let keys: Vec<_> = self
            .paused
            .keys()
            .filter(|(id, _)| *id == broadcast_id)
            .cloned()
            .collect();
        keys.into_iter().filter_map(|k| self.paused.remove(&k)).collect()
    }

    /// Every paused receiver, removed from the cache, grouped by broadcast
    pub fn take_all(&mut self) -> Vec<PausedSink> {
        std::mem::take(&mut self.paused).into_values().collect()
    }

    /// Receiver-caused pauses of `broadcast_id` not yet asked to resume; marks them asked
    pub fn take_resumable(&mut self, broadcast_id: BroadcastId) -> Vec<PausedSink> {
        self.paused
            .iter_mut()
            .filter(|((id, _), p)| {
                *id == broadcast_id && p.cause == PauseCause::Sink && !p.resume_requested
            })
            .map(|(_, p)| {
                p.resume_requested = true;
                p.clone()
            })
            .collect()
    }

    /// Remove and return the receiver-caused pauses of `broadcast_id`
    pub fn take_unintentional(&mut self, broadcast_id: BroadcastId) -> Vec<PausedSink> {
        let keys: Vec<_> = self
            .paused
            .iter()
            .filter(|((id, _), p)| *id == broadcast_id && p.cause == PauseCause::Sink)
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter().filter_map(|k| self.paused.remove(&k)).collect()
    }

    pub fn has_paused(&self, broadcast_id: BroadcastId) -> bool {
        self.paused.keys().any(|(id, _)| *id == broadcast_id)
    }

    pub fn has_unintentional(&self, broadcast_id: BroadcastId) -> bool {
        self.paused
            .iter()
            .any(|((id, _), p)| *id == broadcast_id && p.cause == PauseCause::Sink)
    }

    pub fn unintentional_broadcasts(&self) -> Vec<BroadcastId> {
        let mut ids: Vec<_> = self
            .paused
            .iter()
            .filter(|(_, p)| p.cause == PauseCause::Sink)
            .map(|((id, _), _)| *id)
            .collect();
        ids.dedup();
        ids
    }

    pub fn paused(&self) -> impl Iterator<Item = &PausedSink> {
        self.paused.values()
    }

    pub fn forget_device(&mut self, device: &DeviceAddress) {
        self.intents.retain(|(d, _), _| d != device);
        self.paused.retain(|(_, d), _| d != device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::metadata_for;
    use rstest::rstest;

    fn bid(raw: u32) -> BroadcastId {
        BroadcastId::new(raw).unwrap()
    }

    fn dev(last: u8) -> DeviceAddress {
        DeviceAddress::new(format!("BB:BB:BB:BB:BB:{last:02X}"))
    }

    fn decision(cache_paused: bool, arm_big_monitor: bool, force_resync: bool) -> DesyncDecision {
        DesyncDecision {
            cache_paused,
            arm_big_monitor,
            force_resync,
        }
    }

    #[rstest]
    #[case(DesyncCause::HostSuspend, true, decision(true, false, false))]
    #[case(DesyncCause::HostSuspend, false, decision(true, false, false))]
    #[case(DesyncCause::HostRemove, true, DesyncDecision::default())]
    #[case(DesyncCause::HostRemove, false, DesyncDecision::default())]
    #[case(DesyncCause::SinkUnintentional, true, decision(true, true, false))]
    #[case(DesyncCause::SinkUnintentional, false, decision(true, true, true))]
    fn test_decision_table(
        #[case] cause: DesyncCause,
        #[case] scanning: bool,
        #[case] expected: DesyncDecision,
    ) {
        assert_eq!(DesyncPolicyEngine::decide(cause, scanning), expected);
    }

    #[rstest]
    #[case(false, false, SyncLostAction::DropNow)]
    #[case(true, false, SyncLostAction::ArmSyncLostTimeout)]
    #[case(false, true, SyncLostAction::ArmBroadcastMonitor { resync: true })]
    #[case(true, true, SyncLostAction::ArmBroadcastMonitor { resync: false })]
    fn test_sync_lost_table(
        #[case] scanning: bool,
        #[case] paused: bool,
        #[case] expected: SyncLostAction,
    ) {
        assert_eq!(DesyncPolicyEngine::on_sync_lost(scanning, paused), expected);
    }

    #[test]
    fn test_intent_consumed_once() {
        let mut engine = DesyncPolicyEngine::new();
        engine.record_intent(&dev(1), bid(1), HostIntent::Suspend);
        assert_eq!(engine.classify(&dev(1), bid(1), false), DesyncCause::HostSuspend);
        assert_eq!(engine.classify(&dev(1), bid(1), false), DesyncCause::SinkUnintentional);
        assert_eq!(engine.classify(&dev(1), bid(1), true), DesyncCause::HostSuspend);

        engine.record_intent(&dev(1), bid(1), HostIntent::Stop);
        assert_eq!(engine.classify(&dev(1), bid(1), false), DesyncCause::HostRemove);
    }

    #[test]
    fn test_host_pause_overrides_sink_pause() {
        let mut engine = DesyncPolicyEngine::new();
        engine.cache_paused(&dev(1), metadata_for(bid(2)), PauseCause::Sink);
        assert!(engine.has_unintentional(bid(2)));
        engine.cache_paused(&dev(1), metadata_for(bid(2)), PauseCause::Host);
        assert!(!engine.has_unintentional(bid(2)));
        engine.cache_paused(&dev(1), metadata_for(bid(2)), PauseCause::Sink);
        assert!(!engine.has_unintentional(bid(2)));
        assert!(engine.has_paused(bid(2)));
    }

    #[test]
    fn test_resumable_handed_out_once() {
        let mut engine = DesyncPolicyEngine::new();
        engine.cache_paused(&dev(1), metadata_for(bid(3)), PauseCause::Sink);
        engine.cache_paused(&dev(2), metadata_for(bid(3)), PauseCause::Host);

        let resumable = engine.take_resumable(bid(3));
        assert_eq!(resumable.len(), 1);
        assert_eq!(resumable[0].device, dev(1));
        assert!(engine.take_resumable(bid(3)).is_empty());

        let dropped = engine.take_unintentional(bid(3));
        assert_eq!(dropped.len(), 1);
        assert!(engine.has_paused(bid(3)));
        assert_eq!(engine.take_all().len(), 1);
        assert!(!engine.has_paused(bid(3)));
    }

    #[test]
    fn test_forget_device() {
        let mut engine = DesyncPolicyEngine::new();
        engine.cache_paused(&dev(1), metadata_for(bid(4)), PauseCause::Sink);
        engine.record_intent(&dev(1), bid(4), HostIntent::Remove);
        engine.forget_device(&dev(1));
        assert!(!engine.has_paused(bid(4)));
        assert_eq!(engine.classify(&dev(1), bid(4), false), DesyncCause::SinkUnintentional);
    }
}
