//! Property-based tests for sync slot arbitration and discovery reporting
//!
//! Random interleavings of scanner, sync and search events are replayed
//! against a controller wired to fakes, checking the engine's invariants
//! after every step.

use std::collections::HashSet;

use proptest::prelude::*;

use bass_sync::testing::{Harness, TransportCall};
use bass_sync::{BroadcastId, Notification, SyncConfig, SyncHandle};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Scan { id: u32, rssi: i8 },
    Establish { id: u32 },
    Fail { id: u32 },
    Lose { id: u32 },
    Base { id: u32 },
    BigInfo { id: u32 },
    Restart,
}

fn bid(raw: u32) -> BroadcastId {
    BroadcastId::new(raw).unwrap()
}

/// Each broadcast always syncs on the handle equal to its id
fn handle(id: u32) -> SyncHandle {
    SyncHandle(id as u16)
}

/// Strategy for a small pool of broadcast ids so steps collide often
fn id_strategy() -> impl Strategy<Value = u32> {
    1u32..=8
}

fn rssi_strategy() -> impl Strategy<Value = i8> {
    -90i8..=-30
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (id_strategy(), rssi_strategy()).prop_map(|(id, rssi)| Step::Scan { id, rssi }),
        3 => id_strategy().prop_map(|id| Step::Establish { id }),
        1 => id_strategy().prop_map(|id| Step::Fail { id }),
        1 => id_strategy().prop_map(|id| Step::Lose { id }),
        2 => id_strategy().prop_map(|id| Step::Base { id }),
        2 => id_strategy().prop_map(|id| Step::BigInfo { id }),
        1 => Just(Step::Restart),
    ]
}

fn apply(h: &mut Harness, step: &Step) {
    match *step {
        Step::Scan { id, rssi } => h.scan(bid(id), rssi),
        Step::Establish { id } => h.establish(bid(id), handle(id)),
        Step::Fail { id } => h.fail_sync(bid(id), 0x3E),
        Step::Lose { id } => h.lose_sync(handle(id)),
        Step::Base { id } => h.report_base(handle(id)),
        Step::BigInfo { id } => h.report_big_info(handle(id)),
        Step::Restart => {
            h.stop_searching();
            h.start_searching();
        }
    }
}

fn searching_harness(slots: usize) -> Harness {
    let mut h = Harness::new(SyncConfig::default().with_max_sync_slots(slots));
    h.start_searching();
    h
}

// ============================================================================
// Slot capacity
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The scheduler never holds more slots than the controller supports,
    /// and never two slots for the same broadcast
    #[test]
    fn prop_slots_within_capacity(
        slots in 1usize..=4,
        steps in prop::collection::vec(step_strategy(), 1..80),
    ) {
        let mut h = searching_harness(slots);

        for step in &steps {
            apply(&mut h, step);

            let held = h.controller.scheduler().slots();
            prop_assert!(held.len() <= slots, "{} slots held after {:?}", held.len(), step);

            let unique: HashSet<BroadcastId> = held.iter().map(|s| s.broadcast_id()).collect();
            prop_assert_eq!(unique.len(), held.len());
        }
    }

    /// Scanning a broadcast that is already synced never registers it again
    #[test]
    fn prop_repeat_scan_keeps_sync(
        steps in prop::collection::vec(step_strategy(), 0..40),
        pick in any::<prop::sample::Index>(),
        rssi in rssi_strategy(),
    ) {
        let mut h = searching_harness(3);
        for step in &steps {
            apply(&mut h, step);
        }
        let synced: Vec<BroadcastId> = h
            .controller
            .scheduler()
            .slots()
            .iter()
            .filter(|s| s.is_synced())
            .map(|s| s.broadcast_id())
            .collect();
        if synced.is_empty() {
            return Ok(());
        }
        let id = pick.get(&synced).value();
        h.transport.take_calls();

        h.scan(bid(id), rssi);

        let registered_again = h
            .transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::RegisterSync(r) if r.broadcast_id == bid(id)));
        prop_assert!(!registered_again);
        prop_assert!(h.controller.scheduler().synced_handle(bid(id)).is_some());
    }
}

// ============================================================================
// Discovery reporting
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// `SourceFound` is reported at most once per broadcast per search,
    /// unless the broadcast was reported lost in between
    #[test]
    fn prop_source_found_once_per_search(
        steps in prop::collection::vec(step_strategy(), 1..100),
    ) {
        let mut h = searching_harness(3);
        let mut found: HashSet<BroadcastId> = HashSet::new();

        for step in &steps {
            apply(&mut h, step);

            for notification in h.notifications() {
                match notification {
                    Notification::SearchStarted => found.clear(),
                    Notification::SourceLost { broadcast_id } => {
                        found.remove(&broadcast_id);
                    }
                    Notification::SourceFound(metadata) => {
                        prop_assert!(
                            found.insert(metadata.broadcast_id),
                            "{} reported twice in one search",
                            metadata.broadcast_id
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    /// After a sync is established and lost, nothing answers for its handle
    #[test]
    fn prop_established_then_lost_forgets_handle(
        ids in prop::collection::btree_set(id_strategy(), 1..=4),
    ) {
        let mut h = searching_harness(4);
        for &id in &ids {
            h.scan(bid(id), -50);
            h.establish(bid(id), handle(id));
            prop_assert_eq!(h.controller.broadcast_id_for_sync_handle(handle(id)), Some(bid(id)));
        }

        for &id in &ids {
            h.lose_sync(handle(id));

            prop_assert_eq!(h.controller.broadcast_id_for_sync_handle(handle(id)), None);
            prop_assert_eq!(h.controller.device_for_sync_handle(handle(id)), None);
            prop_assert!(!h.controller.active_synced_sources().contains(&handle(id)));
        }
        prop_assert!(h.controller.active_synced_sources().is_empty());
    }
}
