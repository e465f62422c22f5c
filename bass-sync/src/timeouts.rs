//! Per-broadcast supervision timers
//!
//! At most one timer of each kind is armed per broadcast. Arming replaces
//! the previous timer; every arm gets a fresh generation so a firing that
//! raced with a cancel or re-arm is recognised as stale and ignored.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bass_parser::BroadcastId;
use serde::{Deserialize, Serialize};

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeoutKind {
    /// A sync kept only for a pending add after scanning stopped
    SyncTimeout,
    /// A source vanished while scanning
    SyncLostTimeout,
    /// A receiver dropped the BIG on its own
    BigMonitorTimeout,
    /// A broadcast with paused receivers is out of range
    BroadcastMonitorTimeout,
}

impl TimeoutKind {
    pub fn duration(self, config: &SyncConfig) -> Duration {
        match self {
            TimeoutKind::SyncTimeout => config.sync_timeout,
            TimeoutKind::SyncLostTimeout => config.sync_lost_timeout,
            TimeoutKind::BigMonitorTimeout => config.big_monitor_timeout,
            TimeoutKind::BroadcastMonitorTimeout => config.broadcast_monitor_timeout,
        }
    }
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutKind::SyncTimeout => "sync",
            TimeoutKind::SyncLostTimeout => "sync-lost",
            TimeoutKind::BigMonitorTimeout => "big-monitor",
            TimeoutKind::BroadcastMonitorTimeout => "broadcast-monitor",
        };
        f.write_str(name)
    }
}

/// A timer that reached its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueTimer {
    pub broadcast_id: BroadcastId,
    pub kind: TimeoutKind,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct ArmedTimer {
    deadline: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct TimeoutCoordinator {
    armed: HashMap<(BroadcastId, TimeoutKind), ArmedTimer>,
    next_generation: u64,
}

impl TimeoutCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` for `broadcast_id`, replacing any timer of the same kind
    pub fn arm(
        &mut self,
        broadcast_id: BroadcastId,
        kind: TimeoutKind,
        now: Instant,
        after: Duration,
    ) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.armed.insert((broadcast_id, kind), ArmedTimer { deadline: now + after, generation });
        tracing::debug!("Armed {} timer for {} ({:?})", kind, broadcast_id, after);
        generation
    }

    /// Arm only if no timer of this kind is running. Returns true if armed.
    pub fn arm_if_idle(
        &mut self,
        broadcast_id: BroadcastId,
        kind: TimeoutKind,
        now: Instant,
        after: Duration,
    ) -> bool {
        if self.is_armed(broadcast_id, kind) {
            return false;
        }
        self.arm(broadcast_id, kind, now, after);
        true
    }

    /// Cancel a timer; returns true if one was armed
    pub fn cancel(&mut self, broadcast_id: BroadcastId, kind: TimeoutKind) -> bool {
        let cancelled = self.armed.remove(&(broadcast_id, kind)).is_some();
        if cancelled {
            tracing::debug!("Cancelled {} timer for {}", kind, broadcast_id);
        }
        cancelled
    }

    /// Cancel every timer of `kind`, returning the broadcasts that had one
    pub fn cancel_kind(&mut self, kind: TimeoutKind) -> Vec<BroadcastId> {
        let mut cancelled: Vec<BroadcastId> = self
            .armed
            .keys()
            .filter(|(_, k)| *k == kind)
            .map(|(id, _)| *id)
            .collect();
        self.armed.retain(|(_, k), _| *k != kind);
        cancelled.sort();
        cancelled
    }

    pub fn is_armed(&self, broadcast_id: BroadcastId, kind: TimeoutKind) -> bool {
        self.armed.contains_key(&(broadcast_id, kind))
    }

    pub fn deadline(&self, broadcast_id: BroadcastId, kind: TimeoutKind) -> Option<Instant> {
        self.armed.get(&(broadcast_id, kind)).map(|t| t.deadline)
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.armed.values().map(|t| t.deadline).min()
    }

    /// Timers whose deadline is at or before `now`, earliest first
    pub fn due(&self, now: Instant) -> Vec<DueTimer> {
        let mut due: Vec<(Instant, DueTimer)> = self
            .armed
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(&(broadcast_id, kind), t)| {
                (t.deadline, DueTimer { broadcast_id, kind, generation: t.generation })
            })
            .collect();
        due.sort_by_key(|(deadline, timer)| (*deadline, timer.generation));
        due.into_iter().map(|(_, timer)| timer).collect()
    }

    /// Consume a firing. Returns false for a stale generation, leaving the
    /// current timer in place.
    pub fn fire(&mut self, broadcast_id: BroadcastId, kind: TimeoutKind, generation: u64) -> bool {
        match self.armed.get(&(broadcast_id, kind)) {
            Some(t) if t.generation == generation => {
                self.armed.remove(&(broadcast_id, kind));
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}
