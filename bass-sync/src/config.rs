//! Configuration for the sync engine
//!
//! Sync slot capacity and the durations of the four supervision timers.

use std::time::Duration;

use crate::error::{Result, SyncError};

/// Configuration for the broadcast sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Concurrent periodic advertising syncs the controller supports
    /// Default: 5
    pub max_sync_slots: usize,

    /// How long a sync kept only for a pending add may live once scanning stops
    /// Default: 5 minutes
    pub sync_timeout: Duration,

    /// Grace period before a lost source is reported while scanning
    /// Default: 10 seconds
    pub sync_lost_timeout: Duration,

    /// How long an unintentionally paused receiver may wait for the BIG to return
    /// Default: 1 minute
    pub big_monitor_timeout: Duration,

    /// How long a broadcast with paused receivers may stay out of range
    /// Default: 5 minutes
    pub broadcast_monitor_timeout: Duration,

    /// Failed sync attempts before a candidate is dropped until the next search
    /// Default: 3
    pub max_sync_failures: u32,

    /// Periodic advertising events the controller may skip once synced
    /// Default: 0
    pub sync_skip: u16,

    /// Supervision timeout passed to the controller when registering a sync
    /// Default: 2 seconds
    pub sync_register_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_sync_slots: 5,
            sync_timeout: Duration::from_secs(300),
            sync_lost_timeout: Duration::from_secs(10),
            big_monitor_timeout: Duration::from_secs(60),
            broadcast_monitor_timeout: Duration::from_secs(300),
            max_sync_failures: 3,
            sync_skip: 0,
            sync_register_timeout: Duration::from_secs(2),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for controllers with few periodic sync slots
    pub fn low_resource() -> Self {
        Self {
            max_sync_slots: 3,
            ..Default::default()
        }
    }

    /// Short supervision timers, handy for demos and tests against real hardware
    pub fn fast_timeouts() -> Self {
        Self {
            sync_timeout: Duration::from_secs(30),
            sync_lost_timeout: Duration::from_secs(2),
            big_monitor_timeout: Duration::from_secs(10),
            broadcast_monitor_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_sync_slots == 0 {
            return Err(SyncError::Configuration(
                "max sync slots must be greater than 0".to_string(),
            ));
        }

        if self.max_sync_failures == 0 {
            return Err(SyncError::Configuration(
                "max sync failures must be greater than 0".to_string(),
            ));
        }

        let timers = [
            ("sync timeout", self.sync_timeout),
            ("sync lost timeout", self.sync_lost_timeout),
            ("BIG monitor timeout", self.big_monitor_timeout),
            ("broadcast monitor timeout", self.broadcast_monitor_timeout),
            ("sync register timeout", self.sync_register_timeout),
        ];
        for (name, value) in timers {
            if value.is_zero() {
                return Err(SyncError::Configuration(format!("{name} must be greater than 0")));
            }
        }

        if self.big_monitor_timeout > self.broadcast_monitor_timeout {
            return Err(SyncError::Configuration(
                "BIG monitor timeout must not exceed the broadcast monitor timeout".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_max_sync_slots(mut self, slots: usize) -> Self {
        self.max_sync_slots = slots;
        self
    }

    pub fn with_max_sync_failures(mut self, failures: u32) -> Self {
        self.max_sync_failures = failures;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_sync_lost_timeout(mut self, timeout: Duration) -> Self {
        self.sync_lost_timeout = timeout;
        self
    }

    pub fn with_monitor_timeouts(mut self, big: Duration, broadcast: Duration) -> Self {
        self.big_monitor_timeout = big;
        self.broadcast_monitor_timeout = broadcast;
        self
    }
}
