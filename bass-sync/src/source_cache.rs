//! Discovery cache keyed by broadcast id and by sync handle
//!
//! Owned by the engine worker, so no interior locking. Update methods
//! report whether anything changed so the caller can decide what to emit.

use std::collections::HashMap;

use bass_parser::{Base, BroadcastId, PublicBroadcastAnnouncement};

use crate::model::{BroadcastMetadata, HasBroadcastId, SyncHandle};
use crate::transport::{LocalBroadcastSource, ScanResult};

/// What the engine knows about one broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredBroadcast {
    pub metadata: BroadcastMetadata,
    pub rssi: i8,
    notified: bool,
    evicted: bool,
}

impl DiscoveredBroadcast {
    /// Whether `SourceFound` was emitted in the current search
    pub fn is_notified(&self) -> bool {
        self.notified
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HandleBinding {
    broadcast_id: BroadcastId,
    base_seen: bool,
    big_info_seen: bool,
}

#[derive(Debug, Default)]
pub struct SourceCache {
    broadcasts: HashMap<BroadcastId, DiscoveredBroadcast>,
    handles: HashMap<SyncHandle, HandleBinding>,
}

impl SourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an extended advertising report, returning true for a new broadcast
    pub fn record_scan(
        &mut self,
        result: &ScanResult,
        broadcast_id: BroadcastId,
        public_broadcast: Option<PublicBroadcastAnnouncement>,
        broadcast_name: Option<String>,
    ) -> bool {
        let is_new = !self.broadcasts.contains_key(&broadcast_id);
        let entry = self.broadcasts.entry(broadcast_id).or_insert_with(|| DiscoveredBroadcast {
            metadata: BroadcastMetadata::new(
                result.device.clone(),
                result.address_type,
                result.advertising_sid,
                broadcast_id,
            ),
            rssi: result.rssi,
            notified: false,
            evicted: false,
        });

        let metadata = &mut entry.metadata;
        metadata.source_device = result.device.clone();
        metadata.address_type = result.address_type;
        metadata.advertising_sid = result.advertising_sid;
        if result.pa_interval.is_some() {
            metadata.pa_interval = result.pa_interval;
        }
        if let Some(pba) = public_broadcast {
            metadata.encrypted |= pba.is_encrypted();
            metadata.public_broadcast = Some(pba);
        }
        if broadcast_name.is_some() {
            metadata.broadcast_name = broadcast_name;
        }
        entry.rssi = result.rssi;

        is_new
    }

    /// Make caller-supplied metadata known, keeping anything discovered already
    pub fn remember(&mut self, metadata: &BroadcastMetadata) {
        match self.broadcasts.get_mut(&metadata.broadcast_id) {
            Some(entry) => {
                let mut merged = metadata.clone();
                merged.merge_missing(&entry.metadata);
                entry.metadata = merged;
            }
            None => {
                self.broadcasts.insert(
                    metadata.broadcast_id,
                    DiscoveredBroadcast {
                        metadata: metadata.clone(),
                        rssi: i8::MIN,
                        notified: false,
                        evicted: false,
                    },
                );
            }
        }
    }

    pub fn discovered(&self, broadcast_id: BroadcastId) -> Option<&DiscoveredBroadcast> {
        self.broadcasts.get(&broadcast_id)
    }

    pub fn metadata(&self, broadcast_id: BroadcastId) -> Option<BroadcastMetadata> {
        self.broadcasts.get(&broadcast_id).map(|d| d.metadata.clone())
    }

    pub fn bind_handle(&mut self, handle: SyncHandle, broadcast_id: BroadcastId, pa_interval: u16) {
        self.handles.insert(
            handle,
            HandleBinding { broadcast_id, base_seen: false, big_info_seen: false },
        );
        if let Some(entry) = self.broadcasts.get_mut(&broadcast_id) {
            entry.metadata.pa_interval = Some(pa_interval);
        }
    }

    pub fn unbind_handle(&mut self, handle: SyncHandle) -> Option<BroadcastId> {
        self.handles.remove(&handle).map(|b| b.broadcast_id)
    }

    pub fn broadcast_id_for_handle(&self, handle: SyncHandle) -> Option<BroadcastId> {
        self.handles.get(&handle).map(|b| b.broadcast_id)
    }

    /// Store a freshly decoded BASE; false if the handle is unknown
    pub fn put_base(&mut self, handle: SyncHandle, base: Base) -> bool {
        let Some(binding) = self.handles.get_mut(&handle) else {
            return false;
        };
        binding.base_seen = true;
        if let Some(entry) = self.broadcasts.get_mut(&binding.broadcast_id) {
            entry.metadata.base = Some(base);
        }
        true
    }

    pub fn base(&self, handle: SyncHandle) -> Option<&Base> {
        let binding = self.handles.get(&handle)?;
        self.broadcasts.get(&binding.broadcast_id)?.metadata.base.as_ref()
    }

    /// Record that the BIG is on air; false if the handle is unknown
    pub fn record_big_info(&mut self, handle: SyncHandle, encrypted: bool) -> bool {
        let Some(binding) = self.handles.get_mut(&handle) else {
            return false;
        };
        binding.big_info_seen = true;
        if let Some(entry) = self.broadcasts.get_mut(&binding.broadcast_id) {
            entry.metadata.encrypted = encrypted;
        }
        true
    }

    /// Metadata to announce once both a BASE and BIG info were seen on `handle`.
    ///
    /// Returns `Some` at most once per broadcast until the notified flags are cleared.
    pub fn take_found(&mut self, handle: SyncHandle) -> Option<BroadcastMetadata> {
        let binding = self.handles.get(&handle)?;
        if !(binding.base_seen && binding.big_info_seen) {
            return None;
        }
        let entry = self.broadcasts.get_mut(&binding.broadcast_id)?;
        if entry.notified {
            return None;
        }
        entry.notified = true;
        Some(entry.metadata.clone())
    }

    pub fn is_notified(&self, broadcast_id: BroadcastId) -> bool {
        self.broadcasts.get(&broadcast_id).is_some_and(|d| d.notified)
    }

    /// Start a new search epoch
    pub fn clear_notified_flags(&mut self) {
        for entry in self.broadcasts.values_mut() {
            entry.notified = false;
            entry.evicted = false;
        }
    }

    /// Remember that an announced broadcast lost its slot to a better candidate
    pub fn mark_evicted(&mut self, broadcast_id: BroadcastId) {
        if let Some(entry) = self.broadcasts.get_mut(&broadcast_id) {
            entry.evicted = entry.notified;
        }
    }

    pub fn is_evicted(&self, broadcast_id: BroadcastId) -> bool {
        self.broadcasts.get(&broadcast_id).is_some_and(|d| d.evicted)
    }

    /// Forget a broadcast and any handle still bound to it
    pub fn remove(&mut self, broadcast_id: BroadcastId) -> Option<DiscoveredBroadcast> {
        self.handles.retain(|_, b| b.broadcast_id != broadcast_id);
        self.broadcasts.remove(&broadcast_id)
    }

    /// Keep only the broadcasts `keep` accepts, returning how many were dropped
    pub fn retain(&mut self, mut keep: impl FnMut(BroadcastId) -> bool) -> usize {
        let before = self.broadcasts.len();
        self.broadcasts.retain(|id, _| keep(*id));
        let broadcasts = &self.broadcasts;
        self.handles.retain(|_, b| broadcasts.contains_key(&b.broadcast_id));
        before - self.broadcasts.len()
    }

    pub fn is_local_broadcast<T>(&self, item: &T, local: &dyn LocalBroadcastSource) -> bool
    where
        T: HasBroadcastId + ?Sized,
    {
        item.broadcast_id()
            .is_some_and(|id| local.active_broadcast_ids().contains(&id))
    }

    pub fn len(&self) -> usize {
        self.broadcasts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty()
    }
}
