//! Metadata describing a broadcast source

use bass_parser::{Base, BroadcastId, PublicBroadcastAnnouncement};
use serde::{Deserialize, Serialize};

use super::ids::{AddressType, AdvertisingSid, DeviceAddress};
use super::receive_state::{ReceiveState, BIS_SYNC_NO_PREFERENCE};

/// Everything a receiver needs to find and decode a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMetadata {
    pub source_device: DeviceAddress,
    pub address_type: AddressType,
    pub advertising_sid: AdvertisingSid,
    pub broadcast_id: BroadcastId,
    pub pa_interval: Option<u16>,
    pub broadcast_name: Option<String>,
    pub public_broadcast: Option<PublicBroadcastAnnouncement>,
    pub encrypted: bool,
    pub broadcast_code: Option<[u8; 16]>,
    pub base: Option<Base>,
}

impl BroadcastMetadata {
    pub fn new(
        source_device: DeviceAddress,
        address_type: AddressType,
        advertising_sid: AdvertisingSid,
        broadcast_id: BroadcastId,
    ) -> Self {
        Self {
            source_device,
            address_type,
            advertising_sid,
            broadcast_id,
            pa_interval: None,
            broadcast_name: None,
            public_broadcast: None,
            encrypted: false,
            broadcast_code: None,
            base: None,
        }
    }

    pub fn with_base(mut self, base: Base) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_broadcast_name(mut self, name: impl Into<String>) -> Self {
        self.broadcast_name = Some(name.into());
        self
    }

    pub fn with_broadcast_code(mut self, code: [u8; 16]) -> Self {
        self.encrypted = true;
        self.broadcast_code = Some(code);
        self
    }

    pub fn with_pa_interval(mut self, interval: u16) -> Self {
        self.pa_interval = Some(interval);
        self
    }

    pub fn is_public(&self) -> bool {
        self.public_broadcast.is_some()
    }

    /// BIS sync request per subgroup; no preference when the BASE is unknown
    pub fn bis_sync_requests(&self) -> Vec<u32> {
        match &self.base {
            Some(base) => base.bis_sync_masks(),
            None => vec![BIS_SYNC_NO_PREFERENCE],
        }
    }

    /// Fill fields the caller left empty from a fresher cached copy
    pub fn merge_missing(&mut self, cached: &BroadcastMetadata) {
        if self.base.is_none() {
            self.base = cached.base.clone();
        }
        if self.pa_interval.is_none() {
            self.pa_interval = cached.pa_interval;
        }
        if self.broadcast_name.is_none() {
            self.broadcast_name = cached.broadcast_name.clone();
        }
        if self.public_broadcast.is_none() {
            self.public_broadcast = cached.public_broadcast.clone();
        }
        self.encrypted |= cached.encrypted;
    }
}

/// Anything that may name a broadcast
pub trait HasBroadcastId {
    fn broadcast_id(&self) -> Option<BroadcastId>;
}

impl HasBroadcastId for BroadcastMetadata {
    fn broadcast_id(&self) -> Option<BroadcastId> {
        Some(self.broadcast_id)
    }
}

impl HasBroadcastId for ReceiveState {
    fn broadcast_id(&self) -> Option<BroadcastId> {
        self.broadcast_id
    }
}

impl HasBroadcastId for BroadcastId {
    fn broadcast_id(&self) -> Option<BroadcastId> {
        Some(*self)
    }
}
