//! # BASS Assistant Sync Engine
//!
//! The synchronization engine of a Broadcast Audio Scan Service assistant.
//! It discovers LE Audio broadcast sources, shares the controller's few
//! periodic advertising sync slots among them, decodes their BASE, and turns
//! add / modify / remove / switch source requests into per-receiver messages
//! for every member of a coordinated set.
//!
//! ## Architecture
//!
//! ```text
//!   scanner / GATT callbacks ──EventSender──┐
//!                                           ▼
//!   BroadcastAssistant ──Operation──▶  worker thread ──▶ BroadcastLifecycleController
//!          ▲                                                 │  SourceCache
//!          └──────────── Notification ◀──────────────────────┤  SyncResourceScheduler
//!                                                            │  TimeoutCoordinator
//!                                                            │  GroupSourceCoordinator
//!                                                            │  DesyncPolicyEngine
//!                                                            ▼
//!                                   ScanTransport / ReceiverStateMachines
//! ```
//!
//! All engine state is owned by one worker thread and every stimulus is an
//! [`Event`] handled to completion before the next, so the engine needs no
//! locks. Radio and GATT work is delegated to the collaborator traits in
//! [`transport`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bass_sync::{BroadcastAssistant, Collaborators, SyncConfig, SystemClock};
//!
//! let assistant = BroadcastAssistant::with_config(
//!     SyncConfig::default(),
//!     Collaborators {
//!         transport: Box::new(my_scanner),
//!         receivers: Box::new(my_bass_clients),
//!         groups: Box::new(my_csip_service),
//!         local_source: Box::new(my_broadcaster),
//!         clock: Box::new(SystemClock),
//!     },
//! )?;
//! assistant.start_searching(Vec::new())?;
//! ```

pub mod assistant;
pub mod clock;
pub mod config;
pub mod controller;
pub mod desync;
pub mod error;
pub mod event;
pub mod group;
pub mod iter;
pub mod logging;
pub mod model;
pub mod scheduler;
pub mod source_cache;
pub mod testing;
pub mod timeouts;
pub mod transport;
pub mod worker;

pub use assistant::{BroadcastAssistant, EventSender};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use controller::{BroadcastLifecycleController, Collaborators, PendingKind, PendingSourceOp};
pub use desync::{DesyncCause, DesyncDecision, DesyncPolicyEngine};
pub use error::{FailureReason, Result, SyncError};
pub use event::{Event, Notification, Operation, Query, QueryReply};
pub use group::{GroupOperationState, GroupSourceCoordinator};
pub use iter::NotificationIterator;
pub use logging::{init_logging, init_logging_from_env, LoggingMode};
pub use model::{
    AddressType, AdvertisingSid, BroadcastId, BroadcastMetadata, DeviceAddress, PaSync, PaSyncState,
    ReceiveState, SourceId, SyncHandle,
};
pub use scheduler::{BroadcastCandidate, SyncResourceScheduler};
pub use source_cache::SourceCache;
pub use timeouts::{TimeoutCoordinator, TimeoutKind};
pub use transport::{
    GroupMembership, LocalBroadcastSource, ReceiverMessage, ReceiverStateMachines, ScanFilter,
    ScanResult, ScanTransport, SyncStatus,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BroadcastAssistant, BroadcastId, BroadcastMetadata, Collaborators, DeviceAddress, Event,
        EventSender, Notification, NotificationIterator, Result, SourceId, SyncConfig, SyncError,
        SyncHandle,
    };
}
