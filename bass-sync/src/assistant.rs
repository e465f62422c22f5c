//! Sync-first facade over the engine worker
//!
//! Provides a fully synchronous API for driving the sync engine. The engine
//! itself runs on a background worker thread.

use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use bass_parser::{Base, BroadcastId};
use parking_lot::Mutex;
use tokio::sync::{mpsc as command_mpsc, oneshot};

use crate::config::SyncConfig;
use crate::controller::{BroadcastLifecycleController, Collaborators};
use crate::error::{Result, SyncError};
use crate::event::{Event, Notification, Operation, Query, QueryReply};
use crate::iter::NotificationIterator;
use crate::model::{BroadcastMetadata, DeviceAddress, SourceId, SyncHandle};
use crate::transport::ScanFilter;
use crate::worker::{spawn_engine_worker, Command};

/// Cloneable handle for feeding scanner, sync and receiver events to the engine
///
/// Transport callbacks hold one of these and forward every callback as an
/// [`Event`]. Sending never blocks.
#[derive(Debug, Clone)]
pub struct EventSender {
    command_tx: command_mpsc::UnboundedSender<Command>,
}

impl EventSender {
    pub fn send(&self, event: Event) -> Result<()> {
        self.command_tx
            .send(Command::Event(event))
            .map_err(|_| SyncError::WorkerDisconnected)
    }
}

/// Broadcast Audio Scan Service assistant
///
/// All methods are synchronous. Operations are queued to the engine and
/// their outcome is reported through [`notifications`](Self::notifications).
/// Query methods block until the engine answers, so they must not be called
/// from inside an async runtime.
///
/// # Example
///
/// ```rust,ignore
/// use bass_sync::{BroadcastAssistant, Collaborators, Notification};
///
/// let assistant = BroadcastAssistant::new(collaborators)?;
/// let events = assistant.event_sender();
/// // hand `events` to the scanner and GATT callbacks
///
/// assistant.start_searching(Vec::new())?;
/// for notification in assistant.notifications() {
///     if let Notification::SourceFound(metadata) = notification {
///         assistant.add_source(&receiver, metadata, true)?;
///     }
/// }
/// ```
pub struct BroadcastAssistant {
    command_tx: command_mpsc::UnboundedSender<Command>,
    notification_rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BroadcastAssistant {
    /// Create an assistant with the default configuration
    pub fn new(collaborators: Collaborators) -> Result<Self> {
        Self::with_config(SyncConfig::default(), collaborators)
    }

    pub fn with_config(config: SyncConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (command_tx, command_rx) = command_mpsc::unbounded_channel();
        let (notification_tx, notification_rx) = mpsc::channel();

        let controller = BroadcastLifecycleController::new(config, collaborators, notification_tx);
        let worker = spawn_engine_worker(controller, command_rx).map_err(|e| {
            tracing::error!("Failed to spawn engine worker: {}", e);
            SyncError::WorkerDisconnected
        })?;

        Ok(Self {
            command_tx,
            notification_rx: Arc::new(Mutex::new(notification_rx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender { command_tx: self.command_tx.clone() }
    }

    /// Blocking iterator over notifications. Clones share one queue.
    pub fn notifications(&self) -> NotificationIterator {
        NotificationIterator::new(Arc::clone(&self.notification_rx))
    }

    fn submit(&self, op: Operation) -> Result<()> {
        self.command_tx
            .send(Command::Event(Event::Operation(op)))
            .map_err(|_| SyncError::WorkerDisconnected)
    }

    pub fn start_searching(&self, filters: Vec<ScanFilter>) -> Result<()> {
        self.submit(Operation::StartSearching { filters })
    }

    pub fn stop_searching(&self) -> Result<()> {
        self.submit(Operation::StopSearching)
    }

    /// Add a broadcast to `device`, and to its coordinated set when `is_group_op`
    pub fn add_source(
        &self,
        device: &DeviceAddress,
        metadata: BroadcastMetadata,
        is_group_op: bool,
    ) -> Result<()> {
        self.submit(Operation::AddSource {
            device: device.clone(),
            metadata,
            is_group_op,
        })
    }

    pub fn modify_source(
        &self,
        device: &DeviceAddress,
        source_id: SourceId,
        metadata: BroadcastMetadata,
    ) -> Result<()> {
        self.submit(Operation::ModifySource {
            device: device.clone(),
            source_id,
            metadata,
        })
    }

    pub fn remove_source(&self, device: &DeviceAddress, source_id: SourceId) -> Result<()> {
        self.submit(Operation::RemoveSource { device: device.clone(), source_id })
    }

    pub fn switch_source(
        &self,
        device: &DeviceAddress,
        old_source_id: SourceId,
        metadata: BroadcastMetadata,
    ) -> Result<()> {
        self.submit(Operation::SwitchSource {
            device: device.clone(),
            old_source_id,
            metadata,
        })
    }

    pub fn suspend_receivers(&self, broadcast_id: BroadcastId) -> Result<()> {
        self.submit(Operation::SuspendReceivers { broadcast_id })
    }

    pub fn suspend_all_receivers(&self) -> Result<()> {
        self.submit(Operation::SuspendAllReceivers)
    }

    pub fn resume_receivers(&self) -> Result<()> {
        self.submit(Operation::ResumeReceivers)
    }

    pub fn stop_receivers(&self, broadcast_id: BroadcastId) -> Result<()> {
        self.submit(Operation::StopReceivers { broadcast_id })
    }

    /// Ask the engine and wait for the answer
    pub fn query(&self, query: Query) -> Result<QueryReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Query(query, reply_tx))
            .map_err(|_| SyncError::WorkerDisconnected)?;
        reply_rx.blocking_recv().map_err(|_| SyncError::WorkerDisconnected)
    }

    pub fn active_synced_sources(&self) -> Result<Vec<SyncHandle>> {
        match self.query(Query::ActiveSyncedSources)? {
            QueryReply::SyncHandles(handles) => Ok(handles),
            other => Err(unexpected(other)),
        }
    }

    pub fn device_for_sync_handle(&self, handle: SyncHandle) -> Result<Option<DeviceAddress>> {
        match self.query(Query::DeviceForSyncHandle(handle))? {
            QueryReply::Device(device) => Ok(device),
            other => Err(unexpected(other)),
        }
    }

    pub fn broadcast_id_for_sync_handle(&self, handle: SyncHandle) -> Result<Option<BroadcastId>> {
        match self.query(Query::BroadcastIdForSyncHandle(handle))? {
            QueryReply::BroadcastId(id) => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    pub fn base(&self, handle: SyncHandle) -> Result<Option<Base>> {
        match self.query(Query::Base(handle))? {
            QueryReply::Base(base) => Ok(base),
            other => Err(unexpected(other)),
        }
    }

    pub fn is_searching(&self) -> Result<bool> {
        match self.query(Query::IsSearching)? {
            QueryReply::Searching(searching) => Ok(searching),
            other => Err(unexpected(other)),
        }
    }

    /// Stop the engine and wait for the worker to exit
    ///
    /// Called automatically on drop.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                tracing::error!("Engine worker panicked");
            }
        }
    }
}

fn unexpected(reply: QueryReply) -> SyncError {
    tracing::error!("Mismatched query reply: {:?}", reply);
    SyncError::WorkerDisconnected
}

impl Drop for BroadcastAssistant {
    fn drop(&mut self) {
        tracing::debug!("BroadcastAssistant dropping, stopping engine worker");
        self.shutdown();
    }
}
