//! Background worker thread running the engine
//!
//! The controller lives on a dedicated thread with a single-threaded tokio
//! runtime. Events, queries and timer deadlines are multiplexed in one
//! `select!` loop, so handlers never run concurrently.

use std::thread::{self, JoinHandle};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::controller::BroadcastLifecycleController;
use crate::event::{Event, Query, QueryReply};

/// Commands sent from the facade and the event senders to the worker
#[derive(Debug)]
pub enum Command {
    Event(Event),
    /// Answer a query from current engine state
    Query(Query, oneshot::Sender<QueryReply>),
    Shutdown,
}

/// Spawns the engine worker thread
///
/// The worker owns the controller until it receives [`Command::Shutdown`] or
/// every command sender is dropped.
pub fn spawn_engine_worker(
    controller: BroadcastLifecycleController,
    command_rx: mpsc::UnboundedReceiver<Command>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bass-sync-engine".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_time().build() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to create tokio runtime for engine worker: {}", e);
                    return;
                }
            };

            rt.block_on(run_engine_loop(controller, command_rx));
        })
}

/// Sleep until the engine's next timer, or forever when none is armed
async fn next_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn run_engine_loop(
    mut controller: BroadcastLifecycleController,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
) {
    tracing::info!("Engine worker started");

    loop {
        let deadline = controller.next_deadline();

        tokio::select! {
            command = command_rx.recv() => {
                match command {
                    Some(Command::Event(event)) => controller.handle(event),
                    Some(Command::Query(query, reply)) => {
                        if reply.send(controller.query(query)).is_err() {
                            tracing::debug!("Query caller went away before the reply");
                        }
                    }
                    Some(Command::Shutdown) => {
                        tracing::info!("Worker received shutdown command");
                        break;
                    }
                    None => {
                        tracing::debug!("All command senders dropped, shutting down worker");
                        break;
                    }
                }
            }

            _ = next_timer(deadline) => {
                controller.fire_due_timers();
            }
        }
    }

    controller.shutdown();
    tracing::info!("Engine worker stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use super::*;
    use crate::clock::SystemClock;
    use crate::config::SyncConfig;
    use crate::controller::Collaborators;
    use crate::event::Operation;
    use crate::testing::{FakeGroups, FakeLocalSource, FakeReceivers, FakeTransport, TransportCall};

    fn controller(
        transport: &FakeTransport,
    ) -> (BroadcastLifecycleController, std_mpsc::Receiver<crate::Notification>) {
        let (tx, rx) = std_mpsc::channel();
        let collaborators = Collaborators {
            transport: Box::new(transport.clone()),
            receivers: Box::new(FakeReceivers::new()),
            groups: Box::new(FakeGroups::new()),
            local_source: Box::new(FakeLocalSource::new()),
            clock: Box::new(SystemClock),
        };
        (BroadcastLifecycleController::new(SyncConfig::default(), collaborators, tx), rx)
    }

    #[test]
    fn test_worker_answers_queries_and_stops() {
        let transport = FakeTransport::new();
        let (controller, notifications) = controller(&transport);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = spawn_engine_worker(controller, command_rx).unwrap();

        command_tx
            .send(Command::Event(Operation::StartSearching { filters: Vec::new() }.into()))
            .unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        command_tx.send(Command::Query(Query::IsSearching, reply_tx)).unwrap();
        assert_eq!(reply_rx.blocking_recv().unwrap(), QueryReply::Searching(true));

        command_tx.send(Command::Shutdown).unwrap();
        worker.join().unwrap();

        let next = || notifications.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(next(), crate::Notification::SearchStarted);
        assert_eq!(next(), crate::Notification::SearchStopped);
        assert_eq!(transport.calls().last(), Some(&TransportCall::StopScan));
    }

    #[test]
    fn test_worker_exits_when_senders_drop() {
        let transport = FakeTransport::new();
        let (controller, _notifications) = controller(&transport);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = spawn_engine_worker(controller, command_rx).unwrap();

        drop(command_tx);
        worker.join().unwrap();
    }
}
