//! Sync iterator for consuming notifications from BroadcastAssistant
//!
//! Provides a blocking iterator interface for processing notifications
//! without requiring async/await.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use parking_lot::Mutex;

use crate::event::Notification;

/// Blocking iterator over engine notifications
///
/// This iterator blocks on `next()` until a notification is available or the
/// engine has shut down. Use `try_recv()` for non-blocking access.
pub struct NotificationIterator {
    rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
}

impl NotificationIterator {
    pub(crate) fn new(rx: Arc<Mutex<mpsc::Receiver<Notification>>>) -> Self {
        Self { rx }
    }

    /// Block until a notification is available
    ///
    /// Returns `None` once the engine has shut down and every queued
    /// notification was consumed.
    pub fn recv(&self) -> Option<Notification> {
        self.rx.lock().recv().ok()
    }

    /// Returns `None` if nothing is queued right now or the engine is gone.
    pub fn try_recv(&self) -> Option<Notification> {
        self.rx.lock().try_recv().ok()
    }

    /// Block until a notification is available or `timeout` expires
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Notification> {
        self.rx.lock().recv_timeout(timeout).ok()
    }

    /// Non-blocking iterator over currently queued notifications
    pub fn try_iter(&self) -> TryIterator<'_> {
        TryIterator { inner: self }
    }

    /// Blocking iterator waiting up to `timeout` on each `next()`
    pub fn timeout_iter(&self, timeout: Duration) -> TimeoutIterator<'_> {
        TimeoutIterator { inner: self, timeout }
    }
}

impl Iterator for NotificationIterator {
    type Item = Notification;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

impl Clone for NotificationIterator {
    fn clone(&self) -> Self {
        Self { rx: Arc::clone(&self.rx) }
    }
}

pub struct TryIterator<'a> {
    inner: &'a NotificationIterator,
}

impl Iterator for TryIterator<'_> {
    type Item = Notification;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.try_recv()
    }
}

pub struct TimeoutIterator<'a> {
    inner: &'a NotificationIterator,
    timeout: Duration,
}

impl Iterator for TimeoutIterator<'_> {
    type Item = Notification;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.recv_timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bass_parser::BroadcastId;

    fn iterator() -> (mpsc::Sender<Notification>, NotificationIterator) {
        let (tx, rx) = mpsc::channel();
        (tx, NotificationIterator::new(Arc::new(Mutex::new(rx))))
    }

    #[test]
    fn test_try_recv_empty() {
        let (_tx, iter) = iterator();
        assert!(iter.try_recv().is_none());
    }

    #[test]
    fn test_try_iter_drains_queue() {
        let (tx, iter) = iterator();
        tx.send(Notification::SearchStarted).unwrap();
        tx.send(Notification::SourceLost { broadcast_id: BroadcastId::new(7).unwrap() }).unwrap();

        let drained: Vec<_> = iter.try_iter().collect();
        assert_eq!(drained.len(), 2);
        assert!(iter.try_recv().is_none());
    }

    #[test]
    fn test_recv_timeout() {
        let (_tx, iter) = iterator();
        assert!(iter.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_clones_share_the_channel() {
        let (tx, iter) = iterator();
        let other = iter.clone();
        tx.send(Notification::SearchStopped).unwrap();
        assert_eq!(other.try_recv(), Some(Notification::SearchStopped));
        assert!(iter.try_recv().is_none());
    }

    #[test]
    fn test_closed_channel_ends_iteration() {
        let (tx, mut iter) = iterator();
        drop(tx);
        assert!(iter.next().is_none());
    }
}
