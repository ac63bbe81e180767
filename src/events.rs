//! Collaborator-facing event streams.
//!
//! Each stream has at most one subscriber: the receiver is handed out once.
//! Until someone takes it, events are dropped rather than buffered, and a
//! slow subscriber loses events instead of stalling the synchronizer.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::network::message::ScripthashNotification;

pub const DEFAULT_EVENT_BUFFER: usize = 64;

struct Stream<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<Option<mpsc::Receiver<T>>>,
    name: &'static str,
}

impl<T> Stream<T> {
    fn new(capacity: usize, name: &'static str) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            name,
        }
    }

    fn take(&self) -> Option<mpsc::Receiver<T>> {
        self.rx.lock().take()
    }

    fn emit(&self, item: T) {
        if self.rx.lock().is_some() {
            // Nobody subscribed yet
            return;
        }
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("⚠️ {} subscriber is lagging, event dropped", self.name);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("{} subscriber went away", self.name);
            }
        }
    }
}

/// Tip-changed and scripthash-status streams shared by the node and its
/// synchronizers. Outlives individual connections.
pub struct ChainEvents {
    tips: Stream<u64>,
    scripthashes: Stream<ScripthashNotification>,
}

impl ChainEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            tips: Stream::new(capacity, "tip-changed"),
            scripthashes: Stream::new(capacity, "scripthash-status"),
        }
    }

    pub fn emit_tip(&self, height: u64) {
        self.tips.emit(height);
    }

    pub fn emit_scripthash(&self, status: ScripthashNotification) {
        self.scripthashes.emit(status);
    }

    /// `None` once the stream has been taken.
    pub fn take_tip_stream(&self) -> Option<mpsc::Receiver<u64>> {
        self.tips.take()
    }

    pub fn take_scripthash_stream(&self) -> Option<mpsc::Receiver<ScripthashNotification>> {
        self.scripthashes.take()
    }
}

impl Default for ChainEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_dropped_until_subscribed() {
        let events = ChainEvents::new(4);
        events.emit_tip(1);

        let mut tips = events.take_tip_stream().unwrap();
        assert!(events.take_tip_stream().is_none());

        events.emit_tip(2);
        events.emit_tip(3);
        assert_eq!(tips.recv().await, Some(2));
        assert_eq!(tips.recv().await, Some(3));
        assert!(tips.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_stream_drops_newest() {
        let events = ChainEvents::new(2);
        let mut tips = events.take_tip_stream().unwrap();
        for h in 0..5 {
            events.emit_tip(h);
        }
        assert_eq!(tips.recv().await, Some(0));
        assert_eq!(tips.recv().await, Some(1));
        assert!(tips.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scripthash_stream() {
        let events = ChainEvents::default();
        let mut statuses = events.take_scripthash_stream().unwrap();
        events.emit_scripthash(ScripthashNotification {
            scripthash: "aa".into(),
            status: None,
        });
        let got = statuses.recv().await.unwrap();
        assert_eq!(got.scripthash, "aa");
        assert!(got.status.is_none());
    }
}
