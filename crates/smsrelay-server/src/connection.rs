//! Per-subscriber connection handle.
//!
//! The socket itself is driven by the per-connection tasks in `hub`; the
//! rest of the system talks to a subscriber through this handle, which is a
//! bounded outbound queue plus an observed open/closed state. Sends never
//! block: a subscriber that cannot keep up is reported as a failed send and
//! pruned by the caller.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

/// Handle to one subscriber, keyed by its remote `ip:port`.
#[derive(Debug)]
pub struct RelayConnection {
    key: String,
    outbound: mpsc::Sender<String>,
    closed: AtomicBool,
}

impl RelayConnection {
    /// Create a handle around the outbound half of a subscriber's queue.
    pub fn new(key: impl Into<String>, outbound: mpsc::Sender<String>) -> Self {
        Self {
            key: key.into(),
            outbound,
            closed: AtomicBool::new(false),
        }
    }

    /// Registry key: `"{remote_ip}:{remote_port}"`.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the connection is observed open right now. Queried live
    /// before each send rather than cached by callers.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    /// Queue one text frame without blocking.
    ///
    /// Returns `false` when the subscriber is gone or its queue is full;
    /// either way the caller should treat the connection as dead.
    pub fn send(&self, message: String) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = %self.key, "subscriber queue full, dropping connection");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.mark_closed();
                false
            }
        }
    }

    /// Record that the underlying socket is gone.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(capacity: usize) -> (RelayConnection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (RelayConnection::new("10.0.0.9:52211", tx), rx)
    }

    #[tokio::test]
    async fn send_delivers_to_queue() {
        let (conn, mut rx) = connection(4);
        assert!(conn.send("hello".to_string()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn send_to_full_queue_fails() {
        let (conn, _rx) = connection(1);
        assert!(conn.send("one".to_string()));
        assert!(!conn.send("two".to_string()));
    }

    #[test]
    fn send_after_receiver_dropped_fails_and_closes() {
        let (conn, rx) = connection(1);
        drop(rx);
        assert!(!conn.send("lost".to_string()));
        assert!(!conn.is_open());
    }

    #[test]
    fn open_until_marked_closed() {
        let (conn, _rx) = connection(1);
        assert!(conn.is_open());
        conn.mark_closed();
        assert!(!conn.is_open());
    }

    #[test]
    fn dropped_receiver_is_observed_as_not_open() {
        let (conn, rx) = connection(1);
        drop(rx);
        assert!(!conn.is_open());
    }

    #[test]
    fn key_is_peer_address() {
        let (conn, _rx) = connection(1);
        assert_eq!(conn.key(), "10.0.0.9:52211");
    }
}
