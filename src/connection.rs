//! Per-connection outbound handles.
//!
//! Each WebSocket gets one bounded outbound channel; a writer task drains it
//! into the socket. Senders never block: a closed or backed-up channel is
//! reported as a failure so the owner can evict or prune the connection.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::{now_ms, Envelope};

/// Outbound queue depth per connection. A peer that falls this far behind is
/// treated the same as a closed transport.
pub const OUTBOUND_CAPACITY: usize = 256;

/// A frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Box<Envelope>),
    Close { code: u16, reason: String },
}

/// Cheap, cloneable handle to one live transport endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    opened_at: i64,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        (
            Self {
                id: Uuid::new_v4(),
                opened_at: now_ms(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn opened_at(&self) -> i64 {
        self.opened_at
    }

    /// Queue an envelope for delivery. Fails if the transport is gone or the
    /// peer has stopped draining its queue.
    pub fn send(&self, envelope: Envelope) -> crate::error::Result<()> {
        self.tx
            .try_send(Outbound::Frame(Box::new(envelope)))
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Ask the writer task to close the socket with the given code. Best
    /// effort; a connection that is already gone needs no close frame.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionHandle, Outbound};
    use crate::protocol::{Envelope, MessageKind};

    #[tokio::test]
    async fn send_delivers_frame_to_writer() {
        let (conn, mut rx) = ConnectionHandle::new();
        conn.send(Envelope::server(MessageKind::Ping)).unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Frame(env) => assert_eq!(env.kind, MessageKind::Ping),
            other => panic!("unexpected outbound: {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_fails_once_writer_is_gone() {
        let (conn, rx) = ConnectionHandle::new();
        drop(rx);
        assert!(conn.is_closed());
        assert!(conn.send(Envelope::server(MessageKind::Ping)).is_err());
    }

    #[tokio::test]
    async fn close_queues_close_frame() {
        let (conn, mut rx) = ConnectionHandle::new();
        conn.close(4001, "Heartbeat timeout");
        match rx.recv().await.unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 4001);
                assert_eq!(reason, "Heartbeat timeout");
            }
            other => panic!("unexpected outbound: {:?}", other),
        }
    }
}
