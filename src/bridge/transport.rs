//! Transport seam between a session and a remote UI connection.
//!
//! The bridge never blocks on a transport: `send` must return immediately.
//! The WebSocket adapter satisfies this with an unbounded channel drained by
//! an async writer task.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::TransportClosed;

/// Frames sent from the bridge to the remote UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output { data: String },
    Error { message: String },
    Exit { code: Option<u32> },
}

/// Frames received from the remote UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// A duplex connection a session can forward output to.
pub trait Transport: Send + Sync {
    /// Deliver a frame without blocking. An error means the peer is gone.
    fn send(&self, message: ServerMessage) -> Result<(), TransportClosed>;

    /// Close the connection. Further sends fail.
    fn close(&self);
}

/// Transport backed by an unbounded tokio channel.
pub struct ChannelTransport {
    tx: Mutex<Option<UnboundedSender<ServerMessage>>>,
}

impl ChannelTransport {
    pub fn new(tx: UnboundedSender<ServerMessage>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }
}

impl Transport for ChannelTransport {
    fn send(&self, message: ServerMessage) -> Result<(), TransportClosed> {
        let guard = self.tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportClosed),
            None => Err(TransportClosed),
        }
    }

    fn close(&self) {
        // Dropping the sender ends the writer task's receive loop.
        self.tx.lock().unwrap().take();
    }
}
