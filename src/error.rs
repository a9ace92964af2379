//! Error types surfaced by the bridge, tracker and intervention manager.
//!
//! Application-edge code (config loading, `main`, the HTTP adapter) uses
//! `anyhow`; these enums are what library callers match on.

use thiserror::Error;

use crate::bridge::SessionId;
use crate::workflow::WorkflowId;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("failed to create session: {0}")]
    SessionCreate(String),
    #[error("session limit reached ({0} active)")]
    SessionLimit(usize),
    #[error("PTY error: {0}")]
    Pty(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),
}

#[derive(Debug, Error)]
pub enum InterventionError {
    #[error("approval not found: {0}")]
    ApprovalNotFound(String),
}

/// Failure reported by a transport when a frame cannot be delivered.
#[derive(Debug, Error)]
#[error("transport disconnected")]
pub struct TransportClosed;
