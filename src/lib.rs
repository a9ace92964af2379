//! PTY session bridge with a supervision engine for interactive coding agents.
//!
//! The [`bridge`] runs shells in pseudo-terminals and relays them to remote
//! UIs. The supervision engine watches that traffic: the [`workflow`] tracker
//! follows multi-step workflows, the [`context`] cache keeps a snapshot of the
//! project, and the [`intervention`] manager answers a confused or stuck agent.
//! Components talk through the [`events`] bus.

pub mod bridge;
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod intervention;
pub mod log;
pub mod prompt;
pub mod server;
pub mod supervisor;
pub mod workflow;
