//! Relay between headless coding-agent processes and the UI surfaces that
//! observe and drive them.
//!
//! The server side ([`router`]) accepts WebSocket connections from both
//! populations, tracks agent liveness ([`registry`]), fans agent traffic out
//! to UI observers, and rewrites delegated sub-task events
//! ([`relationships`]) so observers see one coherent stream. The agent side
//! ([`session`]) maintains the connection to the relay and bridges relayed
//! commands onto the local engine ([`bridge`], [`engine`]).

pub mod bridge;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relationships;
pub mod router;
pub mod session;

pub use error::{RelayError, Result};
