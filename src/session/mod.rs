//! Session module - Server-side session state and request handling
//!
//! Provides:
//! - The registry of clients, connections and tuning variables
//! - The request handler that turns one request into one response
//! - The search strategy seam consulted when values can change

mod handler;
mod registry;
mod strategy;

pub use handler::*;
pub use registry::*;
pub use strategy::*;

use thiserror::Error;

use crate::protocol::{CodecError, MessageKind};

/// Errors raised while handling a single request
///
/// None of these end the server; each becomes a FAIL reply to the requester.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] CodecError),

    #[error("Invalid variable declaration: {0:?}")]
    InvalidDeclaration(String),

    #[error("Performance update carries no integer value")]
    MissingPerformance,

    #[error("Unsupported request: {0}")]
    Unsupported(MessageKind),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle notifications published to whoever runs the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Registered {
        client: ClientId,
        signal_mode: bool,
    },
    Migrated {
        client: ClientId,
        from: ConnId,
        to: ConnId,
    },
    VariableRegistered {
        client: ClientId,
        name: String,
    },
    PerformanceReported {
        client: ClientId,
        performance: i32,
        stale: bool,
    },
    /// The client is gone; schedulers should release anything tied to it
    Revoked {
        client: ClientId,
        app_name: Option<String>,
    },
}
