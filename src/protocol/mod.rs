//! Protocol module - Defines the wire protocol for Harmony sessions
//!
//! Every message travels as a length-prefixed frame, all integers big-endian:
//! - 4 bytes total length of what follows
//! - 4 bytes message kind
//! - 4 bytes protocol version
//! - Variant-specific payload (registration, description or update)

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 2;

/// Default port for the Harmony server
pub const DEFAULT_PORT: u16 = 1977;

/// Upper bound (exclusive) on the byte length of names and string values
pub const MAX_STRING_LEN: usize = 2048;
