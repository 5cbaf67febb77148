//! Protocol-level building blocks shared between the authoritative server and
//! its clients: the patch model, the wire envelope, the transport channel
//! capability and the client-side state mirror.

pub mod channel;
pub mod message;
pub mod mirror;
pub mod patch;

/// Milliseconds without an acknowledgment before a client's delta history is
/// abandoned and full states are sent instead.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1000;

/// Display names longer than this are rejected at join.
pub const DEFAULT_MAX_NAME_LENGTH: usize = 50;
