use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed mavlink frame: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LinkError {
    /// Transport could not be opened, or failed before the handshake finished.
    #[error("mavlink connect {address} failed: {reason}")]
    Connect { address: String, reason: String },

    /// Transport is up but no HEARTBEAT arrived in time.
    #[error("no heartbeat from {address} within {waited:?}")]
    Timeout { address: String, waited: Duration },

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// I/O error after the handshake. The link reconnects if enabled.
    #[error("mavlink transport error: {0}")]
    Transport(String),

    /// Transport gone for good; only happens with autoreconnect disabled.
    #[error("mavlink link {address} closed")]
    Closed { address: String },

    #[error("cancelled")]
    Cancelled,
}
