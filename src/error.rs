// src/error.rs
//
// Typed errors shared by transport, routing, ledger and the 2PC driver.
// Recoverable protocol-level failures get their own variant so callers can
// branch on kind; anything originating at a process boundary (config, IO)
// is surfaced through `anyhow` instead.

use crate::id::NodeId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("request to {peer} for '{procedure}' timed out")]
    Timeout { peer: NodeId, procedure: String },

    #[error("key not found: {0}")]
    KeyError(NodeId),

    #[error("invalid value: {0}")]
    ValueError(String),

    #[error("crypto error: {0}")]
    CryptoError(String),

    #[error("unknown procedure '{0}'")]
    ProtocolError(String),

    #[error("malformed datagram from {peer}: {reason}")]
    MalformedDatagram { peer: String, reason: String },

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("internal error: {0}")]
    Internal(String),
}
