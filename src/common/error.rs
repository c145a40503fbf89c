//! # Error Taxonomy
//!
//! Typed errors for the transport and protocol layers. The distinction
//! matters for recovery: a transport error kills the connection, a protocol
//! error closes it server-side, while validation failures (handled in the
//! session engine) keep the connection alive.

use std::time::Duration;
use thiserror::Error;

/// Failure while moving bytes over an established connection.
///
/// Every variant carries how many bytes made it before the failure, so
/// callers can report partial progress ("timed out after 5000/10000 bytes").
#[derive(Debug, Error)]
pub enum TransportError {
    /// No progress within the configured window. `done == 0` on the first
    /// read of a request is how the server recognises a benign idle peer.
    #[error("timed out after {timeout:?} with {done}/{expected} bytes transferred")]
    Timeout {
        done: usize,
        expected: usize,
        timeout: Duration,
    },

    /// The peer closed the stream before the full frame arrived.
    #[error("connection closed by peer after {done}/{expected} bytes")]
    Closed { done: usize, expected: usize },

    /// Any other socket-level failure (reset, broken pipe, ...).
    #[error("i/o error after {done} bytes: {source}")]
    Io {
        done: usize,
        #[source]
        source: std::io::Error,
    },
}

impl TransportError {
    /// Bytes successfully transferred before the failure.
    pub fn bytes_done(&self) -> usize {
        match self {
            TransportError::Timeout { done, .. }
            | TransportError::Closed { done, .. }
            | TransportError::Io { done, .. } => *done,
        }
    }
}

/// The peer sent something that violates the wire protocol. These are
/// rejected immediately, without attempting to consume the implied payload.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("declared length {declared} bytes exceeds the {limit}-byte ceiling")]
    Oversized { declared: usize, limit: usize },

    #[error("unexpected token on the wire: {0:02x?}")]
    UnexpectedToken(Vec<u8>),

    #[error("frame payload is not valid UTF-8")]
    BadUtf8,
}
