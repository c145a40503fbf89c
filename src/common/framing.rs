//! # TCP Framing Primitives
//!
//! Byte-level transport for the PestDetect protocol. Unlike a codec that
//! owns a whole message grammar, this layer only guarantees exact-length
//! reads and writes; the session engines interpret the bytes.
//!
//! ## Wire Protocol
//!
//! All multi-byte integers are big-endian unsigned 32-bit. The frames in
//! play:
//!
//! ```text
//! auth request     "AUTH" + len (4B) + hex-SHA256(password)
//! auth success     "AUTH_OK\0"                (8B literal)
//! auth failure     "AUTH_ERR"                 (8B literal, legacy "AUTH_NO\0")
//! upload request   filenameLen (4B) + payloadLen (4B) + filename + image bytes
//! response         totalLen (4B) + nonce (8B) + ciphertext
//! telemetry        "TIMING" + jsonLen (4B) + UTF-8 JSON
//! telemetry ack    "ACK"
//! disconnect       "DISCONNECT"               (best-effort, unacknowledged)
//! liveness         "PING" -> "PONG"
//! ```

use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::error::TransportError;

/// Hard ceiling for an uploaded image payload.
pub const MAX_IMAGE_BYTES: usize = 100 * 1024 * 1024;
/// Hard ceiling for an encrypted response frame.
pub const MAX_RESPONSE_BYTES: usize = 50 * 1024 * 1024;
/// Hard ceiling for the telemetry JSON body.
pub const MAX_TELEMETRY_BYTES: usize = 10 * 1024;
/// Hard ceiling for a filename on the wire.
pub const MAX_FILENAME_BYTES: usize = 1024;

/// Chunk size for large transfers; bounds per-call memory and gives the
/// progress reporting something to hook into.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Transfers above this size get debug-level progress reporting.
const PROGRESS_THRESHOLD: usize = 100 * 1024;

pub const TAG_AUTH: &[u8; 4] = b"AUTH";
pub const AUTH_OK: &[u8; 8] = b"AUTH_OK\0";
pub const AUTH_ERR: &[u8; 8] = b"AUTH_ERR";
/// Legacy failure token emitted by older servers; clients accept it as a
/// rejection, new servers never send it.
pub const AUTH_NO: &[u8; 8] = b"AUTH_NO\0";
pub const TAG_TIMING: &[u8; 6] = b"TIMING";
pub const ACK: &[u8; 3] = b"ACK";
pub const DISCONNECT: &[u8; 10] = b"DISCONNECT";
pub const PING: &[u8; 4] = b"PING";
pub const PONG: &[u8; 4] = b"PONG";

/// TCP stream wrapper with exact-length, timeout-bounded reads and writes.
///
/// Holds a small pushback buffer so a speculative read (the telemetry tag)
/// can be un-consumed when it turns out to belong to the next request.
pub struct Connection {
    stream: TcpStream,
    peer: String,
    pushback: Vec<u8>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            stream,
            peer,
            pushback: Vec::new(),
        }
    }

    /// Peer address as a displayable string.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Return bytes to the front of the read queue. The next `recv_exact`
    /// consumes them before touching the socket.
    pub fn push_back(&mut self, bytes: &[u8]) {
        self.pushback.splice(0..0, bytes.iter().copied());
    }

    /// Write all bytes, chunked, each chunk bounded by `timeout`.
    ///
    /// Progress-only pauses shorter than the timeout never fail the
    /// transfer; a single stalled chunk does. The error reports how many
    /// bytes were sent before the failure.
    pub async fn send_all(
        &mut self,
        bytes: &[u8],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let total = bytes.len();
        let mut sent = 0;
        while sent < total {
            let end = (sent + CHUNK_SIZE).min(total);
            match tokio::time::timeout(timeout, self.stream.write_all(&bytes[sent..end])).await {
                Ok(Ok(())) => {
                    sent = end;
                    if total > PROGRESS_THRESHOLD && sent % (CHUNK_SIZE * 16) == 0 {
                        debug!(
                            "upload progress: {:.1}% ({}/{} bytes)",
                            sent as f64 / total as f64 * 100.0,
                            sent,
                            total
                        );
                    }
                }
                Ok(Err(e)) => return Err(TransportError::Io { done: sent, source: e }),
                Err(_) => {
                    return Err(TransportError::Timeout {
                        done: sent,
                        expected: total,
                        timeout,
                    })
                }
            }
        }
        self.stream
            .flush()
            .await
            .map_err(|e| TransportError::Io { done: sent, source: e })?;
        Ok(())
    }

    /// Read exactly `size` bytes, never silently returning a short buffer.
    ///
    /// Each chunk read is bounded by `timeout`, so the clock resets whenever
    /// the peer makes progress. Errors distinguish a stall (`Timeout`), a
    /// clean close (`Closed`) and socket faults (`Io`), each carrying the
    /// byte count reached.
    pub async fn recv_exact(
        &mut self,
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; size];
        let mut received = 0;

        if !self.pushback.is_empty() {
            let take = self.pushback.len().min(size);
            buf[..take].copy_from_slice(&self.pushback[..take]);
            self.pushback.drain(..take);
            received = take;
        }

        let mut last_logged = 0usize;
        while received < size {
            let end = (received + CHUNK_SIZE).min(size);
            match tokio::time::timeout(timeout, self.stream.read(&mut buf[received..end])).await {
                Ok(Ok(0)) => {
                    return Err(TransportError::Closed {
                        done: received,
                        expected: size,
                    })
                }
                Ok(Ok(n)) => {
                    received += n;
                    if size > PROGRESS_THRESHOLD {
                        let pct = received * 100 / size;
                        if pct >= last_logged + 10 {
                            debug!("receive progress: {}% ({}/{} bytes)", pct, received, size);
                            last_logged = pct;
                        }
                    }
                }
                Ok(Err(e)) => {
                    return Err(TransportError::Io {
                        done: received,
                        source: e,
                    })
                }
                Err(_) => {
                    return Err(TransportError::Timeout {
                        done: received,
                        expected: size,
                        timeout,
                    })
                }
            }
        }
        Ok(buf)
    }

    /// Read a big-endian u32 length field.
    pub async fn recv_u32(&mut self, timeout: Duration) -> Result<u32, TransportError> {
        let bytes = self.recv_exact(4, timeout).await?;
        let mut field = [0u8; 4];
        field.copy_from_slice(&bytes);
        Ok(u32::from_be_bytes(field))
    }

    /// Write a big-endian u32 length field.
    pub async fn send_u32(&mut self, value: u32, timeout: Duration) -> Result<(), TransportError> {
        self.send_all(&value.to_be_bytes(), timeout).await
    }

    /// Graceful half-close; errors are irrelevant at this point.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
