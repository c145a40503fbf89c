//! # Client Connection Engine
//!
//! Synchronous request/response driver for one server connection: connect,
//! authenticate, then any number of image transfers on the same socket.
//! Every phase is timed; the caller gets the numbers back in a report
//! instead of digging them out of logs.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::net::TcpStream;

use crate::client::config::ClientConfig;
use crate::common::config::secs;
use crate::common::error::{ProtocolError, TransportError};
use crate::common::framing::{
    Connection, ACK, AUTH_ERR, AUTH_NO, AUTH_OK, DISCONNECT, MAX_FILENAME_BYTES, MAX_IMAGE_BYTES,
    MAX_RESPONSE_BYTES, PING, PONG, TAG_AUTH, TAG_TIMING,
};
use crate::common::telemetry::TelemetryReport;
use crate::crypto::{self, CryptoError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("not authenticated")]
    NotAuthenticated,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("failed to persist result: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one connect-and-authenticate attempt. Failures land in the
/// report rather than an error so callers can show the message and retry.
#[derive(Debug, Clone)]
pub struct ConnectReport {
    pub success: bool,
    pub connect_secs: f64,
    pub auth_secs: f64,
    /// One line a user can act on: refusal, timeout, rejection, and a
    /// malformed server reply all read differently.
    pub message: String,
}

/// Per-phase timings for one completed transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub filename: String,
    pub upload_secs: f64,
    /// Server processing plus download, measured from last upload byte to
    /// last response byte.
    pub response_secs: f64,
    pub decrypt_secs: f64,
    pub total_secs: f64,
    pub encrypted_bytes: usize,
    pub plaintext_bytes: usize,
    /// Advisory container check on the decrypted bytes ("JPEG", "PNG" or
    /// "unrecognized"). A wrong key typically shows up here first.
    pub format_hint: &'static str,
    pub output_path: PathBuf,
    pub telemetry_acked: bool,
}

pub struct ClientConnection {
    config: ClientConfig,
    key: Vec<u8>,
    conn: Option<Connection>,
    authenticated: bool,
}

impl ClientConnection {
    pub fn new(config: ClientConfig) -> Result<Self, CryptoError> {
        let key = config.key.as_bytes().to_vec();
        crypto::validate_key(&key)?;
        Ok(Self {
            config,
            key,
            conn: None,
            authenticated: false,
        })
    }

    pub fn connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// Connect and run the auth handshake. Never panics and never returns
    /// `Err`; every failure mode is folded into the report.
    pub async fn connect(&mut self, password: &str) -> ConnectReport {
        let addr = self.config.server_addr.clone();
        let connect_timeout = secs(self.config.timeouts.connect_secs);
        let auth_timeout = secs(self.config.timeouts.auth_secs);

        let started = Instant::now();
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let message = match e.kind() {
                    ErrorKind::ConnectionRefused => {
                        format!("connection refused by {addr} (is the server running?)")
                    }
                    ErrorKind::TimedOut => format!("connection to {addr} timed out"),
                    _ => format!("could not reach {addr}: {e}"),
                };
                return ConnectReport {
                    success: false,
                    connect_secs: started.elapsed().as_secs_f64(),
                    auth_secs: 0.0,
                    message,
                };
            }
            Err(_) => {
                return ConnectReport {
                    success: false,
                    connect_secs: started.elapsed().as_secs_f64(),
                    auth_secs: 0.0,
                    message: format!(
                        "connection to {addr} timed out after {}s",
                        self.config.timeouts.connect_secs
                    ),
                };
            }
        };
        let connect_secs = started.elapsed().as_secs_f64();
        let mut conn = Connection::new(stream);
        debug!("connected to {addr} in {connect_secs:.3}s");

        let auth_started = Instant::now();
        let digest = crypto::hash_password(password);
        let mut frame = Vec::with_capacity(4 + 4 + digest.len());
        frame.extend_from_slice(TAG_AUTH);
        frame.extend_from_slice(&(digest.len() as u32).to_be_bytes());
        frame.extend_from_slice(digest.as_bytes());

        let verdict = async {
            conn.send_all(&frame, auth_timeout).await?;
            conn.recv_exact(8, auth_timeout).await
        }
        .await;
        let auth_secs = auth_started.elapsed().as_secs_f64();

        let (success, message) = match verdict {
            Ok(reply) if reply == AUTH_OK => (true, format!("authenticated with {addr}")),
            Ok(reply) if reply == AUTH_ERR || reply == AUTH_NO => {
                (false, "authentication failed: invalid password".to_string())
            }
            Ok(reply) => (
                false,
                format!("malformed authentication reply: {:02x?}", &reply),
            ),
            Err(TransportError::Timeout { .. }) => {
                (false, "authentication timed out".to_string())
            }
            Err(TransportError::Closed { .. }) => (
                false,
                "server closed the connection during authentication".to_string(),
            ),
            Err(e) => (false, format!("authentication failed: {e}")),
        };

        if success {
            info!("🔐 {message} ({auth_secs:.3}s)");
            self.conn = Some(conn);
            self.authenticated = true;
        } else {
            warn!("[-] {message}");
            conn.close().await;
            self.conn = None;
            self.authenticated = false;
        }
        ConnectReport {
            success,
            connect_secs,
            auth_secs,
            message,
        }
    }

    /// Send one image and receive, decrypt and persist the annotated
    /// result. Safe to call repeatedly on the same connection; any error
    /// drops the connection so `connected()` reflects reality.
    pub async fn send_image(
        &mut self,
        filename: &str,
        image: &[u8],
    ) -> Result<TransferReport, ClientError> {
        if !self.authenticated {
            return Err(ClientError::NotAuthenticated);
        }
        let name_bytes = filename.as_bytes();
        if name_bytes.len() > MAX_FILENAME_BYTES {
            return Err(ProtocolError::Oversized {
                declared: name_bytes.len(),
                limit: MAX_FILENAME_BYTES,
            }
            .into());
        }
        if image.len() > MAX_IMAGE_BYTES {
            return Err(ProtocolError::Oversized {
                declared: image.len(),
                limit: MAX_IMAGE_BYTES,
            }
            .into());
        }
        let socket_timeout = secs(self.config.timeouts.socket_secs);

        let result = self
            .transfer(filename, image, socket_timeout)
            .await;
        if let Err(e) = &result {
            if let ClientError::Transport(t) = e {
                warn!(
                    "transfer of {filename} aborted after {} bytes: {t}",
                    t.bytes_done()
                );
            }
            // The stream position is unknowable after a mid-transfer fault.
            self.teardown().await;
        }
        result
    }

    async fn transfer(
        &mut self,
        filename: &str,
        image: &[u8],
        socket_timeout: Duration,
    ) -> Result<TransferReport, ClientError> {
        let conn = self.conn.as_mut().ok_or(ClientError::NotConnected)?;
        let total_started = Instant::now();

        let mut header = Vec::with_capacity(8 + filename.len());
        header.extend_from_slice(&(filename.len() as u32).to_be_bytes());
        header.extend_from_slice(&(image.len() as u32).to_be_bytes());
        header.extend_from_slice(filename.as_bytes());
        conn.send_all(&header, socket_timeout).await?;
        conn.send_all(image, socket_timeout).await?;
        let upload_secs = total_started.elapsed().as_secs_f64();
        info!(
            "📤 sent {filename} ({:.1} KB) in {upload_secs:.3}s",
            image.len() as f64 / 1024.0
        );

        let response_started = Instant::now();
        let response_len = conn.recv_u32(socket_timeout).await? as usize;
        if response_len > MAX_RESPONSE_BYTES {
            return Err(ProtocolError::Oversized {
                declared: response_len,
                limit: MAX_RESPONSE_BYTES,
            }
            .into());
        }
        let encrypted = conn.recv_exact(response_len, socket_timeout).await?;
        let response_secs = response_started.elapsed().as_secs_f64();

        let decrypt_started = Instant::now();
        let plaintext = crypto::decrypt(&self.key, &encrypted)?;
        let decrypt_secs = decrypt_started.elapsed().as_secs_f64();
        let format_hint = format_hint(&plaintext);
        if format_hint == "unrecognized" {
            warn!("⚠️ decrypted result has no known image signature (key mismatch?)");
        }

        std::fs::create_dir_all(&self.config.output_dir)?;
        let output_path =
            Path::new(&self.config.output_dir).join(format!("detected_{}", basename(filename)));
        std::fs::write(&output_path, &plaintext)?;

        let telemetry_acked = self
            .send_telemetry(filename, decrypt_secs, plaintext.len())
            .await;

        let report = TransferReport {
            filename: filename.to_string(),
            upload_secs,
            response_secs,
            decrypt_secs,
            total_secs: total_started.elapsed().as_secs_f64(),
            encrypted_bytes: encrypted.len(),
            plaintext_bytes: plaintext.len(),
            format_hint,
            output_path,
            telemetry_acked,
        };
        info!(
            "✅ {filename}: upload {upload_secs:.3}s | response {response_secs:.3}s | decrypt {decrypt_secs:.4}s",
        );
        Ok(report)
    }

    /// Best-effort timing report back to the server. A missing ACK only
    /// means the server skipped it.
    async fn send_telemetry(
        &mut self,
        filename: &str,
        decrypt_secs: f64,
        plaintext_len: usize,
    ) -> bool {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return false,
        };
        let telemetry_timeout = secs(self.config.timeouts.telemetry_secs);
        let report = TelemetryReport {
            filename: filename.to_string(),
            decrypt_time_secs: decrypt_secs,
            result_size_kb: plaintext_len as f64 / 1024.0,
        };
        let body = match report.to_bytes() {
            Ok(body) => body,
            Err(_) => return false,
        };
        let mut frame = Vec::with_capacity(10 + body.len());
        frame.extend_from_slice(TAG_TIMING);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let acked = async {
            conn.send_all(&frame, telemetry_timeout).await?;
            conn.recv_exact(ACK.len(), telemetry_timeout).await
        }
        .await
        .map(|reply| reply == ACK)
        .unwrap_or(false);
        if !acked {
            debug!("telemetry not acknowledged for {filename}");
        }
        acked
    }

    /// Liveness probe; returns the round-trip time.
    pub async fn ping(&mut self) -> Result<Duration, ClientError> {
        let socket_timeout = secs(self.config.timeouts.socket_secs);
        let conn = self.conn.as_mut().ok_or(ClientError::NotConnected)?;
        let started = Instant::now();
        let outcome: Result<(), ClientError> = async {
            conn.send_all(PING, socket_timeout).await?;
            let reply = conn.recv_exact(4, socket_timeout).await?;
            if reply != PONG {
                return Err(ProtocolError::UnexpectedToken(reply).into());
            }
            Ok(())
        }
        .await;
        if let Err(e) = outcome {
            self.teardown().await;
            return Err(e);
        }
        Ok(started.elapsed())
    }

    /// Announce the disconnect and close. The notice is unacknowledged, so
    /// a failure to send it changes nothing.
    pub async fn disconnect(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.send_all(DISCONNECT, secs(2)).await;
        }
        self.teardown().await;
        info!("[-] disconnected");
    }

    async fn teardown(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
        self.authenticated = false;
    }
}

fn basename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("result")
        .to_string()
}

/// Cheap container sniff on decrypted bytes.
fn format_hint(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0xFF, 0xD8]) {
        "JPEG"
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "PNG"
    } else {
        "unrecognized"
    }
}
