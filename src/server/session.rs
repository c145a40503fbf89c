//! # Per-Connection Session Handler
//!
//! One `ClientSession` runs per accepted connection, isolated from every
//! other: authenticate, then loop receive → validate → infer → encrypt →
//! send → (optional telemetry) until the peer disconnects, goes idle, or a
//! fatal error ends the loop. Within one connection requests are strictly
//! sequential; nothing is pipelined.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, bail};
use base64::Engine as _;
use chrono::{DateTime, Local};
use log::{debug, info, warn};

use crate::common::config::secs;
use crate::common::error::{ProtocolError, TransportError};
use crate::common::framing::{
    Connection, ACK, AUTH_ERR, AUTH_OK, MAX_FILENAME_BYTES, MAX_IMAGE_BYTES, MAX_TELEMETRY_BYTES,
    PING, PONG, TAG_AUTH, TAG_TIMING,
};
use crate::common::telemetry::TelemetryReport;
use crate::crypto;
use crate::inference::InferenceEngine;
use crate::server::config::ServerConfig;
use crate::server::logger::SessionLogger;
use crate::server::server::ShutdownToken;

/// Timing and size record for one processed upload.
#[derive(Debug, Clone)]
pub struct FileMetric {
    pub filename: String,
    pub labels: Vec<String>,
    pub size_original_kb: f64,
    pub size_encrypted_kb: f64,
    pub detection_secs: f64,
    pub encryption_secs: f64,
    pub confidence: f64,
    /// Reported by the client via the telemetry frame; zero when absent.
    pub client_decrypt_secs: f64,
}

/// Per-connection accumulator, owned exclusively by the handling task and
/// handed to the logging collaborator at disconnect.
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    pub ip: String,
    pub connected_at: DateTime<Local>,
    pub disconnected_at: Option<DateTime<Local>>,
    pub files: Vec<FileMetric>,
}

impl SessionMetrics {
    pub fn new(ip: String) -> Self {
        Self {
            ip,
            connected_at: Local::now(),
            disconnected_at: None,
            files: Vec::new(),
        }
    }

    pub fn duration_secs(&self) -> f64 {
        let end = self.disconnected_at.unwrap_or_else(Local::now);
        (end - self.connected_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn detection_count(&self) -> usize {
        self.files.iter().filter(|f| !f.labels.is_empty()).count()
    }

    pub fn average_confidence(&self) -> f64 {
        let detected: Vec<f64> = self
            .files
            .iter()
            .filter(|f| f.confidence > 0.0)
            .map(|f| f.confidence)
            .collect();
        if detected.is_empty() {
            0.0
        } else {
            detected.iter().sum::<f64>() / detected.len() as f64
        }
    }
}

/// What the first bytes of a loop iteration turned out to be.
///
/// `Idle` and `Disconnect` are benign loop exits, not errors — a timeout
/// with zero bytes read means the peer simply has nothing more to send.
enum RecvOutcome {
    Upload { filename: String, payload: Vec<u8> },
    Ping,
    Disconnect,
    Idle,
}

pub(crate) struct ClientSession {
    conn: Connection,
    config: Arc<ServerConfig>,
    key: Arc<Vec<u8>>,
    password_hash: Arc<String>,
    engine: Arc<dyn InferenceEngine>,
    logger: Arc<SessionLogger>,
    shutdown: ShutdownToken,
    metrics: SessionMetrics,
}

impl ClientSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conn: Connection,
        config: Arc<ServerConfig>,
        key: Arc<Vec<u8>>,
        password_hash: Arc<String>,
        engine: Arc<dyn InferenceEngine>,
        logger: Arc<SessionLogger>,
        shutdown: ShutdownToken,
    ) -> Self {
        let metrics = SessionMetrics::new(conn.peer().to_string());
        Self {
            conn,
            config,
            key,
            password_hash,
            engine,
            logger,
            shutdown,
            metrics,
        }
    }

    /// Drive the whole session. Never panics the process; every fault is
    /// logged and ends at most this one connection.
    pub async fn run(mut self) {
        let ip = self.metrics.ip.clone();
        info!("[+] client connected: {ip}");

        if let Err(e) = self.authenticate().await {
            self.logger.record_error(&ip, &e.to_string(), "authentication");
            info!("[-] client rejected: {ip}");
            self.conn.close().await;
            return;
        }
        info!("🔐 client authenticated: {ip}");

        loop {
            if self.shutdown.is_triggered() {
                debug!("shutdown observed, ending session for {ip}");
                break;
            }
            let mut shutdown = self.shutdown.clone();
            let outcome = tokio::select! {
                _ = shutdown.cancelled() => break,
                outcome = self.next_request() => outcome,
            };
            match outcome {
                Ok(RecvOutcome::Upload { filename, payload }) => {
                    if let Err(e) = self.process_upload(&filename, payload).await {
                        self.logger.record_error(&ip, &e.to_string(), "request handling");
                        break;
                    }
                }
                Ok(RecvOutcome::Ping) => {
                    let socket_timeout = secs(self.config.timeouts.socket_secs);
                    if self.conn.send_all(PONG, socket_timeout).await.is_err() {
                        break;
                    }
                }
                Ok(RecvOutcome::Disconnect) => {
                    debug!("disconnect notice from {ip}");
                    break;
                }
                Ok(RecvOutcome::Idle) => {
                    debug!("idle disconnect for {ip}");
                    break;
                }
                Err(e) => {
                    self.logger.record_error(&ip, &e.to_string(), "data receive");
                    break;
                }
            }
        }

        self.conn.close().await;
        self.metrics.disconnected_at = Some(Local::now());
        if !self.metrics.files.is_empty() {
            self.logger.record_session(&self.metrics);
        }
        info!(
            "[-] client disconnected: {ip} ({} files)",
            self.metrics.files.len()
        );
    }

    /// One-shot challenge/response. Any deviation rejects the connection;
    /// there is no retry within a session.
    async fn authenticate(&mut self) -> anyhow::Result<()> {
        let auth_timeout = secs(self.config.timeouts.auth_secs);

        let tag = self.conn.recv_exact(4, auth_timeout).await?;
        if tag != TAG_AUTH {
            bail!(ProtocolError::UnexpectedToken(tag));
        }

        let digest_len = self.conn.recv_u32(auth_timeout).await? as usize;
        if digest_len > 128 {
            bail!(ProtocolError::Oversized {
                declared: digest_len,
                limit: 128,
            });
        }
        let digest = self.conn.recv_exact(digest_len, auth_timeout).await?;

        if crypto::constant_time_eq(&digest, self.password_hash.as_bytes()) {
            self.conn.send_all(AUTH_OK, auth_timeout).await?;
            Ok(())
        } else {
            let _ = self.conn.send_all(AUTH_ERR, auth_timeout).await;
            Err(anyhow!("invalid password"))
        }
    }

    /// Read the next request off the wire. The first 4 bytes disambiguate
    /// a liveness probe, a disconnect notice, and the filename-length field
    /// of an upload header.
    async fn next_request(&mut self) -> anyhow::Result<RecvOutcome> {
        let socket_timeout = secs(self.config.timeouts.socket_secs);

        let head = match self.conn.recv_exact(4, socket_timeout).await {
            Ok(head) => head,
            Err(TransportError::Timeout { done: 0, .. }) => return Ok(RecvOutcome::Idle),
            Err(TransportError::Closed { done: 0, .. }) => return Ok(RecvOutcome::Disconnect),
            Err(e) => return Err(e.into()),
        };

        if head == PING {
            return Ok(RecvOutcome::Ping);
        }
        if head == b"DISC" {
            // Drain the rest of the notice; nothing follows it.
            let _ = self.conn.recv_exact(6, secs(2)).await;
            return Ok(RecvOutcome::Disconnect);
        }

        let mut field = [0u8; 4];
        field.copy_from_slice(&head);
        let filename_len = u32::from_be_bytes(field) as usize;
        if filename_len > MAX_FILENAME_BYTES {
            bail!(ProtocolError::Oversized {
                declared: filename_len,
                limit: MAX_FILENAME_BYTES,
            });
        }

        let payload_len = self.conn.recv_u32(socket_timeout).await? as usize;
        if payload_len > MAX_IMAGE_BYTES {
            // Rejected before any payload buffering is attempted.
            bail!(ProtocolError::Oversized {
                declared: payload_len,
                limit: MAX_IMAGE_BYTES,
            });
        }

        let filename_bytes = self.conn.recv_exact(filename_len, socket_timeout).await?;
        let filename =
            String::from_utf8(filename_bytes).map_err(|_| ProtocolError::BadUtf8)?;
        let payload = self.conn.recv_exact(payload_len, socket_timeout).await?;

        Ok(RecvOutcome::Upload { filename, payload })
    }

    /// Full round trip for one upload. `Ok(())` means the loop continues,
    /// even when the request itself was skipped (validation or inference
    /// failure); only a send failure is fatal.
    async fn process_upload(&mut self, filename: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let ip = self.metrics.ip.clone();
        let size_original_kb = payload.len() as f64 / 1024.0;
        info!("📁 received: {filename} ({size_original_kb:.1} KB) from {ip}");

        if let Err(msg) = self.config.validate_upload(filename, payload.len()) {
            self.logger.record_error(&ip, &msg, "file validation");
            return Ok(());
        }

        let saved_name = format!("{}_{}", Local::now().timestamp(), sanitize(filename));
        if let Err(e) =
            tokio::fs::write(self.config.uploads_dir().join(&saved_name), &payload).await
        {
            self.logger
                .record_error(&ip, &e.to_string(), "upload persistence");
            return Ok(());
        }

        // Inference runs on the blocking pool; it is CPU-bound.
        let engine = self.engine.clone();
        let detect_started = Instant::now();
        let detection =
            match tokio::task::spawn_blocking(move || engine.infer(&payload)).await {
                Ok(Ok(detection)) => detection,
                Ok(Err(e)) => {
                    self.logger.record_error(&ip, &e.to_string(), "inference");
                    return Ok(());
                }
                Err(e) => {
                    self.logger
                        .record_error(&ip, &format!("inference task panicked: {e}"), "inference");
                    return Ok(());
                }
            };
        let detection_secs = detect_started.elapsed().as_secs_f64();
        info!(
            "🎯 detection: {filename} -> {} (conf: {:.3}, time: {detection_secs:.3}s)",
            if detection.labels.is_empty() {
                "NO_DETECTION".to_string()
            } else {
                detection.labels.join(", ")
            },
            detection.avg_confidence
        );

        if let Err(e) = tokio::fs::write(
            self.config.results_dir().join(format!("detected_{saved_name}")),
            &detection.annotated_image,
        )
        .await
        {
            self.logger
                .record_error(&ip, &e.to_string(), "result persistence");
        }

        let encrypt_started = Instant::now();
        let encrypted = match crypto::encrypt(&self.key, &detection.annotated_image) {
            Ok(encrypted) => encrypted,
            Err(e) => {
                self.logger.record_error(&ip, &e.to_string(), "encryption");
                return Ok(());
            }
        };
        let encryption_secs = encrypt_started.elapsed().as_secs_f64();

        // Auditable base64 copy of exactly what went over the wire.
        let copy = base64::engine::general_purpose::STANDARD.encode(&encrypted);
        if let Err(e) = tokio::fs::write(
            self.config.encrypted_dir().join(format!("{saved_name}.b64")),
            copy,
        )
        .await
        {
            self.logger
                .record_error(&ip, &e.to_string(), "encrypted copy persistence");
        }

        let socket_timeout = secs(self.config.timeouts.socket_secs);
        self.conn
            .send_u32(encrypted.len() as u32, socket_timeout)
            .await?;
        self.conn.send_all(&encrypted, socket_timeout).await?;

        let telemetry = self.try_receive_telemetry().await;

        self.metrics.files.push(FileMetric {
            filename: filename.to_string(),
            labels: detection.labels,
            size_original_kb,
            size_encrypted_kb: encrypted.len() as f64 / 1024.0,
            detection_secs,
            encryption_secs,
            confidence: detection.avg_confidence,
            client_decrypt_secs: telemetry.map(|t| t.decrypt_time_secs).unwrap_or(0.0),
        });
        info!("✅ completed: {filename} | detection {detection_secs:.3}s | encryption {encryption_secs:.3}s");
        Ok(())
    }

    /// Best-effort telemetry receive. Bytes that turn out not to be a
    /// telemetry tag are pushed back for the next request header; every
    /// failure path degrades to "no telemetry".
    async fn try_receive_telemetry(&mut self) -> Option<TelemetryReport> {
        let telemetry_timeout = secs(self.config.timeouts.telemetry_secs);

        // Byte-wise speculative read: whatever arrives is either the start
        // of a telemetry frame or the start of the next request header, and
        // the latter must survive intact. Reading one byte at a time means
        // a timeout can never swallow bytes already consumed.
        let mut tag: Vec<u8> = Vec::with_capacity(TAG_TIMING.len());
        while tag.len() < TAG_TIMING.len() {
            match self.conn.recv_exact(1, telemetry_timeout).await {
                Ok(byte) => {
                    tag.push(byte[0]);
                    if tag[..] != TAG_TIMING[..tag.len()] {
                        self.conn.push_back(&tag);
                        return None;
                    }
                }
                Err(_) => {
                    if !tag.is_empty() {
                        self.conn.push_back(&tag);
                    }
                    return None;
                }
            }
        }

        let json_len = self.conn.recv_u32(telemetry_timeout).await.ok()? as usize;
        if json_len > MAX_TELEMETRY_BYTES {
            warn!("telemetry frame oversized ({json_len} bytes), ignoring");
            return None;
        }
        let body = self.conn.recv_exact(json_len, telemetry_timeout).await.ok()?;
        let report = match TelemetryReport::from_bytes(&body) {
            Ok(report) => report,
            Err(e) => {
                debug!("malformed telemetry ignored: {e}");
                return None;
            }
        };

        self.conn.send_all(ACK, telemetry_timeout).await.ok()?;
        debug!(
            "📊 telemetry for {}: decrypt {:.4}s",
            report.filename, report.decrypt_time_secs
        );
        Some(report)
    }
}

/// Strip any path components a client might smuggle into the filename.
fn sanitize(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .replace(['\\', ':'], "_")
}
