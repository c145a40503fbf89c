//! # Server Configuration
//!
//! All server tunables in one TOML-backed struct, with defaults matching
//! the deployed system. The password is hashed once at startup; the
//! plaintext never travels further than this struct.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use log::info;
use serde::{Deserialize, Serialize};

use crate::crypto;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "0.0.0.0:12345".
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Session password; clients send its SHA-256 digest.
    #[serde(default = "default_password")]
    pub password: String,

    /// Pre-shared AES key (16, 24 or 32 bytes).
    #[serde(default = "default_key")]
    pub key: String,

    /// Root directory for uploads, results, encrypted copies and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub limits: LimitConfig,

    #[serde(default)]
    pub timeouts: ServerTimeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Upload validation ceiling in MB (the 100 MiB frame ceiling still
    /// applies first, as a protocol-level reject).
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,

    /// Lowercase extension allow-list for uploads.
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Soft backlog hint; connections beyond this are still accepted but
    /// logged as overload.
    #[serde(default = "default_max_clients")]
    pub max_concurrent_clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTimeouts {
    /// Window for the whole auth exchange on a fresh connection.
    #[serde(default = "default_auth_secs")]
    pub auth_secs: u64,

    /// Per-chunk receive/send window inside the main loop. A fully idle
    /// peer is disconnected after this long.
    #[serde(default = "default_socket_secs")]
    pub socket_secs: u64,

    /// Short window for the optional telemetry frame.
    #[serde(default = "default_telemetry_secs")]
    pub telemetry_secs: u64,

    /// How long shutdown waits for each live handler to finish.
    #[serde(default = "default_join_secs")]
    pub shutdown_join_secs: u64,
}

fn default_bind() -> String {
    "0.0.0.0:12345".to_string()
}
fn default_password() -> String {
    "jagapadi2024".to_string()
}
fn default_key() -> String {
    "tEaXKE1f8Xe8k3SlVRMGxQAoGIcDAq0C".to_string()
}
fn default_data_dir() -> String {
    "server_data".to_string()
}
fn default_max_upload_mb() -> u64 {
    50
}
fn default_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "tiff"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_max_clients() -> usize {
    10
}
fn default_auth_secs() -> u64 {
    10
}
fn default_socket_secs() -> u64 {
    60
}
fn default_telemetry_secs() -> u64 {
    2
}
fn default_join_secs() -> u64 {
    5
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_upload_mb: default_max_upload_mb(),
            allowed_extensions: default_extensions(),
            max_concurrent_clients: default_max_clients(),
        }
    }
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            auth_secs: default_auth_secs(),
            socket_secs: default_socket_secs(),
            telemetry_secs: default_telemetry_secs(),
            shutdown_join_secs: default_join_secs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            password: default_password(),
            key: default_key(),
            data_dir: default_data_dir(),
            limits: LimitConfig::default(),
            timeouts: ServerTimeouts::default(),
        }
    }
}

impl ServerConfig {
    /// Pre-shared key as raw bytes, validated for AES key lengths.
    pub fn key_bytes(&self) -> Result<Vec<u8>> {
        let bytes = self.key.as_bytes().to_vec();
        if crypto::validate_key(&bytes).is_err() {
            bail!(
                "pre-shared key must be 16, 24 or 32 bytes, got {}",
                bytes.len()
            );
        }
        Ok(bytes)
    }

    /// Expected hex digest of the session password.
    pub fn password_hash(&self) -> String {
        crypto::hash_password(&self.password)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("original_images")
    }

    pub fn results_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("detection_results")
    }

    pub fn encrypted_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("encrypted_copies")
    }

    pub fn logs_dir(&self) -> PathBuf {
        Path::new(&self.data_dir).join("logs")
    }

    /// Create every directory the server writes into.
    pub fn bootstrap_dirs(&self) -> Result<()> {
        for dir in [
            self.uploads_dir(),
            self.results_dir(),
            self.encrypted_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Validate one upload against the extension allow-list and size
    /// ceiling. A rejection keeps the connection alive; the caller logs it
    /// and awaits the next request.
    pub fn validate_upload(&self, filename: &str, size_bytes: usize) -> Result<(), String> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !self.limits.allowed_extensions.contains(&extension) {
            return Err(format!("file extension not allowed: .{extension}"));
        }

        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        if size_mb > self.limits.max_upload_mb as f64 {
            return Err(format!(
                "file too large: {:.1}MB (max: {}MB)",
                size_mb, self.limits.max_upload_mb
            ));
        }
        Ok(())
    }

    /// Log the effective configuration at startup.
    pub fn log_banner(&self) {
        info!("🌾 PestDetect server");
        info!("[+] listening on {}", self.bind);
        info!("[+] data directory: {}", self.data_dir);
        info!(
            "[+] max upload: {}MB, extensions: {:?}",
            self.limits.max_upload_mb, self.limits.allowed_extensions
        );
        info!(
            "[+] max concurrent clients (soft): {}",
            self.limits.max_concurrent_clients
        );
        info!(
            "[+] timeouts: auth {}s, socket {}s, telemetry {}s",
            self.timeouts.auth_secs, self.timeouts.socket_secs, self.timeouts.telemetry_secs
        );
    }
}
