//! Client-side configuration, TOML-backed with deployment defaults.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address, host:port.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Pre-shared AES key; must match the server's.
    #[serde(default = "default_key")]
    pub key: String,

    /// Directory decrypted results are written into.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    #[serde(default)]
    pub timeouts: ClientTimeouts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTimeouts {
    /// TCP connect window.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Per-chunk send/receive window for uploads and responses.
    #[serde(default = "default_socket_secs")]
    pub socket_secs: u64,

    /// Window for the whole auth exchange.
    #[serde(default = "default_auth_secs")]
    pub auth_secs: u64,

    /// Window for the telemetry ACK; expiry is not an error.
    #[serde(default = "default_telemetry_secs")]
    pub telemetry_secs: u64,
}

fn default_server_addr() -> String {
    "127.0.0.1:12345".to_string()
}
fn default_key() -> String {
    "tEaXKE1f8Xe8k3SlVRMGxQAoGIcDAq0C".to_string()
}
fn default_output_dir() -> String {
    "client_data/results".to_string()
}
fn default_connect_secs() -> u64 {
    10
}
fn default_socket_secs() -> u64 {
    30
}
fn default_auth_secs() -> u64 {
    5
}
fn default_telemetry_secs() -> u64 {
    5
}

impl Default for ClientTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            socket_secs: default_socket_secs(),
            auth_secs: default_auth_secs(),
            telemetry_secs: default_telemetry_secs(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            key: default_key(),
            output_dir: default_output_dir(),
            timeouts: ClientTimeouts::default(),
        }
    }
}
