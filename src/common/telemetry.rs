//! # Telemetry Frame Schema
//!
//! After decrypting a result the client reports its timings back to the
//! server as a small JSON frame. The exchange is best-effort: a missing or
//! malformed frame is ignored on both sides, and unknown or absent fields
//! must never crash a handler. The schema is therefore fixed, with every
//! optional field defaulting.

use serde::{Deserialize, Serialize};

/// Client-side timing report for one processed file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    /// Filename the timings refer to.
    #[serde(default)]
    pub filename: String,
    /// Seconds the client spent decrypting the response.
    #[serde(default)]
    pub decrypt_time_secs: f64,
    /// Size of the decrypted result in kilobytes.
    #[serde(default)]
    pub result_size_kb: f64,
}

impl TelemetryReport {
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
