//! # Configuration Utilities
//!
//! Shared configuration loading used by both client and server components.
//! Each side defines its own config struct; this module only provides the
//! TOML plumbing and small helpers.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Example
/// ```ignore
/// let config: ServerConfig = load_config("config/server.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {path}"))?;
    let config: T = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file {path}"))?;
    Ok(config)
}

/// Seconds-to-Duration shorthand for the timeout config fields.
pub fn secs(value: u64) -> Duration {
    Duration::from_secs(value)
}
