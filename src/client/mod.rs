pub mod client;
pub mod config;
pub mod metrics;

pub use client::{ClientConnection, ClientError, ConnectReport, TransferReport};
pub use config::{ClientConfig, ClientTimeouts};
pub use metrics::ClientMetrics;
