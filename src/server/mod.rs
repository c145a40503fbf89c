pub mod config;
pub mod logger;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use server::{shutdown_channel, SessionServer, ShutdownHandle, ShutdownToken};
pub use session::{FileMetric, SessionMetrics};
