pub mod client;
pub mod common;
pub mod crypto;
pub mod inference;
pub mod server;

pub use client::client::ClientConnection;
pub use server::server::SessionServer;
