//! # Accept Loop and Handler Supervision
//!
//! The server owns the listener, the shared read-only configuration, and a
//! registry of live handler tasks. Each accepted connection gets its own
//! task; shutdown flips a watch channel every task observes, then joins the
//! registry with a bounded wait before aborting stragglers.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::common::config::secs;
use crate::common::framing::Connection;
use crate::inference::InferenceEngine;
use crate::server::config::ServerConfig;
use crate::server::logger::SessionLogger;
use crate::server::session::ClientSession;

/// Sender half of the shutdown signal, held by the binary (ctrl-c handler)
/// or a test.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        // Receivers may all be gone already; that is a completed shutdown.
        let _ = self.tx.send(true);
    }
}

/// Receiver half, cloned into every handler task and the accept loop.
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown is triggered. Also resolves if the sender was
    /// dropped without triggering, which only happens when the server owner
    /// is gone anyway.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, ShutdownToken) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownToken { rx })
}

pub struct SessionServer {
    config: Arc<ServerConfig>,
    key: Arc<Vec<u8>>,
    password_hash: Arc<String>,
    engine: Arc<dyn InferenceEngine>,
    logger: Arc<SessionLogger>,
    handlers: Mutex<Vec<(String, JoinHandle<()>)>>,
}

impl SessionServer {
    /// Validate the key, create the data directories, and open the session
    /// logger. Fails fast; nothing is bound yet.
    pub fn new(config: ServerConfig, engine: Arc<dyn InferenceEngine>) -> Result<Self> {
        let key = Arc::new(config.key_bytes()?);
        let password_hash = Arc::new(config.password_hash());
        config
            .bootstrap_dirs()
            .context("failed to create data directories")?;
        let logger = Arc::new(
            SessionLogger::new(config.logs_dir()).context("failed to open session log dir")?,
        );
        Ok(Self {
            config: Arc::new(config),
            key,
            password_hash,
            engine,
            logger,
            handlers: Mutex::new(Vec::new()),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownToken) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind))?;
        self.config.log_banner();
        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already-bound listener. Tests bind 127.0.0.1:0
    /// themselves and pass the listener in.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: ShutdownToken) -> Result<()> {
        let mut accept_shutdown = shutdown.clone();
        loop {
            let accepted = tokio::select! {
                _ = accept_shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    // Transient accept errors (EMFILE and friends) must not
                    // kill the loop.
                    error!("accept failed: {e}");
                    continue;
                }
            };

            self.reap_finished();
            let live = self.handlers.lock().map(|h| h.len()).unwrap_or(0);
            if live >= self.config.limits.max_concurrent_clients {
                warn!(
                    "⚠️ {live} concurrent clients (soft limit {}), accepting anyway",
                    self.config.limits.max_concurrent_clients
                );
            }

            let session = ClientSession::new(
                Connection::new(stream),
                self.config.clone(),
                self.key.clone(),
                self.password_hash.clone(),
                self.engine.clone(),
                self.logger.clone(),
                shutdown.clone(),
            );
            let handle = tokio::spawn(session.run());
            if let Ok(mut handlers) = self.handlers.lock() {
                handlers.push((addr.to_string(), handle));
            }
        }

        info!("🛑 shutdown: waiting for live sessions");
        self.join_handlers().await;
        // Listener drops here, after every session had its chance to finish.
        drop(listener);
        info!("[+] server stopped");
        Ok(())
    }

    fn reap_finished(&self) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.retain(|(_, handle)| !handle.is_finished());
        }
    }

    async fn join_handlers(&self) {
        let drained: Vec<(String, JoinHandle<()>)> = match self.handlers.lock() {
            Ok(mut handlers) => handlers.drain(..).collect(),
            Err(_) => return,
        };
        let join_timeout = secs(self.config.timeouts.shutdown_join_secs);
        for (peer, mut handle) in drained {
            if handle.is_finished() {
                continue;
            }
            match tokio::time::timeout(join_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("session task for {peer} panicked: {e}"),
                Err(_) => {
                    warn!("session for {peer} did not stop within {join_timeout:?}, aborting");
                    handle.abort();
                }
            }
        }
    }
}
