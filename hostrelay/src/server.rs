//! Embeddable relay server with builder pattern.
//!
//! # Example
//!
//! ```rust,no_run
//! use hostrelay::Server;
//!
//! # async fn example() -> hostrelay::Result<()> {
//! let mut server = Server::builder()
//!     .bind("127.0.0.1:0".parse().unwrap())
//!     .host("foo.example.com", "abc123")
//!     .build()?;
//!
//! let addr = server.start().await?;
//! // ... clients connect to `addr` ...
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ServerConfig;
use hostrelay_common::config::{LimitsConfig, MuxConfig, RelayConfig};
use hostrelay_common::{Result, TunnelError};
use hostrelay_core::TunnelServer;
use hostrelay_http::HttpIngress;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// A relay server that can be embedded in your application.
///
/// Use [`Server::builder()`] to create a new server with the builder pattern.
/// The routing state lives as long as the `Server`; hosts can be added and
/// removed while it runs.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    relay: TunnelServer,
    shutdown_tx: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<Result<()>>>,
    local_addr: Option<SocketAddr>,
}

/// Builder for constructing a [`Server`] with ergonomic configuration.
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Bind the listener and start serving in the background.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port `0` was requested. The server runs until
    /// [`shutdown()`](Self::shutdown) or [`stop()`](Self::stop) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the server is already running or the address
    /// cannot be bound.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if self.task.is_some() {
            return Err(TunnelError::InvalidState("server already started".into()));
        }

        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!("Starting hostrelay server");
        info!("  HTTP bind: {}", local_addr);
        info!("  Virtual hosts: {}", self.config.hosts.len());

        let ingress = HttpIngress::new(self.relay.clone());
        let relay = self.relay.clone();
        let task = tokio::spawn(async move {
            let result = tokio::select! {
                result = ingress.serve(listener) => result,
                _ = shutdown_rx.changed() => {
                    info!("Server shutdown requested");
                    Ok(())
                }
            };
            relay.close_all();
            result
        });

        self.shutdown_tx = Some(shutdown_tx);
        self.task = Some(task);
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Wait until the serving task ends, either through shutdown or failure.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.task = None;
        self.shutdown_tx = None;
        match outcome {
            Ok(result) => result,
            Err(e) => Err(TunnelError::Connection(format!(
                "Ingress task panicked: {e}"
            ))),
        }
    }

    /// Shutdown the server and wait for cleanup.
    ///
    /// Every open tunnel is closed once the listener stops.
    pub async fn shutdown(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.local_addr = None;
        Ok(())
    }

    /// Signal the server to stop (non-blocking).
    ///
    /// Use [`shutdown()`](Self::shutdown) if you need to wait for cleanup.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }

    /// Check if the server is currently running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Address the listener is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Get the current configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The routing state shared with the listener
    pub fn relay(&self) -> &TunnelServer {
        &self.relay
    }

    /// Map `host` to `identifier`, replacing any previous mapping of either
    pub fn add_host(&self, host: &str, identifier: &str) {
        self.relay.add_host(host, identifier);
    }

    /// Remove the mapping for `host`; `identifier` is not consulted
    pub fn delete_host(&self, host: &str, identifier: &str) {
        self.relay.delete_host(host, identifier);
    }

    pub fn get_identifier(&self, host: &str) -> Option<String> {
        self.relay.get_identifier(host)
    }

    pub fn get_host(&self, identifier: &str) -> Option<String> {
        self.relay.get_host(identifier)
    }

    /// Whether `identifier` currently has a live control channel
    pub fn has_control(&self, identifier: &str) -> bool {
        self.relay.has_control(identifier)
    }

    /// Whether `host` currently has a live tunnel session
    pub fn has_session(&self, host: &str) -> bool {
        self.relay.has_session(host)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

impl ServerBuilder {
    /// Set the address of the HTTP listener.
    ///
    /// Default: `0.0.0.0:8080`
    #[must_use]
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Replace the whole relay configuration.
    #[must_use]
    pub fn relay_config(mut self, relay: RelayConfig) -> Self {
        self.config.relay = relay;
        self
    }

    /// Multiplexer tuning applied to every tunnel.
    #[must_use]
    pub fn mux_config(mut self, mux: MuxConfig) -> Self {
        self.config.relay.mux = mux;
        self
    }

    #[must_use]
    pub fn limits(mut self, limits: LimitsConfig) -> Self {
        self.config.relay.limits = limits;
        self
    }

    /// Bound on waiting for a client's handshake stream.
    ///
    /// Default: 10 seconds
    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.relay.handshake_timeout = timeout;
        self
    }

    /// Bound on waiting for response headers from a tunnel.
    ///
    /// Default: 60 seconds
    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.relay.response_timeout = timeout;
        self
    }

    /// Tag each stream request with a correlation id.
    ///
    /// Default: enabled. Disable for clients that never echo the id; relay
    /// streams are then matched to requests in arrival order.
    #[must_use]
    pub fn correlate_streams(mut self, enabled: bool) -> Self {
        self.config.relay.correlate_streams = enabled;
        self
    }

    /// Register a virtual host before the server starts.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>, identifier: impl Into<String>) -> Self {
        self.config.hosts.push((host.into(), identifier.into()));
        self
    }

    /// Build the server with the configured options.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the relay configuration is invalid
    /// or a host entry is empty.
    pub fn build(self) -> Result<Server> {
        self.config.validate()?;
        let relay = TunnelServer::new(self.config.relay.clone())?;
        for (host, identifier) in &self.config.hosts {
            relay.add_host(host, identifier);
        }
        Ok(Server {
            config: self.config,
            relay,
            shutdown_tx: None,
            task: None,
            local_addr: None,
        })
    }
}
