//! Configuration for the embedded relay server.

use hostrelay_common::config::RelayConfig;
use hostrelay_common::constants::DEFAULT_HTTP_PORT;
use hostrelay_common::{Result, TunnelError};
use std::net::SocketAddr;

/// Configuration for the relay server.
///
/// Use [`ServerBuilder`](crate::ServerBuilder) for ergonomic construction.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the single HTTP listener (control path and public traffic)
    pub bind_addr: SocketAddr,

    /// Relay engine tuning
    pub relay: RelayConfig,

    /// Virtual hosts registered before the listener starts, as `(host, identifier)`
    pub hosts: Vec<(String, String)>,
}

impl ServerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        for (host, identifier) in &self.hosts {
            if host.trim().is_empty() {
                return Err(TunnelError::Config("virtual host must not be empty".into()));
            }
            if identifier.is_empty() {
                return Err(TunnelError::Config(format!(
                    "identifier for host {host} must not be empty"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            relay: RelayConfig::default(),
            hosts: Vec::new(),
        }
    }
}
