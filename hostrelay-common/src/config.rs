//! Configuration types for the relay

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Multiplexer tuning applied to every tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Maximum encoded frame size in bytes (default: 16MB)
    pub max_frame_size: usize,
    /// Interval between heartbeats; `None` disables keepalive
    pub keepalive_interval: Option<Duration>,
    /// Streams opened by the peer that may wait unaccepted
    pub accept_backlog: usize,
    /// Bound on waiting for the peer to open a requested stream; `None` waits forever
    pub stream_open_timeout: Option<Duration>,
    /// Receive window per stream, in `Data` frames the peer may send ahead of reads
    pub stream_window: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            keepalive_interval: Some(Duration::from_secs(30)),
            accept_backlog: 256,
            stream_open_timeout: Some(Duration::from_secs(30)),
            stream_window: 64,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size < 1024 {
            return Err(TunnelError::Config(format!(
                "max_frame_size must be at least 1024 bytes, got {}",
                self.max_frame_size
            )));
        }
        if self.accept_backlog == 0 {
            return Err(TunnelError::Config("accept_backlog must be positive".into()));
        }
        if self.stream_window == 0 {
            return Err(TunnelError::Config("stream_window must be positive".into()));
        }
        if self.keepalive_interval == Some(Duration::ZERO) {
            return Err(TunnelError::Config(
                "keepalive_interval must be positive".into(),
            ));
        }
        if self.stream_open_timeout == Some(Duration::ZERO) {
            return Err(TunnelError::Config(
                "stream_open_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Resource limits configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrently upgraded tunnels
    pub max_tunnels: usize,
    /// Maximum concurrent relay streams per session
    pub max_streams_per_session: usize,
    /// Maximum identifier header length in bytes
    pub max_identifier_len: usize,
    /// Maximum concurrent public HTTP connections
    pub max_connections: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_tunnels: 1000,
            max_streams_per_session: 1000,
            max_identifier_len: 256,
            max_connections: 10_000,
        }
    }
}

/// Relay engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    pub mux: MuxConfig,
    /// Bound on waiting for the handshake stream after the upgrade
    pub handshake_timeout: Duration,
    /// Bound on waiting for response headers from the tunnel
    pub response_timeout: Duration,
    /// Match relay streams to control messages by correlation id instead of FIFO order
    pub correlate_streams: bool,
    pub limits: LimitsConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mux: MuxConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(60),
            correlate_streams: true,
            limits: LimitsConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        self.mux.validate()?;
        if self.handshake_timeout.is_zero() || self.response_timeout.is_zero() {
            return Err(TunnelError::Config("timeouts must be positive".into()));
        }
        if self.limits.max_tunnels == 0
            || self.limits.max_streams_per_session == 0
            || self.limits.max_connections == 0
        {
            return Err(TunnelError::Config("limits must be positive".into()));
        }
        if self.limits.max_identifier_len == 0 {
            return Err(TunnelError::Config(
                "max_identifier_len must be positive".into(),
            ));
        }
        Ok(())
    }
}
