//! Resource limits for preventing resource exhaustion

use hostrelay_common::config::LimitsConfig;
use hostrelay_common::TunnelError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Resource limit errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceLimitError {
    #[error("maximum tunnels reached ({max})")]
    MaxTunnelsReached { max: usize },
    #[error("maximum streams per session reached ({max})")]
    MaxStreamsReached { max: usize },
}

impl From<ResourceLimitError> for TunnelError {
    fn from(err: ResourceLimitError) -> Self {
        TunnelError::LimitExceeded(err.to_string())
    }
}

/// Relay-wide resource limits
#[derive(Debug, Clone)]
pub struct ServerResourceLimits {
    tunnel_semaphore: Arc<Semaphore>,
    max_tunnels: usize,
    pub max_streams_per_session: usize,
}

impl ServerResourceLimits {
    #[must_use]
    pub fn new(max_tunnels: usize, max_streams_per_session: usize) -> Self {
        Self {
            tunnel_semaphore: Arc::new(Semaphore::new(max_tunnels)),
            max_tunnels,
            max_streams_per_session,
        }
    }

    #[must_use]
    pub fn from_config(config: &LimitsConfig) -> Self {
        Self::new(config.max_tunnels, config.max_streams_per_session)
    }

    /// Try to acquire a tunnel slot
    /// Returns a permit that must be held for the session's lifetime
    pub fn try_acquire_tunnel(&self) -> Result<TunnelPermit, ResourceLimitError> {
        match Arc::clone(&self.tunnel_semaphore).try_acquire_owned() {
            Ok(permit) => Ok(TunnelPermit { _permit: permit }),
            Err(_) => Err(ResourceLimitError::MaxTunnelsReached {
                max: self.max_tunnels,
            }),
        }
    }

    /// Create stream limits for a new session
    #[must_use]
    pub fn create_stream_limits(&self) -> StreamLimits {
        StreamLimits::new(self.max_streams_per_session)
    }

    #[must_use]
    pub fn available_tunnels(&self) -> usize {
        self.tunnel_semaphore.available_permits()
    }
}

impl Default for ServerResourceLimits {
    fn default() -> Self {
        Self::from_config(&LimitsConfig::default())
    }
}

/// Permit for holding a tunnel slot
#[derive(Debug)]
pub struct TunnelPermit {
    _permit: OwnedSemaphorePermit,
}

/// Per-session stream limits
#[derive(Debug, Clone)]
pub struct StreamLimits {
    stream_semaphore: Arc<Semaphore>,
    max_streams: usize,
}

impl StreamLimits {
    #[must_use]
    pub fn new(max_streams: usize) -> Self {
        Self {
            stream_semaphore: Arc::new(Semaphore::new(max_streams)),
            max_streams,
        }
    }

    /// Try to acquire a stream slot
    pub fn try_acquire_stream(&self) -> Result<StreamPermit, ResourceLimitError> {
        match Arc::clone(&self.stream_semaphore).try_acquire_owned() {
            Ok(permit) => Ok(StreamPermit { _permit: permit }),
            Err(_) => Err(ResourceLimitError::MaxStreamsReached {
                max: self.max_streams,
            }),
        }
    }

    #[must_use]
    pub fn available_streams(&self) -> usize {
        self.stream_semaphore.available_permits()
    }
}

/// Permit for holding a stream slot
#[derive(Debug)]
pub struct StreamPermit {
    _permit: OwnedSemaphorePermit,
}
