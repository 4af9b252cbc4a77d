//! Error types for `hostrelay`

use std::time::Duration;
use thiserror::Error;

/// Main error type for `hostrelay` operations
#[derive(Error, Debug)]
pub enum TunnelError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer broke the multiplexer protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Control handshake rejected
    #[error("handshake aborted: {0}")]
    Handshake(String),

    /// CONNECT carried an identifier nobody registered a host for
    #[error("no host associated for identifier {0}")]
    UnknownIdentifier(String),

    /// Public request without a usable Host header
    #[error("request host is empty")]
    EmptyHost,

    #[error("no virtual host available for {0}")]
    NoVirtualHost(String),

    #[error("no control channel available for {0}")]
    NoControlChannel(String),

    #[error("no session available for '{0}'")]
    NoSession(String),

    /// Control channel read loop has ended
    #[error("control channel for {0} is closed")]
    ControlClosed(String),

    /// Multiplexed session has shut down
    #[error("session closed")]
    SessionClosed,

    /// The client did not open a stream in time
    #[error("peer unresponsive: no stream opened within {0:?}")]
    PeerUnresponsive(Duration),

    /// Request/response exchange over a tunnel stream failed
    #[error("proxy error: {0}")]
    Proxy(String),

    /// A configured resource limit was hit
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TunnelError {
    /// Host, identifier, control channel or session lookup failed.
    pub fn is_directory_miss(&self) -> bool {
        matches!(
            self,
            Self::EmptyHost
                | Self::NoVirtualHost(_)
                | Self::NoControlChannel(_)
                | Self::NoSession(_)
                | Self::UnknownIdentifier(_)
        )
    }

    /// The control channel or session backing a tenant went away.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::ControlClosed(_) | Self::SessionClosed | Self::PeerUnresponsive(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, TunnelError>;

impl From<bincode::Error> for TunnelError {
    fn from(err: bincode::Error) -> Self {
        TunnelError::Serialization(err.to_string())
    }
}
