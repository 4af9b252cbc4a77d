//! # hostrelay
//!
//! A reverse-tunnel HTTP relay for clients that have no inbound
//! connectivity.
//!
//! A client dials the relay, issues `CONNECT /_controlPath/` with its
//! `X-Identifier` header and, once upgraded, runs a stream multiplexer over
//! the connection. Public HTTP requests whose `Host` maps to that identifier
//! are then forwarded through a fresh tunnel stream per request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hostrelay::Server;
//!
//! # async fn example() -> hostrelay::Result<()> {
//! let mut server = Server::builder()
//!     .bind("0.0.0.0:8080".parse().unwrap())
//!     .host("foo.example.com", "abc123")
//!     .build()?;
//!
//! let addr = server.start().await?;
//! println!("relay listening on {addr}");
//! server.wait().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`hostrelay-common`] - Errors, configuration and defaults
//! - [`hostrelay-protocol`] - Multiplexer frames and control messages
//! - [`hostrelay-core`] - Sessions, registries and the tunnel handshake
//! - [`hostrelay-http`] - The HTTP listener and request relay

pub mod config;
pub mod server;

// Re-export subcrates
pub use hostrelay_common as common;
pub use hostrelay_protocol as protocol;

pub use config::ServerConfig;
pub use server::{Server, ServerBuilder};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::common::{LimitsConfig, MuxConfig, RelayConfig, Result, TunnelError};
    pub use crate::protocol::{ControlMessage, Frame, TunnelCodec};
    pub use crate::{Server, ServerBuilder, ServerConfig};
}

// Convenience re-exports at crate root
pub use common::{LimitsConfig, MuxConfig, RelayConfig, Result, TunnelError};
pub use protocol::{ControlMessage, Frame, TunnelCodec};
