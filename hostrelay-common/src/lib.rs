//! Common utilities and types for `hostrelay`

pub mod config;
pub mod constants;
pub mod error;

pub use config::{LimitsConfig, MuxConfig, RelayConfig};
pub use constants::{DEFAULT_HTTP_BIND, DEFAULT_HTTP_PORT, DEFAULT_METRICS_BIND, DEFAULT_METRICS_PORT};
pub use error::{Result, TunnelError};
