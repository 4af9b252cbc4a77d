//! Default ports and addresses for hostrelay services.

/// Default port for the relay listener (control path and public traffic share it).
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Default port for the metrics endpoint.
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Default bind address for the relay listener (`0.0.0.0:8080`).
pub const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";

/// Default bind address for the metrics endpoint (`0.0.0.0:9090`).
pub const DEFAULT_METRICS_BIND: &str = "0.0.0.0:9090";
