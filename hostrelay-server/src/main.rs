//! hostrelay relay server
//!
//! Serves the control path and public traffic on one HTTP listener.

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::Parser;
use hostrelay::Server;
use hostrelay_common::config::{LimitsConfig, MuxConfig, RelayConfig};
use hostrelay_common::constants::{DEFAULT_HTTP_BIND, DEFAULT_METRICS_BIND};
use hostrelay_observability::{
    init_logging, init_metrics, init_tracing, metrics_router, shutdown_tracing, TracingConfig,
};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

/// Crates whose level `--debug` raises
const RELAY_TARGETS: &[&str] = &[
    "hostrelay",
    "hostrelay_server",
    "hostrelay_core",
    "hostrelay_http",
    "hostrelay_protocol",
];

#[derive(Parser, Debug)]
#[allow(clippy::struct_excessive_bools)]
#[command(
    name = "hostrelay-server",
    author,
    version,
    about = "Reverse-tunnel HTTP relay",
    long_about = "Relays public HTTP requests to clients that connected out to this server.\n\n\
                  Clients CONNECT to /_controlPath/ with an X-Identifier header; requests whose \
                  Host is registered for that identifier are forwarded through the tunnel."
)]
struct Args {
    /// Address of the HTTP listener (control path and public traffic)
    #[arg(long, default_value = DEFAULT_HTTP_BIND, env = "HOSTRELAY_BIND")]
    bind: SocketAddr,

    /// Virtual host mapping `<host>=<identifier>`; repeatable
    #[arg(
        long = "host",
        value_name = "HOST=IDENTIFIER",
        value_parser = parse_host_mapping,
        env = "HOSTRELAY_HOSTS",
        value_delimiter = ','
    )]
    hosts: Vec<(String, String)>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info", env = "HOSTRELAY_LOG_LEVEL")]
    log_level: String,

    /// Log relay internals at debug level
    #[arg(long, env = "HOSTRELAY_DEBUG")]
    debug: bool,

    /// Emit logs as JSON
    #[arg(long, env = "HOSTRELAY_LOG_JSON")]
    json_logs: bool,

    /// Maximum multiplexer frame size in bytes
    #[arg(long, default_value_t = 16 * 1024 * 1024, env = "HOSTRELAY_MAX_FRAME_SIZE")]
    max_frame_size: usize,

    /// Seconds between tunnel heartbeats (0 disables keepalive)
    #[arg(long, default_value_t = 30, env = "HOSTRELAY_KEEPALIVE_SECS")]
    keepalive_secs: u64,

    /// Client-opened streams that may wait unaccepted per tunnel
    #[arg(long, default_value_t = 256, env = "HOSTRELAY_ACCEPT_BACKLOG")]
    accept_backlog: usize,

    /// Per-stream receive window in frames (at least 16)
    #[arg(long, default_value_t = 64, env = "HOSTRELAY_STREAM_WINDOW")]
    stream_window: usize,

    /// Seconds to wait for a client to open a requested stream (0 waits forever)
    #[arg(long, default_value_t = 30, env = "HOSTRELAY_STREAM_OPEN_TIMEOUT_SECS")]
    stream_open_timeout_secs: u64,

    /// Seconds to wait for the handshake stream after CONNECT
    #[arg(long, default_value_t = 10, env = "HOSTRELAY_HANDSHAKE_TIMEOUT_SECS")]
    handshake_timeout_secs: u64,

    /// Seconds to wait for response headers from a tunnel
    #[arg(long, default_value_t = 60, env = "HOSTRELAY_RESPONSE_TIMEOUT_SECS")]
    response_timeout_secs: u64,

    /// Do not tag stream requests with correlation ids
    #[arg(long, env = "HOSTRELAY_NO_CORRELATION")]
    no_correlation: bool,

    /// Maximum concurrent tunnels
    #[arg(long, default_value_t = 1000, env = "HOSTRELAY_MAX_TUNNELS")]
    max_tunnels: usize,

    /// Maximum concurrent relayed requests per tunnel
    #[arg(long, default_value_t = 1000, env = "HOSTRELAY_MAX_STREAMS_PER_TUNNEL")]
    max_streams_per_tunnel: usize,

    /// Maximum X-Identifier length in bytes
    #[arg(long, default_value_t = 256, env = "HOSTRELAY_MAX_IDENTIFIER_LEN")]
    max_identifier_len: usize,

    /// Maximum concurrent public connections
    #[arg(long, default_value_t = 10_000, env = "HOSTRELAY_MAX_CONNECTIONS")]
    max_connections: usize,

    /// Enable the Prometheus endpoint
    #[arg(long, env = "HOSTRELAY_METRICS")]
    metrics: bool,

    /// Metrics bind address
    #[arg(long, default_value = DEFAULT_METRICS_BIND, env = "HOSTRELAY_METRICS_BIND")]
    metrics_bind: SocketAddr,

    /// Export spans over OTLP (endpoint from OTEL_EXPORTER_OTLP_ENDPOINT)
    #[arg(long, env = "HOSTRELAY_OBSERVABILITY")]
    observability: bool,
}

impl Args {
    fn log_filter(&self) -> String {
        if self.debug {
            let raised: Vec<String> = RELAY_TARGETS
                .iter()
                .map(|target| format!("{target}=debug"))
                .collect();
            format!("{},{}", self.log_level, raised.join(","))
        } else {
            self.log_level.clone()
        }
    }

    fn relay_config(&self) -> RelayConfig {
        let seconds = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));
        RelayConfig {
            mux: MuxConfig {
                max_frame_size: self.max_frame_size,
                keepalive_interval: seconds(self.keepalive_secs),
                accept_backlog: self.accept_backlog,
                stream_open_timeout: seconds(self.stream_open_timeout_secs),
                stream_window: self.stream_window,
            },
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            response_timeout: Duration::from_secs(self.response_timeout_secs),
            correlate_streams: !self.no_correlation,
            limits: LimitsConfig {
                max_tunnels: self.max_tunnels,
                max_streams_per_session: self.max_streams_per_tunnel,
                max_identifier_len: self.max_identifier_len,
                max_connections: self.max_connections,
            },
        }
    }
}

fn parse_host_mapping(raw: &str) -> Result<(String, String), String> {
    let (host, identifier) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected HOST=IDENTIFIER, got '{raw}'"))?;
    let (host, identifier) = (host.trim(), identifier.trim());
    if host.is_empty() || identifier.is_empty() {
        return Err(format!("host and identifier must be non-empty in '{raw}'"));
    }
    Ok((host.to_string(), identifier.to_string()))
}

fn spawn_metrics_endpoint(addr: SocketAddr) {
    tokio::spawn(async move {
        let app = metrics_router().route("/health/ready", axum::routing::get(|| async { "OK" }));
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("Metrics server listening on http://{}", addr);
                if let Err(e) = axum::serve(listener, app).await {
                    error!("Metrics server error: {}", e);
                }
            }
            Err(e) => error!("Failed to bind metrics server to {}: {}", addr, e),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.observability {
        init_tracing(TracingConfig {
            service_name: "hostrelay-server".to_string(),
            default_filter: args.log_filter(),
            json: args.json_logs,
            ..TracingConfig::default()
        })?;
    } else {
        init_logging(&args.log_filter(), args.json_logs);
    }

    if args.metrics {
        init_metrics().context("registering metrics")?;
        spawn_metrics_endpoint(args.metrics_bind);
    }

    info!("Starting hostrelay server v{}", env!("CARGO_PKG_VERSION"));

    let mut builder = Server::builder()
        .bind(args.bind)
        .relay_config(args.relay_config());
    for (host, identifier) in &args.hosts {
        builder = builder.host(host, identifier);
    }
    let mut server = builder.build().context("invalid relay configuration")?;
    server.start().await.context("starting listener")?;

    tokio::select! {
        result = server.wait() => result?,
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received Ctrl-C, shutting down");
            server.shutdown().await?;
        }
    }

    if args.observability {
        shutdown_tracing();
    }
    Ok(())
}
