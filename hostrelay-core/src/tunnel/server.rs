//! Relay state shared by the ingress handlers

use crate::resource_limits::{ServerResourceLimits, StreamPermit};
use crate::stream::VirtualStream;
use crate::tunnel::acceptor::TunnelAcceptor;
use crate::tunnel::control::{ControlChannel, ControlRegistry};
use crate::tunnel::directory::HostDirectory;
use crate::tunnel::session::{Session, SessionRegistry};
use hostrelay_common::config::RelayConfig;
use hostrelay_common::{Result, TunnelError};
use hostrelay_protocol::ControlMessage;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info};

/// The relay's routing state: host directory, control channels and
/// sessions, each behind its own lock.
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct TunnelServer {
    directory: Arc<HostDirectory>,
    controls: Arc<ControlRegistry>,
    sessions: Arc<SessionRegistry>,
    config: Arc<RelayConfig>,
    limits: ServerResourceLimits,
}

impl TunnelServer {
    pub fn new(config: RelayConfig) -> Result<Self> {
        config.validate()?;
        let limits = ServerResourceLimits::from_config(&config.limits);
        Ok(Self {
            directory: Arc::new(HostDirectory::new()),
            controls: Arc::new(ControlRegistry::new()),
            sessions: Arc::new(SessionRegistry::new()),
            config: Arc::new(config),
            limits,
        })
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn acceptor(&self) -> TunnelAcceptor {
        TunnelAcceptor::new(
            Arc::clone(&self.directory),
            Arc::clone(&self.controls),
            Arc::clone(&self.sessions),
            Arc::clone(&self.config),
            self.limits.clone(),
        )
    }

    /// Make `host` reachable through the tunnel registered as `identifier`
    pub fn add_host(&self, host: &str, identifier: &str) {
        self.directory.add_host(host, identifier);
    }

    /// Remove `host` and its identifier mapping. The identifier argument is
    /// accepted for symmetry with [`add_host`](Self::add_host) and ignored.
    pub fn delete_host(&self, host: &str, _identifier: &str) {
        self.directory.delete_host(host);
    }

    pub fn get_identifier(&self, host: &str) -> Option<String> {
        self.directory.get_identifier(host)
    }

    pub fn get_host(&self, identifier: &str) -> Option<String> {
        self.directory.get_host(identifier)
    }

    /// Whether a live control channel is registered for `identifier`
    pub fn has_control(&self, identifier: &str) -> bool {
        self.controls
            .get(identifier)
            .is_some_and(|control| !control.is_closed())
    }

    /// Whether a live session is registered for `host`
    pub fn has_session(&self, host: &str) -> bool {
        self.sessions
            .get(host)
            .is_some_and(|session| !session.is_closed())
    }

    /// Look up everything needed to relay a request for `host`
    pub fn resolve(&self, host: &str) -> Result<Route> {
        if host.is_empty() {
            return Err(TunnelError::EmptyHost);
        }
        let identifier = self
            .directory
            .get_identifier(host)
            .ok_or_else(|| TunnelError::NoVirtualHost(host.to_string()))?;
        let control = self
            .controls
            .get(&identifier)
            .ok_or_else(|| TunnelError::NoControlChannel(host.to_string()))?;
        let session = self
            .sessions
            .get(host)
            .ok_or_else(|| TunnelError::NoSession(host.to_string()))?;

        Ok(Route {
            host: host.to_string(),
            identifier,
            control,
            session,
            correlate: self.config.correlate_streams,
            stream_open_timeout: self.config.mux.stream_open_timeout,
        })
    }

    /// Close every registered tunnel
    pub fn close_all(&self) {
        let controls = self.controls.all();
        let sessions = self.sessions.all();
        info!(
            controls = controls.len(),
            sessions = sessions.len(),
            "Closing all tunnels"
        );
        for control in controls {
            control.close();
        }
        for session in sessions {
            session.close();
        }
    }
}

/// A resolved host: its identifier, control channel and session
#[derive(Debug, Clone)]
pub struct Route {
    host: String,
    identifier: String,
    control: Arc<ControlChannel>,
    session: Arc<Session>,
    correlate: bool,
    stream_open_timeout: Option<std::time::Duration>,
}

impl Route {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Ask the client for a fresh stream and wait until it arrives.
    ///
    /// `local_port` is forwarded verbatim in the control message.
    pub async fn open_stream(&self, local_port: &str) -> Result<RelayStream> {
        let permit = self.session.try_acquire_stream()?;
        let pending = self.session.expect_stream()?;

        let mut message = ControlMessage::request_client_session(local_port);
        if self.correlate {
            message = message.with_correlation_id(pending.token());
        }

        #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
        let started = std::time::Instant::now();
        self.control.send(&message).await?;
        let stream = pending.wait(self.stream_open_timeout).await?;

        #[cfg(feature = "metrics")]
        if let Some(m) = hostrelay_observability::relay_metrics() {
            m.observe_stream_open(started.elapsed());
        }
        debug!(host = %self.host, stream_id = stream.id(), "Relay stream opened");

        Ok(RelayStream {
            stream,
            _permit: permit,
        })
    }
}

/// A stream opened by the client for one relayed request.
///
/// Holds the session's stream slot until dropped.
#[derive(Debug)]
pub struct RelayStream {
    stream: VirtualStream,
    _permit: StreamPermit,
}

impl RelayStream {
    pub fn id(&self) -> u32 {
        self.stream.id()
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
