//! Turns upgraded connections into registered tunnels

use crate::auth::{constant_time_eq, validate_identifier};
use crate::resource_limits::{ServerResourceLimits, TunnelPermit};
use crate::stream::VirtualStream;
use crate::transport::AsyncStream;
use crate::tunnel::control::{ControlChannel, ControlRegistry};
use crate::tunnel::directory::HostDirectory;
use crate::tunnel::session::{Role, Session, SessionRegistry};
use hostrelay_common::config::RelayConfig;
use hostrelay_common::{Result, TunnelError};
use hostrelay_protocol::constants::{HANDSHAKE_REQUEST, HANDSHAKE_RESPONSE};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Completes the tunnel handshake and installs the resulting session and
/// control channel.
///
/// The sequence for one connection is: [`identify`](Self::identify) while
/// the CONNECT request is still plain HTTP, then
/// [`establish`](Self::establish) on the upgraded byte stream. The first
/// stream the client opens carries the handshake token exchange and then
/// becomes the control channel.
#[derive(Debug, Clone)]
pub struct TunnelAcceptor {
    directory: Arc<HostDirectory>,
    controls: Arc<ControlRegistry>,
    sessions: Arc<SessionRegistry>,
    config: Arc<RelayConfig>,
    limits: ServerResourceLimits,
}

impl TunnelAcceptor {
    pub(crate) fn new(
        directory: Arc<HostDirectory>,
        controls: Arc<ControlRegistry>,
        sessions: Arc<SessionRegistry>,
        config: Arc<RelayConfig>,
        limits: ServerResourceLimits,
    ) -> Self {
        Self {
            directory,
            controls,
            sessions,
            config,
            limits,
        }
    }

    /// Resolve the host registered for `identifier`.
    pub fn identify(&self, identifier: &str) -> Result<String> {
        validate_identifier(identifier, self.config.limits.max_identifier_len)?;
        self.directory
            .get_host(identifier)
            .ok_or_else(|| TunnelError::UnknownIdentifier(identifier.to_string()))
    }

    /// Reserve a tunnel slot; held for the lifetime of the session
    pub fn try_acquire_tunnel(&self) -> Result<TunnelPermit> {
        Ok(self.limits.try_acquire_tunnel()?)
    }

    /// Run the multiplexer over `io`, exchange handshake tokens and register
    /// the tunnel. On failure nothing is registered and the connection is
    /// closed.
    pub async fn establish<T>(
        &self,
        identifier: &str,
        host: &str,
        io: T,
        permit: TunnelPermit,
    ) -> Result<Arc<ControlChannel>>
    where
        T: AsyncStream + 'static,
    {
        let session = Session::spawn_with_limits(
            io,
            host,
            &self.config.mux,
            Role::Listener,
            self.limits.create_stream_limits(),
        );

        let stream = match self.handshake(&session).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(identifier, host, "Tunnel handshake failed: {}", e);
                session.close();
                #[cfg(feature = "metrics")]
                if let Some(m) = hostrelay_observability::relay_metrics() {
                    m.record_handshake(false);
                }
                return Err(e);
            }
        };

        session.stop_accepting();
        self.register_session(host, &session, permit);
        let control = self.register_control(identifier, stream);

        #[cfg(feature = "metrics")]
        if let Some(m) = hostrelay_observability::relay_metrics() {
            m.record_handshake(true);
        }
        info!(identifier, host, "Tunnel established");
        Ok(control)
    }

    async fn handshake(&self, session: &Session) -> Result<VirtualStream> {
        let limit = self.config.handshake_timeout;
        let exchange = async {
            let mut stream = session.accept(None).await?;

            let mut token = [0u8; HANDSHAKE_REQUEST.len()];
            stream
                .read_exact(&mut token)
                .await
                .map_err(|e| TunnelError::Handshake(format!("reading token: {e}")))?;
            if !constant_time_eq(&token, HANDSHAKE_REQUEST) {
                return Err(TunnelError::Handshake("unexpected handshake token".into()));
            }

            stream.write_all(HANDSHAKE_RESPONSE).await?;
            stream.flush().await?;
            Ok(stream)
        };

        tokio::time::timeout(limit, exchange)
            .await
            .map_err(|_| TunnelError::PeerUnresponsive(limit))?
    }

    fn register_session(&self, host: &str, session: &Arc<Session>, permit: TunnelPermit) {
        if let Some(previous) = self.sessions.add(host, Arc::clone(session)) {
            info!(host, "Replacing existing session");
            previous.close();
        }

        let sessions = Arc::clone(&self.sessions);
        let session = Arc::clone(session);
        let host = host.to_string();
        tokio::spawn(async move {
            let _permit = permit;
            #[cfg(feature = "metrics")]
            if let Some(m) = hostrelay_observability::relay_metrics() {
                m.active_sessions.inc();
            }

            session.closed().await;
            if sessions.remove_if_same(&host, &session) {
                debug!(host = %host, "Session deregistered");
            }

            #[cfg(feature = "metrics")]
            if let Some(m) = hostrelay_observability::relay_metrics() {
                m.active_sessions.dec();
            }
        });
    }

    fn register_control(&self, identifier: &str, stream: VirtualStream) -> Arc<ControlChannel> {
        let control = ControlChannel::spawn(identifier, stream);
        if let Some(previous) = self.controls.add(identifier, Arc::clone(&control)) {
            info!(identifier, "Replacing existing control channel");
            previous.close();
        }

        let controls = Arc::clone(&self.controls);
        let watched = Arc::clone(&control);
        tokio::spawn(async move {
            #[cfg(feature = "metrics")]
            if let Some(m) = hostrelay_observability::relay_metrics() {
                m.active_controls.inc();
            }

            watched.closed().await;
            if controls.remove_if_same(watched.identifier(), &watched) {
                debug!(identifier = %watched.identifier(), "Control channel deregistered");
            }

            #[cfg(feature = "metrics")]
            if let Some(m) = hostrelay_observability::relay_metrics() {
                m.active_controls.dec();
            }
        });

        control
    }
}
