//! Relaying public requests through tunnels

use crate::host::request_host;
use crate::{text_response, BoxBody};
use hostrelay_common::{Result, TunnelError};
use hostrelay_core::TunnelServer;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tracing::{debug, warn};

/// Forwards a public request over a fresh tunnel stream and streams the
/// response back.
#[derive(Debug, Clone)]
pub struct RequestRelay {
    server: TunnelServer,
    response_timeout: Duration,
}

impl RequestRelay {
    pub fn new(server: TunnelServer) -> Self {
        let response_timeout = server.config().response_timeout;
        Self {
            server,
            response_timeout,
        }
    }

    /// Relay `req`, turning every failure into a 502 carrying the error text
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody> {
        match self.relay(req).await {
            Ok(response) => {
                record_outcome("ok");
                response
            }
            Err(e) => {
                if e.is_directory_miss() {
                    debug!("Relay miss: {}", e);
                    record_outcome("directory_miss");
                } else if e.is_transport_failure() {
                    warn!("Tunnel unavailable: {}", e);
                    record_outcome("tunnel_down");
                } else {
                    warn!("Relay failed: {}", e);
                    record_outcome("error");
                }
                text_response(StatusCode::BAD_GATEWAY, &e.to_string())
            }
        }
    }

    pub async fn relay(&self, req: Request<Incoming>) -> Result<Response<BoxBody>> {
        let target = request_host(&req).ok_or(TunnelError::EmptyHost)?;
        let route = self.server.resolve(&target.host)?;
        let stream = route.open_stream(&target.port).await?;
        let stream_id = stream.id();

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TunnelError::Proxy(format!("tunnel handshake: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(stream_id, "Tunnel connection ended: {}", e);
            }
        });

        let response = tokio::time::timeout(self.response_timeout, sender.send_request(req))
            .await
            .map_err(|_| {
                TunnelError::Timeout(format!(
                    "no response from tunnel within {:?}",
                    self.response_timeout
                ))
            })?
            .map_err(|e| TunnelError::Proxy(format!("read from tunnel: {e}")))?;

        let (parts, body) = response.into_parts();
        let host = target.host;
        let body = body
            .map_err(move |e| {
                warn!(host = %host, "Response body copy failed: {}", e);
                e
            })
            .boxed();
        Ok(Response::from_parts(parts, body))
    }
}

fn record_outcome(outcome: &str) {
    #[cfg(feature = "metrics")]
    if let Some(m) = hostrelay_observability::relay_metrics() {
        m.record_relay(outcome);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}
