//! `CONNECT` handling on the control path

use crate::{empty_body, text_response, BoxBody};
use hostrelay_core::TunnelAcceptor;
use hostrelay_protocol::constants::{CONNECTED_REASON, IDENTIFIER_HEADER};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

/// Answer a request to the control path.
///
/// A valid `CONNECT` gets `200 Connected` and its connection is handed to
/// the acceptor once hyper releases it. Failures before the upgrade are
/// answered in plain HTTP and the connection is never upgraded.
pub fn handle_connect(acceptor: &TunnelAcceptor, mut req: Request<Incoming>) -> Response<BoxBody> {
    if req.method() != Method::CONNECT {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "405 must CONNECT");
    }

    let identifier = req
        .headers()
        .get(IDENTIFIER_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    debug!(identifier = %identifier, "Tunnel connect request");

    let host = match acceptor.identify(&identifier) {
        Ok(host) => host,
        Err(e) => {
            warn!(identifier = %identifier, "Rejecting tunnel: {}", e);
            #[cfg(feature = "metrics")]
            if let Some(m) = hostrelay_observability::relay_metrics() {
                m.record_handshake(false);
            }
            return text_response(StatusCode::BAD_GATEWAY, &e.to_string());
        }
    };

    let permit = match acceptor.try_acquire_tunnel() {
        Ok(permit) => permit,
        Err(e) => {
            warn!(identifier = %identifier, "Rejecting tunnel: {}", e);
            return text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string());
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let acceptor = acceptor.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(identifier = %identifier, "Tunnel upgrade failed: {}", e);
                return;
            }
        };
        if let Err(e) = acceptor
            .establish(&identifier, &host, TokioIo::new(upgraded), permit)
            .await
        {
            debug!(identifier = %identifier, "Tunnel not established: {}", e);
        }
    });

    let mut response = Response::new(empty_body());
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(CONNECTED_REASON.as_bytes()));
    response
}
