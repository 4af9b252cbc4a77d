use crate::host::is_control_path;
use crate::relay::RequestRelay;
use crate::upgrade::handle_connect;
use crate::BoxBody;
use hostrelay_common::Result;
use hostrelay_core::transport::socket_tuning::configure_socket_silent;
use hostrelay_core::{TunnelAcceptor, TunnelServer};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Bound on receiving a request head; never applies to upgraded tunnels
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// The relay's single HTTP listener
pub struct HttpIngress {
    acceptor: TunnelAcceptor,
    relay: RequestRelay,
    connection_semaphore: Arc<Semaphore>,
}

impl HttpIngress {
    pub fn new(server: TunnelServer) -> Self {
        let max_connections = server.config().limits.max_connections;
        Self {
            acceptor: server.acceptor(),
            relay: RequestRelay::new(server),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    pub async fn start(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until the task is dropped
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("HTTP ingress listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&self.connection_semaphore).try_acquire_owned() else {
                warn!(
                    "Max connections reached, rejecting connection from {}",
                    peer_addr
                );
                drop(stream);
                continue;
            };
            configure_socket_silent(&stream);

            let io = TokioIo::new(stream);
            let acceptor = self.acceptor.clone();
            let relay = self.relay.clone();

            tokio::spawn(async move {
                let _permit = permit;

                let service = service_fn(move |req| {
                    let acceptor = acceptor.clone();
                    let relay = relay.clone();
                    async move { Ok::<_, Infallible>(dispatch(&acceptor, &relay, req).await) }
                });

                if let Err(err) = http1::Builder::new()
                    .timer(TokioTimer::new())
                    .header_read_timeout(HEADER_READ_TIMEOUT)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Error serving connection from {}: {}", peer_addr, err);
                }
            });
        }
    }
}

async fn dispatch(
    acceptor: &TunnelAcceptor,
    relay: &RequestRelay,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    if is_control_path(req.uri().path()) {
        handle_connect(acceptor, req)
    } else {
        relay.handle(req).await
    }
}
