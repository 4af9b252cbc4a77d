#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for `hostrelay`
//!
//! Every test runs a real relay on an ephemeral port and drives it with
//! tunnel clients built from the same multiplexer in the dialing role.

mod concurrent_test;
mod error_test;
mod tunnel_test;

use bytes::Bytes;
use hostrelay::{RelayConfig, Server};
use hostrelay_common::config::MuxConfig;
use hostrelay_core::{Role, Session};
use hostrelay_protocol::constants::{
    CONTROL_PATH, HANDSHAKE_REQUEST, HANDSHAKE_RESPONSE, IDENTIFIER_HEADER,
};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, Incoming};
use hyper::header::{HOST, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

pub const WAIT: Duration = Duration::from_secs(5);

/// Start a relay on `127.0.0.1:0` with `hosts` pre-registered
pub async fn start_relay(config: RelayConfig, hosts: &[(&str, &str)]) -> (Server, SocketAddr) {
    let mut builder = Server::builder()
        .bind("127.0.0.1:0".parse().unwrap())
        .relay_config(config);
    for (host, identifier) in hosts {
        builder = builder.host(*host, *identifier);
    }
    let mut server = builder.build().unwrap();
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// Poll `check` until it holds or the wait expires
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Connect a tunnel client and wait until the relay has registered it
pub async fn connect_ready(
    server: &Server,
    addr: SocketAddr,
    identifier: &str,
    answer: Answer,
) -> TunnelClient {
    let client = TunnelClient::connect(addr, identifier, answer).await;
    let host = server.get_host(identifier).expect("identifier has a host");
    assert!(wait_until(|| server.has_control(identifier) && server.has_session(&host)).await);
    client
}

/// How a test client reacts to stream requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    /// Open the requested stream and serve HTTP on it
    Serve,
    /// Read control messages but never open a stream
    Ignore,
}

/// A tunnel client: the dialing side of a session plus a control reader
pub struct TunnelClient {
    session: Arc<Session>,
    messages: mpsc::UnboundedReceiver<serde_json::Value>,
}

impl TunnelClient {
    /// CONNECT to `addr` as `identifier`, complete the handshake and start
    /// answering control messages
    pub async fn connect(addr: SocketAddr, identifier: &str, answer: Answer) -> Self {
        Self::try_connect(addr, identifier, answer)
            .await
            .unwrap_or_else(|(status, body)| panic!("CONNECT rejected: {status} {body}"))
    }

    pub async fn try_connect(
        addr: SocketAddr,
        identifier: &str,
        answer: Answer,
    ) -> Result<Self, (StatusCode, String)> {
        let upgraded = upgrade(addr, identifier).await?;
        let session = Session::spawn(
            TokioIo::new(upgraded),
            "client",
            &MuxConfig::default(),
            Role::Dialer,
        );

        let mut control = session.open_stream(None).await.unwrap();
        control.write_all(HANDSHAKE_REQUEST).await.unwrap();
        let mut ack = [0u8; HANDSHAKE_RESPONSE.len()];
        tokio::time::timeout(WAIT, control.read_exact(&mut ack))
            .await
            .expect("handshake response")
            .unwrap();
        assert_eq!(&ack, HANDSHAKE_RESPONSE);

        let (messages_tx, messages) = mpsc::unbounded_channel();
        let tag = identifier.to_string();
        let client_session = Arc::clone(&session);
        tokio::spawn(async move {
            let mut lines = BufReader::new(control).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(message) = serde_json::from_str::<serde_json::Value>(&line) else {
                    break;
                };
                let correlation = message["correlationId"].as_str().map(str::to_string);
                let _ = messages_tx.send(message);
                if answer == Answer::Ignore {
                    continue;
                }
                let Ok(stream) = client_session.open_stream(correlation).await else {
                    break;
                };
                let tag = tag.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| echo(req, tag.clone()));
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Ok(Self { session, messages })
    }

    /// Next control message the relay sent
    pub async fn next_message(&mut self) -> serde_json::Value {
        tokio::time::timeout(WAIT, self.messages.recv())
            .await
            .expect("control message")
            .expect("control channel open")
    }

    pub fn close(&self) {
        self.session.close();
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// CONNECT to the control path and return the raw upgraded connection,
/// or the rejection status and body
pub async fn upgrade(addr: SocketAddr, identifier: &str) -> Result<Upgraded, (StatusCode, String)> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
        .await
        .unwrap();
    tokio::spawn(conn.with_upgrades());

    let req = Request::builder()
        .method(Method::CONNECT)
        .uri(CONTROL_PATH)
        .header(HOST, addr.to_string())
        .header(IDENTIFIER_HEADER, identifier)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = sender.send_request(req).await.unwrap();
    if res.status() != StatusCode::OK {
        let status = res.status();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        return Err((status, String::from_utf8_lossy(&body).into_owned()));
    }
    Ok(hyper::upgrade::on(res).await.unwrap())
}

type EchoBody = BoxBody<Bytes, io::Error>;

fn full(body: impl Into<Bytes>) -> EchoBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Yields one chunk, then fails after a pause
struct TruncatedBody {
    chunk: Option<Bytes>,
    pause: Pin<Box<tokio::time::Sleep>>,
}

impl Body for TruncatedBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        if let Some(chunk) = self.chunk.take() {
            return Poll::Ready(Some(Ok(Frame::data(chunk))));
        }
        ready!(self.pause.as_mut().poll(cx));
        Poll::Ready(Some(Err(io::Error::other("local service failed mid-body"))))
    }
}

/// The local service behind a tunnel.
///
/// Echoes the request body (or `hi` when empty) and reports what it saw in
/// `x-echo-*` headers. Paths under `/slow` answer after a delay,
/// `/status/<code>` answers with that status and extra headers, and
/// `/truncated` fails after the first body chunk.
async fn echo(req: Request<Incoming>, tag: String) -> Result<Response<EchoBody>, Infallible> {
    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if path.starts_with("/slow") {
        sleep(Duration::from_millis(300)).await;
    }

    let body = req.into_body().collect().await.unwrap().to_bytes();
    let body = if body.is_empty() {
        Bytes::from_static(b"hi")
    } else {
        body
    };

    let builder = Response::builder()
        .header("x-echo-method", method)
        .header("x-echo-host", host)
        .header("x-tunnel", tag);

    if let Some(code) = path.strip_prefix("/status/") {
        let status = StatusCode::from_bytes(code.as_bytes()).unwrap();
        let response = builder
            .status(status)
            .header("x-echo-path", path.as_str())
            .header(LOCATION, "/elsewhere")
            .header(SET_COOKIE, "a=1")
            .header(SET_COOKIE, "b=2")
            .body(full(format!("status {code}")))
            .unwrap();
        return Ok(response);
    }

    let body = if path == "/truncated" {
        TruncatedBody {
            chunk: Some(Bytes::from_static(b"partial")),
            pause: Box::pin(sleep(Duration::from_millis(100))),
        }
        .boxed()
    } else {
        full(body)
    };
    let response = builder.header("x-echo-path", path).body(body).unwrap();
    Ok(response)
}

/// A public response as seen by the requester
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// Send one public request to the relay; `host` of `None` omits the header
pub async fn request(
    addr: SocketAddr,
    method: Method,
    host: Option<&str>,
    path: &str,
    body: &str,
) -> Reply {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
        .await
        .unwrap();
    tokio::spawn(conn);

    let mut builder = Request::builder().method(method).uri(path);
    if let Some(host) = host {
        builder = builder.header(HOST, host);
    }
    let req = builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

    let res = tokio::time::timeout(Duration::from_secs(10), sender.send_request(req))
        .await
        .expect("relay response")
        .unwrap();
    let status = res.status();
    let headers = res.headers().clone();
    let body = res.into_body().collect().await.unwrap().to_bytes();
    Reply {
        status,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

/// GET `path` on `host` through the relay
pub async fn get(addr: SocketAddr, host: &str, path: &str) -> Reply {
    request(addr, Method::GET, Some(host), path, "").await
}

/// Write `raw` to the relay and read back the response head
pub async fn raw_exchange(addr: SocketAddr, raw: &[u8]) -> String {
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    tcp.write_all(raw).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    tokio::time::timeout(WAIT, async {
        while !head.ends_with(b"\r\n\r\n") {
            if tcp.read(&mut byte).await.unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
    })
    .await
    .expect("response head");
    String::from_utf8_lossy(&head).into_owned()
}
