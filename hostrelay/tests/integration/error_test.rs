//! Failure responses of the control path and the proxy path

use super::{
    connect_ready, get, raw_exchange, request, start_relay, upgrade, Answer, TunnelClient, WAIT,
};
use hostrelay::{LimitsConfig, RelayConfig};
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;

const HOST: &str = "foo.example.com";
const IDENTIFIER: &str = "abc123";

#[tokio::test]
async fn test_control_path_requires_connect() {
    let (_server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;

    let reply = request(addr, Method::GET, Some(HOST), "/_controlPath/", "").await;
    assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(reply.body, "405 must CONNECT\n");

    // Cleaned paths reach the control handler too
    let reply = request(addr, Method::POST, Some(HOST), "/_controlPath", "").await;
    assert_eq!(reply.status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_connect_acknowledged_with_connected_status_line() {
    let (_server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;

    let head = raw_exchange(
        addr,
        b"CONNECT /_controlPath/ HTTP/1.1\r\nHost: relay\r\nX-Identifier: abc123\r\n\r\n",
    )
    .await;
    assert!(head.starts_with("HTTP/1.1 200 Connected\r\n"), "{head}");
}

#[tokio::test]
async fn test_connect_with_unknown_identifier() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;

    let Err((status, body)) = TunnelClient::try_connect(addr, "nobody", Answer::Serve).await else {
        panic!("unknown identifier must be rejected");
    };
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, "no host associated for identifier nobody\n");
    assert!(!server.has_control("nobody"));
}

#[tokio::test]
async fn test_connect_without_identifier() {
    let (_server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;

    let head = raw_exchange(addr, b"CONNECT /_controlPath/ HTTP/1.1\r\nHost: relay\r\n\r\n").await;
    assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{head}");
}

#[tokio::test]
async fn test_unknown_host() {
    let (_server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;

    let reply = get(addr, "bar.example.com", "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.body, "no virtual host available for bar.example.com\n");
    assert_eq!(reply.headers["content-type"], "text/plain; charset=utf-8");
}

#[tokio::test]
async fn test_missing_host_header() {
    let (_server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;

    let reply = request(addr, Method::GET, None, "/path", "").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.body, "request host is empty\n");
}

#[tokio::test]
async fn test_registered_host_without_tunnel() {
    let (_server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;

    let reply = get(addr, HOST, "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.body, "no control channel available for foo.example.com\n");
}

#[tokio::test]
async fn test_silent_client_reported_unresponsive() {
    let mut config = RelayConfig::default();
    config.mux.stream_open_timeout = Some(Duration::from_millis(200));
    let (server, addr) = start_relay(config, &[(HOST, IDENTIFIER)]).await;
    let mut client = connect_ready(&server, addr, IDENTIFIER, Answer::Ignore).await;

    let reply = get(addr, HOST, "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert!(reply.body.contains("peer unresponsive"), "{}", reply.body);

    // The control message was delivered and the tunnel stays up
    assert_eq!(client.next_message().await["action"], "requestClientSession");
    assert!(server.has_session(HOST));
}

#[tokio::test]
async fn test_tunnel_limit_rejects_with_503() {
    let config = RelayConfig {
        limits: LimitsConfig {
            max_tunnels: 1,
            ..LimitsConfig::default()
        },
        ..RelayConfig::default()
    };
    let (server, addr) = start_relay(
        config,
        &[(HOST, IDENTIFIER), ("bar.example.com", "def456")],
    )
    .await;

    let _first = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;
    let Err((status, body)) = TunnelClient::try_connect(addr, "def456", Answer::Serve).await else {
        panic!("second tunnel must be rejected");
    };
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body.contains("limit exceeded"), "{body}");
}

#[tokio::test]
async fn test_stream_limit_rejects_excess_requests() {
    let mut config = RelayConfig {
        limits: LimitsConfig {
            max_streams_per_session: 1,
            ..LimitsConfig::default()
        },
        ..RelayConfig::default()
    };
    config.mux.stream_open_timeout = Some(Duration::from_secs(1));
    let (server, addr) = start_relay(config, &[(HOST, IDENTIFIER)]).await;
    let _client = connect_ready(&server, addr, IDENTIFIER, Answer::Ignore).await;

    let pending = tokio::spawn(async move { get(addr, HOST, "/first").await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let reply = get(addr, HOST, "/second").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert!(reply.body.contains("limit exceeded"), "{}", reply.body);

    let first = pending.await.unwrap();
    assert!(first.body.contains("peer unresponsive"), "{}", first.body);
}

#[tokio::test]
async fn test_silent_upgrade_times_out_and_frees_its_slot() {
    let config = RelayConfig {
        handshake_timeout: Duration::from_millis(200),
        limits: LimitsConfig {
            max_tunnels: 1,
            ..LimitsConfig::default()
        },
        ..RelayConfig::default()
    };
    let (server, addr) = start_relay(config, &[(HOST, IDENTIFIER)]).await;

    // Upgrade, then never open the handshake stream
    let mut silent = TokioIo::new(upgrade(addr, IDENTIFIER).await.unwrap());
    let mut buf = [0u8; 256];
    tokio::time::timeout(WAIT, async {
        while matches!(silent.read(&mut buf).await, Ok(n) if n > 0) {}
    })
    .await
    .expect("relay should hang up on a silent client");
    assert!(!server.has_control(IDENTIFIER));
    assert!(!server.has_session(HOST));

    // The only tunnel slot is free again
    let start = Instant::now();
    let _client = loop {
        match TunnelClient::try_connect(addr, IDENTIFIER, Answer::Serve).await {
            Ok(client) => break client,
            Err((StatusCode::SERVICE_UNAVAILABLE, _)) if start.elapsed() < WAIT => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err((status, body)) => panic!("reconnect rejected: {status} {body}"),
        }
    };
    assert!(super::wait_until(|| server.has_session(HOST)).await);
    assert_eq!(get(addr, HOST, "/").await.body, "hi");
}
