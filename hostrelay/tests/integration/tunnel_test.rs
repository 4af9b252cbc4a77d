//! End-to-end relaying through a single tunnel

use super::{connect_ready, get, request, start_relay, wait_until, Answer, TunnelClient, WAIT};
use bytes::Bytes;
use hostrelay::RelayConfig;
use http_body_util::{BodyExt, Empty};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

const HOST: &str = "foo.example.com";
const IDENTIFIER: &str = "abc123";

#[tokio::test]
async fn test_request_relayed_through_tunnel() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let mut client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;
    assert!(wait_until(|| server.has_session(HOST) && server.has_control(IDENTIFIER)).await);

    let reply = get(addr, "foo.example.com:8080", "/path").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "hi");
    assert_eq!(reply.headers["x-echo-method"], "GET");
    assert_eq!(reply.headers["x-echo-path"], "/path");
    assert_eq!(reply.headers["x-echo-host"], "foo.example.com:8080");

    let message = client.next_message().await;
    assert_eq!(message["action"], "requestClientSession");
    assert_eq!(message["protocol"], "http");
    assert_eq!(message["localPort"], "8080");
    assert!(message["correlationId"].is_string());
}

#[tokio::test]
async fn test_request_body_and_query_forwarded() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let mut client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;

    let reply = request(addr, Method::POST, Some(HOST), "/submit?x=1", "payload").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "payload");
    assert_eq!(reply.headers["x-echo-method"], "POST");
    assert_eq!(reply.headers["x-echo-path"], "/submit?x=1");

    let message = client.next_message().await;
    assert_eq!(message["localPort"], "");
}

#[tokio::test]
async fn test_host_matching_ignores_case_and_port() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let mut client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;

    let reply = get(addr, "FOO.Example.COM:9000", "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(client.next_message().await["localPort"], "9000");
}

#[tokio::test]
async fn test_uncorrelated_mode_omits_correlation_id() {
    let config = RelayConfig {
        correlate_streams: false,
        ..RelayConfig::default()
    };
    let (server, addr) = start_relay(config, &[(HOST, IDENTIFIER)]).await;
    let mut client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;

    let reply = get(addr, HOST, "/plain").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "hi");

    let message = client.next_message().await;
    assert!(message.get("correlationId").is_none());
}

#[tokio::test]
async fn test_sequential_requests_reuse_tunnel() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let _client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;

    for i in 0..5 {
        let path = format!("/item/{i}");
        let reply = get(addr, HOST, &path).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers["x-echo-path"], path.as_str());
    }
}

#[tokio::test]
async fn test_client_disconnect_deregisters_tunnel() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;
    assert!(wait_until(|| server.has_session(HOST)).await);

    client.close();
    assert!(wait_until(|| !server.has_session(HOST) && !server.has_control(IDENTIFIER)).await);

    let reply = get(addr, HOST, "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert!(reply.body.contains("available for foo.example.com"));

    // The directory entry survives the tunnel
    assert_eq!(server.get_identifier(HOST).as_deref(), Some(IDENTIFIER));
}

#[tokio::test]
async fn test_reconnect_replaces_previous_tunnel() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let first = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;
    assert!(wait_until(|| server.has_session(HOST)).await);

    let _second = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;
    tokio::time::timeout(WAIT, first.session.closed())
        .await
        .expect("replaced tunnel should be closed");

    assert!(wait_until(|| server.has_session(HOST) && server.has_control(IDENTIFIER)).await);
    let reply = get(addr, HOST, "/after").await;
    assert_eq!(reply.status, StatusCode::OK);
}

#[tokio::test]
async fn test_hosts_managed_at_runtime() {
    let (server, addr) = start_relay(RelayConfig::default(), &[]).await;

    let rejected = TunnelClient::try_connect(addr, IDENTIFIER, Answer::Serve).await;
    assert!(matches!(rejected, Err((StatusCode::BAD_GATEWAY, _))));

    server.add_host(HOST, IDENTIFIER);
    let _client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;
    assert_eq!(get(addr, HOST, "/").await.status, StatusCode::OK);

    server.delete_host(HOST, "unused");
    let reply = get(addr, HOST, "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(reply.body, "no virtual host available for foo.example.com\n");
}

#[tokio::test]
async fn test_shutdown_closes_tunnels() {
    let (mut server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;
    assert!(wait_until(|| server.has_session(HOST)).await);

    server.shutdown().await.unwrap();
    tokio::time::timeout(WAIT, client.session.closed())
        .await
        .expect("client session should close on shutdown");
    assert!(!server.has_session(HOST));
}

#[tokio::test]
async fn test_status_and_headers_pass_through() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let _client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;

    let reply = get(addr, HOST, "/status/404").await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
    assert_eq!(reply.body, "status 404");

    let reply = get(addr, HOST, "/status/201").await;
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.headers["location"], "/elsewhere");
    let cookies: Vec<_> = reply
        .headers
        .get_all("set-cookie")
        .iter()
        .map(|v| v.to_str().unwrap())
        .collect();
    assert_eq!(cookies, ["a=1", "b=2"]);
}

#[tokio::test]
async fn test_head_response_has_no_body() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let _client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;

    let reply = request(addr, Method::HEAD, Some(HOST), "/page", "").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers["x-echo-method"], "HEAD");
    assert_eq!(reply.headers["content-length"], "2");
    assert_eq!(reply.body, "");

    // The tunnel keeps serving after a bodiless response
    let reply = get(addr, HOST, "/page").await;
    assert_eq!(reply.body, "hi");
}

#[tokio::test]
async fn test_body_failure_after_headers_truncates_response() {
    let (server, addr) = start_relay(RelayConfig::default(), &[(HOST, IDENTIFIER)]).await;
    let _client = connect_ready(&server, addr, IDENTIFIER, Answer::Serve).await;

    let tcp = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp))
        .await
        .unwrap();
    tokio::spawn(conn);
    let req = Request::builder()
        .uri("/truncated")
        .header("host", HOST)
        .body(Empty::<Bytes>::new())
        .unwrap();
    let res = tokio::time::timeout(WAIT, sender.send_request(req))
        .await
        .expect("response head")
        .unwrap();

    // Headers already went out, so the status stays as the service sent it
    assert_eq!(res.status(), StatusCode::OK);

    let mut body = res.into_body();
    let mut received = Vec::new();
    let failed = tokio::time::timeout(WAIT, async {
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        received.extend_from_slice(data);
                    }
                }
                Some(Err(_)) => return true,
                None => return false,
            }
        }
    })
    .await
    .expect("body should end");
    assert!(failed, "truncated body must not end cleanly");
    assert_eq!(received, b"partial");
}
