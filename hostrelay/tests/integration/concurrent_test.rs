//! Concurrent requests and independent tunnels

use super::{connect_ready, get, start_relay, Answer};
use hostrelay::RelayConfig;
use hyper::StatusCode;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_concurrent_requests_share_one_tunnel() {
    let (server, addr) = start_relay(RelayConfig::default(), &[("foo.example.com", "abc123")]).await;
    let _client = connect_ready(&server, addr, "abc123", Answer::Serve).await;

    let started = Instant::now();
    let handles: Vec<_> = (0..10)
        .map(|i| {
            tokio::spawn(async move {
                let path = format!("/slow/{i}");
                let reply = get(addr, "foo.example.com", &path).await;
                (path, reply)
            })
        })
        .collect();

    for handle in handles {
        let (path, reply) = handle.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers["x-echo-path"], path.as_str());
    }
    // Ten 300ms handlers finish well under their serial time
    assert!(started.elapsed() < Duration::from_millis(2500));
}

#[tokio::test]
async fn test_stalled_tunnel_does_not_block_other_hosts() {
    let mut config = RelayConfig::default();
    config.mux.stream_open_timeout = Some(Duration::from_secs(2));
    let (server, addr) = start_relay(
        config,
        &[("slow.example.com", "slow1"), ("fast.example.com", "fast1")],
    )
    .await;
    let _slow = connect_ready(&server, addr, "slow1", Answer::Ignore).await;
    let _fast = connect_ready(&server, addr, "fast1", Answer::Serve).await;

    let stalled = tokio::spawn(async move { get(addr, "slow.example.com", "/").await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let reply = get(addr, "fast.example.com", "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!stalled.is_finished());

    let stalled = stalled.await.unwrap();
    assert_eq!(stalled.status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_each_host_reaches_its_own_tunnel() {
    let hosts: Vec<(String, String)> = (0..5)
        .map(|i| (format!("app{i}.example.com"), format!("client{i}")))
        .collect();
    let pairs: Vec<(&str, &str)> = hosts
        .iter()
        .map(|(host, id)| (host.as_str(), id.as_str()))
        .collect();
    let (server, addr) = start_relay(RelayConfig::default(), &pairs).await;

    let mut clients = Vec::new();
    for (_, identifier) in &hosts {
        clients.push(connect_ready(&server, addr, identifier, Answer::Serve).await);
    }

    let handles: Vec<_> = hosts
        .iter()
        .cloned()
        .map(|(host, identifier)| {
            tokio::spawn(async move {
                let reply = get(addr, &host, "/").await;
                (identifier, reply)
            })
        })
        .collect();

    for handle in handles {
        let (identifier, reply) = handle.await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.headers["x-tunnel"], identifier.as_str());
    }
}
