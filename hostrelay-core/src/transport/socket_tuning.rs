//! Socket tuning for accepted ingress connections
//!
//! - `TCP_NODELAY`: relayed requests are small and latency bound
//! - Larger buffers for streamed response bodies
//! - TCP keepalive so half-dead tunnel carriers are noticed by the kernel too

use socket2::SockRef;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;

const RECV_BUFFER_SIZE: usize = 512 * 1024;
const SEND_BUFFER_SIZE: usize = 512 * 1024;
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

pub fn configure_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let socket = SockRef::from(stream);
    socket.set_recv_buffer_size(RECV_BUFFER_SIZE)?;
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

/// Apply tuning, logging instead of failing; a connection that cannot be
/// tuned is still served.
pub fn configure_socket_silent(stream: &TcpStream) {
    if let Err(e) = configure_socket(stream) {
        tracing::debug!("Socket tuning skipped: {}", e);
    }
}
