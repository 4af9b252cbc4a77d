//! Transport helpers shared by the relay's sessions and ingress listeners

use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod batched_sender;
pub mod socket_tuning;

/// Anything a session can run over: a raw TCP stream, an upgraded HTTP
/// connection, or an in-memory duplex in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;
