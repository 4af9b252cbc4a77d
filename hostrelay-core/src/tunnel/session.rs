//! Multiplexed tunnel sessions
//!
//! A [`Session`] owns one upgraded connection and runs the multiplexer over
//! it. The relay side listens for streams the client opens; the client side
//! (and the test harness) dials them.

use crate::resource_limits::{ResourceLimitError, StreamLimits, StreamPermit};
use crate::stream::{Multiplexer, VirtualStream};
use crate::transport::batched_sender::run_batched_sender;
use crate::transport::AsyncStream;
use futures::StreamExt;
use hostrelay_common::config::{LimitsConfig, MuxConfig};
use hostrelay_common::{Result, TunnelError};
use hostrelay_protocol::codec::TunnelCodec;
use hostrelay_protocol::constants::MAX_CORRELATION_LEN;
use hostrelay_protocol::validation::{validate_frame, ValidationLimits};
use hostrelay_protocol::Frame;
use kanal::{bounded_async, AsyncReceiver, AsyncSender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::ReadHalf;
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Frames queued for the socket writer across all streams of a session
const FRAME_QUEUE_CAPACITY: usize = 1024;

/// Missed heartbeats tolerated before the peer is declared dead
const IDLE_HEARTBEATS: u32 = 3;

/// Which end of the upgraded connection this session runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the connection (the tunnel client)
    Dialer,
    /// Accepted the connection (the relay)
    Listener,
}

impl Role {
    fn is_dialer(self) -> bool {
        matches!(self, Role::Dialer)
    }

    /// Parity of stream ids the peer allocates
    fn peer_parity(self) -> u32 {
        match self {
            Role::Dialer => 0,
            Role::Listener => 1,
        }
    }
}

struct Waiter {
    token: String,
    tx: oneshot::Sender<VirtualStream>,
}

/// One multiplexed connection with a tunnel client
pub struct Session {
    host: String,
    role: Role,
    mux: Multiplexer,
    frame_tx: AsyncSender<Frame>,
    accept_tx: AsyncSender<VirtualStream>,
    accept_rx: AsyncReceiver<VirtualStream>,
    waiters: Mutex<VecDeque<Waiter>>,
    /// Unclaimed peer streams are queued for `accept` while set
    accepting: AtomicBool,
    stream_limits: StreamLimits,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("role", &self.role)
            .field("active_streams", &self.mux.active_streams())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session over `io` with the default per-session stream limit.
    pub fn spawn<T>(io: T, host: impl Into<String>, config: &MuxConfig, role: Role) -> Arc<Self>
    where
        T: AsyncStream + 'static,
    {
        let limits = StreamLimits::new(LimitsConfig::default().max_streams_per_session);
        Self::spawn_with_limits(io, host, config, role, limits)
    }

    /// Start a session over `io`: one task writes frames, one reads and
    /// dispatches them, and one sends heartbeats when keepalive is enabled.
    pub fn spawn_with_limits<T>(
        io: T,
        host: impl Into<String>,
        config: &MuxConfig,
        role: Role,
        stream_limits: StreamLimits,
    ) -> Arc<Self>
    where
        T: AsyncStream + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let codec = TunnelCodec::with_max_frame_size(config.max_frame_size);
        let (frame_tx, frame_rx) = bounded_async::<Frame>(FRAME_QUEUE_CAPACITY);
        let (accept_tx, accept_rx) = bounded_async::<VirtualStream>(config.accept_backlog);
        let cancel = CancellationToken::new();

        let session = Arc::new(Self {
            host: host.into(),
            role,
            mux: Multiplexer::new(frame_tx.clone(), role.is_dialer(), config),
            frame_tx: frame_tx.clone(),
            accept_tx,
            accept_rx,
            waiters: Mutex::new(VecDeque::new()),
            accepting: AtomicBool::new(true),
            stream_limits,
            cancel: cancel.clone(),
            closed: AtomicBool::new(false),
        });

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            run_batched_sender(frame_rx, write_half, codec).await;
            writer_cancel.cancel();
        });

        if let Some(interval) = config.keepalive_interval {
            tokio::spawn(run_keepalive(frame_tx, cancel, interval));
        }

        let idle_timeout = config.keepalive_interval.map(|i| i * IDLE_HEARTBEATS);
        let reader = FramedRead::new(read_half, codec);
        tokio::spawn(Arc::clone(&session).read_loop(reader, idle_timeout, config.max_frame_size));

        debug!(host = %session.host, ?role, "Session started");
        session
    }

    async fn read_loop<T>(
        self: Arc<Self>,
        mut reader: FramedRead<ReadHalf<T>, TunnelCodec>,
        idle_timeout: Option<Duration>,
        max_frame_size: usize,
    ) where
        T: AsyncStream,
    {
        let limits = ValidationLimits {
            max_correlation_len: MAX_CORRELATION_LEN,
            max_payload_bytes: max_frame_size,
        };
        let peer_parity = self.role.peer_parity();

        loop {
            let next = async {
                match idle_timeout {
                    Some(limit) => tokio::time::timeout(limit, reader.next()).await.ok(),
                    None => Some(reader.next().await),
                }
            };
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break,
                next = next => next,
            };
            let frame = match frame {
                None => {
                    warn!(host = %self.host, "Session idle for too long, closing");
                    break;
                }
                Some(None) => {
                    debug!(host = %self.host, "Session closed by peer");
                    break;
                }
                Some(Some(Err(e))) => {
                    warn!(host = %self.host, "Session read error: {}", e);
                    break;
                }
                Some(Some(Ok(frame))) => frame,
            };

            if let Err(e) = validate_frame(&frame, peer_parity, &limits) {
                warn!(host = %self.host, "Invalid frame from peer: {}", e);
                break;
            }

            match frame {
                Frame::Heartbeat { timestamp } => {
                    if self.frame_tx.send(Frame::HeartbeatAck { timestamp }).await.is_err() {
                        break;
                    }
                }
                Frame::HeartbeatAck { .. } => trace!(host = %self.host, "Heartbeat acknowledged"),
                frame => match self.mux.process_frame(frame) {
                    Ok(Some(stream)) => self.route_stream(stream),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(host = %self.host, "Failed to dispatch frame: {}", e);
                        break;
                    }
                },
            }
        }

        self.close();
    }

    /// Hand a peer-opened stream to whoever is waiting for it.
    ///
    /// Correlated streams go to the waiter holding the same token and are
    /// dropped when that waiter is gone. Uncorrelated streams go to the
    /// oldest live waiter, or to the accept queue when nobody waits and the
    /// session still accepts. Anything else is closed.
    fn route_stream(&self, mut stream: VirtualStream) {
        {
            let mut waiters = self.waiters.lock();
            if let Some(token) = stream.correlation() {
                match waiters.iter().position(|w| w.token == token) {
                    Some(pos) => {
                        if let Some(waiter) = waiters.remove(pos) {
                            let _ = waiter.tx.send(stream);
                        }
                    }
                    None => debug!(
                        host = %self.host,
                        stream_id = stream.id(),
                        "No waiter for correlated stream, dropping"
                    ),
                }
                return;
            }

            while let Some(waiter) = waiters.pop_front() {
                match waiter.tx.send(stream) {
                    Ok(()) => return,
                    Err(returned) => stream = returned,
                }
            }
        }

        let stream_id = stream.id();
        if !self.accepting.load(Ordering::Acquire) {
            debug!(host = %self.host, stream_id, "No waiter for stream, closing");
            return;
        }
        match self.accept_tx.try_send(stream) {
            Ok(true) => trace!(host = %self.host, stream_id, "Stream queued for accept"),
            _ => warn!(host = %self.host, stream_id, "Accept backlog full, rejecting stream"),
        }
    }

    /// Wait for the next peer-opened stream nobody was expecting.
    ///
    /// `None` waits until the session closes.
    pub async fn accept(&self, limit: Option<Duration>) -> Result<VirtualStream> {
        let next = async {
            tokio::select! {
                biased;
                stream = self.accept_rx.recv() => stream.map_err(|_| TunnelError::SessionClosed),
                () = self.cancel.cancelled() => Err(TunnelError::SessionClosed),
            }
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| TunnelError::Timeout(format!("no stream accepted within {limit:?}")))?,
            None => next.await,
        }
    }

    /// Stop queueing unclaimed peer streams and close the ones already
    /// queued. From here on a stream reaches this side only through
    /// [`Session::expect_stream`].
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
        while let Ok(Some(stream)) = self.accept_rx.try_recv() {
            debug!(host = %self.host, stream_id = stream.id(), "Closing unclaimed stream");
        }
    }

    /// Register interest in the next stream the peer opens.
    ///
    /// The returned guard carries a token to forward to the peer; a stream
    /// opened with that token is delivered to this guard only.
    pub fn expect_stream(&self) -> Result<PendingStream<'_>> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        let token = Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().push_back(Waiter {
            token: token.clone(),
            tx,
        });
        Ok(PendingStream {
            session: self,
            token,
            rx,
        })
    }

    /// Open a stream towards the peer
    pub async fn open_stream(&self, correlation: Option<String>) -> Result<VirtualStream> {
        if self.is_closed() {
            return Err(TunnelError::SessionClosed);
        }
        self.mux.open_stream(correlation).await
    }

    pub fn try_acquire_stream(&self) -> std::result::Result<StreamPermit, ResourceLimitError> {
        self.stream_limits.try_acquire_stream()
    }

    /// Tear the session down. Open streams read EOF, pending waits fail
    /// with [`TunnelError::SessionClosed`]. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.mux.close_all();
        self.waiters.lock().clear();
        self.accept_rx.close();
        self.frame_tx.close();
        info!(host = %self.host, role = ?self.role, "Session closed");
    }

    /// Resolves once the session has closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn active_streams(&self) -> usize {
        self.mux.active_streams()
    }

    #[cfg(test)]
    fn pending_waiters(&self) -> usize {
        self.waiters.lock().len()
    }
}

async fn run_keepalive(frame_tx: AsyncSender<Frame>, cancel: CancellationToken, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                #[allow(clippy::cast_possible_truncation)]
                let timestamp = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                if frame_tx.send(Frame::Heartbeat { timestamp }).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// A registered wait for a peer-opened stream; unregisters on drop
pub struct PendingStream<'a> {
    session: &'a Session,
    token: String,
    rx: oneshot::Receiver<VirtualStream>,
}

impl PendingStream<'_> {
    /// Token the peer should echo when opening the stream
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the stream. `None` waits until the session closes.
    pub async fn wait(mut self, limit: Option<Duration>) -> Result<VirtualStream> {
        let session = self.session;
        let rx = &mut self.rx;
        let next = async {
            tokio::select! {
                biased;
                stream = rx => stream.map_err(|_| TunnelError::SessionClosed),
                () = session.cancel.cancelled() => Err(TunnelError::SessionClosed),
            }
        };
        match limit {
            Some(limit) => tokio::time::timeout(limit, next)
                .await
                .map_err(|_| TunnelError::PeerUnresponsive(limit))?,
            None => next.await,
        }
    }
}

impl Drop for PendingStream<'_> {
    fn drop(&mut self) {
        self.session.waiters.lock().retain(|w| w.token != self.token);
    }
}

/// Sessions keyed by the host they serve
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under `host`, returning the session it replaced
    pub fn add(&self, host: &str, session: Arc<Session>) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .insert(host.to_ascii_lowercase(), session)
    }

    pub fn get(&self, host: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(&host.to_ascii_lowercase()).cloned()
    }

    pub fn delete(&self, host: &str) -> Option<Arc<Session>> {
        self.sessions.lock().remove(&host.to_ascii_lowercase())
    }

    /// Remove `host` only while it still maps to this exact session
    pub fn remove_if_same(&self, host: &str, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.lock();
        let key = host.to_ascii_lowercase();
        if sessions.get(&key).is_some_and(|current| Arc::ptr_eq(current, session)) {
            sessions.remove(&key);
            return true;
        }
        false
    }

    /// Snapshot of every registered session
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
