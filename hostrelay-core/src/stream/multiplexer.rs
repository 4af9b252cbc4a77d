//! Stream multiplexer
//!
//! Manages multiple virtual streams over a single connection.
//!
//! Each stream has its own credit window, counted in `Data` frames. A
//! writer waits for credit before queueing a frame, and a reader grants the
//! credit back once it has consumed frames. The session reader therefore
//! never waits on a slow stream: a peer that sends past its window is
//! violating the protocol.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hostrelay_common::config::MuxConfig;
use hostrelay_common::{Result, TunnelError};
use hostrelay_protocol::constants::INITIAL_STREAM_WINDOW;
use hostrelay_protocol::frame::{CloseReason, Frame};
use kanal::{bounded_async, AsyncReceiver, AsyncSender, ReceiveError};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Semaphore;
use tracing::{trace, warn};

/// Largest payload a single `Data` frame carries
const MAX_WRITE_CHUNK: usize = 64 * 1024;

/// Room left in a frame for the enum tag, stream id and length prefixes
const FRAME_OVERHEAD: usize = 64;

/// Upper bound on the receive window a stream advertises
const MAX_STREAM_WINDOW: u32 = 4096;

type StreamTable = Arc<DashMap<u32, AsyncSender<Frame>>>;

type CreditTable = Arc<DashMap<u32, Arc<Semaphore>>>;

/// Manages multiple virtual streams over a single connection
///
/// - `DashMap` for concurrent stream access without a global lock
/// - `AtomicU32` for lock-free stream ID allocation
/// - `kanal` channels for per-stream frame delivery
/// - a `Semaphore` per stream holding the send credit the peer granted
///
/// The dialing side allocates odd stream ids, the listening side even ones.
#[derive(Clone, Debug)]
pub struct Multiplexer {
    /// Inbound queues, removed once the peer stops sending
    streams: StreamTable,
    /// Send credit, removed once the local stream is dropped or reset
    credits: CreditTable,
    next_stream_id: Arc<AtomicU32>,
    frame_tx: AsyncSender<Frame>,
    window: u32,
    max_chunk: usize,
}

impl Multiplexer {
    pub fn new(frame_tx: AsyncSender<Frame>, is_dialer: bool, config: &MuxConfig) -> Self {
        let initial_stream_id = if is_dialer { 1 } else { 2 };
        let window = u32::try_from(config.stream_window)
            .unwrap_or(MAX_STREAM_WINDOW)
            .clamp(INITIAL_STREAM_WINDOW, MAX_STREAM_WINDOW);
        Self {
            streams: Arc::new(DashMap::new()),
            credits: Arc::new(DashMap::new()),
            next_stream_id: Arc::new(AtomicU32::new(initial_stream_id)),
            frame_tx,
            window,
            max_chunk: config
                .max_frame_size
                .saturating_sub(FRAME_OVERHEAD)
                .clamp(1, MAX_WRITE_CHUNK),
        }
    }

    #[inline]
    fn allocate_stream_id(&self) -> u32 {
        self.next_stream_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Inbound queue for a new stream: the full window plus its close frame
    fn stream_queue(&self) -> (AsyncSender<Frame>, AsyncReceiver<Frame>) {
        bounded_async(self.window as usize + 1)
    }

    fn register_credit(&self, stream_id: u32) -> Arc<Semaphore> {
        let credit = Arc::new(Semaphore::new(INITIAL_STREAM_WINDOW as usize));
        self.credits.insert(stream_id, Arc::clone(&credit));
        credit
    }

    /// Process an incoming frame from the wire. Never waits.
    ///
    /// Returns the new stream when the peer opened one; the caller decides
    /// who accepts it. An error means the peer broke the flow-control rules
    /// and the session should be torn down.
    pub fn process_frame(&self, frame: Frame) -> Result<Option<VirtualStream>> {
        match frame {
            Frame::OpenStream {
                stream_id,
                correlation,
            } => {
                let (tx, rx) = self.stream_queue();
                match self.streams.entry(stream_id) {
                    Entry::Occupied(_) => {
                        warn!(stream_id, "Stream already exists");
                        return Ok(None);
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(tx);
                    }
                }
                let credit = self.register_credit(stream_id);
                trace!(stream_id, "Peer opened stream");
                Ok(Some(self.make_stream(stream_id, rx, credit, correlation)))
            }
            Frame::Data { stream_id, .. } => {
                let tx = self.streams.get(&stream_id).map(|r| r.clone());
                if let Some(tx) = tx {
                    if tx.len() >= self.window as usize {
                        return Err(TunnelError::Protocol(format!(
                            "stream {stream_id} sent past its window of {} frames",
                            self.window
                        )));
                    }
                    // Fails only once the reader is gone
                    if !matches!(tx.try_send(frame), Ok(true)) {
                        self.streams.remove(&stream_id);
                    }
                }
                Ok(None)
            }
            Frame::CloseStream { stream_id, reason } => {
                if reason != CloseReason::Normal {
                    if let Some((_, credit)) = self.credits.remove(&stream_id) {
                        credit.close();
                    }
                }
                // No more inbound data for this id
                if let Some((_, tx)) = self.streams.remove(&stream_id) {
                    let _ = tx.try_send(Frame::CloseStream { stream_id, reason });
                }
                Ok(None)
            }
            Frame::WindowUpdate { stream_id, credit } => {
                if let Some(permits) = self.credits.get(&stream_id) {
                    let credit = credit as usize;
                    if permits.available_permits().saturating_add(credit) > Semaphore::MAX_PERMITS {
                        return Err(TunnelError::Protocol(format!(
                            "stream {stream_id} was granted more credit than it can hold"
                        )));
                    }
                    permits.add_permits(credit);
                }
                Ok(None)
            }
            Frame::Heartbeat { .. } | Frame::HeartbeatAck { .. } => Ok(None),
        }
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self, correlation: Option<String>) -> Result<VirtualStream> {
        let stream_id = self.allocate_stream_id();

        let (tx, rx) = self.stream_queue();
        self.streams.insert(stream_id, tx);
        let credit = self.register_credit(stream_id);

        if let Err(e) = self
            .frame_tx
            .send(Frame::OpenStream {
                stream_id,
                correlation: correlation.clone(),
            })
            .await
        {
            self.streams.remove(&stream_id);
            self.credits.remove(&stream_id);
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()).into());
        }

        Ok(self.make_stream(stream_id, rx, credit, correlation))
    }

    /// Drop every stream's inbound channel; their readers observe EOF and
    /// writers waiting for credit fail.
    pub fn close_all(&self) {
        self.streams.clear();
        for credit in self.credits.iter() {
            credit.close();
        }
        self.credits.clear();
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    fn make_stream(
        &self,
        stream_id: u32,
        rx: AsyncReceiver<Frame>,
        credit: Arc<Semaphore>,
        correlation: Option<String>,
    ) -> VirtualStream {
        VirtualStream {
            stream_id,
            correlation,
            rx,
            tx: self.frame_tx.clone(),
            streams: Arc::clone(&self.streams),
            credits: Arc::clone(&self.credits),
            credit,
            // Grows the peer's credit from the initial window to ours
            owed: self.window - INITIAL_STREAM_WINDOW,
            grant_threshold: (INITIAL_STREAM_WINDOW / 2).max(1),
            read_buffer: Bytes::new(),
            read_closed: false,
            write_closed: false,
            max_chunk: self.max_chunk,
            pending_recv: None,
            pending_send: None,
            pending_close: None,
            pending_grant: None,
        }
    }
}

type RecvFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Frame, ReceiveError>> + Send>>;

type SendFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// A virtual stream that implements `AsyncRead` + `AsyncWrite`
///
/// kanal's async API is bridged to tokio's poll-based traits with boxed
/// futures. Dropping the stream tells the peer it is gone, whether or not
/// it was shut down first.
pub struct VirtualStream {
    stream_id: u32,
    correlation: Option<String>,
    rx: AsyncReceiver<Frame>,
    tx: AsyncSender<Frame>,
    streams: StreamTable,
    credits: CreditTable,
    /// Frames this side may still send
    credit: Arc<Semaphore>,
    /// Frames consumed but not yet granted back to the peer
    owed: u32,
    grant_threshold: u32,
    read_buffer: Bytes,
    read_closed: bool,
    write_closed: bool,
    max_chunk: usize,
    pending_recv: Option<RecvFuture>,
    /// In-flight data frame and the number of caller bytes it carries
    pending_send: Option<(SendFuture, usize)>,
    pending_close: Option<SendFuture>,
    pending_grant: Option<SendFuture>,
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("stream_id", &self.stream_id)
            .field("correlation", &self.correlation)
            .field("read_buffer_len", &self.read_buffer.len())
            .field("send_credit", &self.credit.available_permits())
            .finish_non_exhaustive()
    }
}

impl VirtualStream {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Correlation id the opener attached, if any
    pub fn correlation(&self) -> Option<&str> {
        self.correlation.as_deref()
    }

    /// Hand consumed credit back to the peer once enough has built up.
    ///
    /// The grant is queued from the reader's task, so a grant waiting on a
    /// full writer queue wakes the reader when it goes through.
    fn poll_grant(&mut self, cx: &mut Context<'_>) {
        if self.pending_grant.is_none() {
            if self.read_closed || self.owed < self.grant_threshold {
                return;
            }
            let frame = Frame::WindowUpdate {
                stream_id: self.stream_id,
                credit: std::mem::take(&mut self.owed),
            };
            let tx = self.tx.clone();
            self.pending_grant = Some(Box::pin(async move {
                tx.send(frame).await.map_err(broken_pipe)
            }));
        }
        if let Some(fut) = self.pending_grant.as_mut() {
            if fut.as_mut().poll(cx).is_ready() {
                self.pending_grant = None;
            }
        }
    }
}

fn broken_pipe(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.streams.remove(&self.stream_id);
        self.credits.remove(&self.stream_id);
        let _ = self.tx.try_send(Frame::CloseStream {
            stream_id: self.stream_id,
            reason: CloseReason::Reset,
        });
    }
}

impl AsyncRead for VirtualStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            this.poll_grant(cx);

            if !this.read_buffer.is_empty() {
                let len = std::cmp::min(buf.remaining(), this.read_buffer.len());
                buf.put_slice(&this.read_buffer.split_to(len));
                return Poll::Ready(Ok(()));
            }
            if this.read_closed {
                return Poll::Ready(Ok(()));
            }

            let fut = this.pending_recv.get_or_insert_with(|| {
                let rx = this.rx.clone();
                Box::pin(async move { rx.recv().await })
            });
            let result = match fut.as_mut().poll(cx) {
                Poll::Ready(result) => result,
                Poll::Pending => return Poll::Pending,
            };
            this.pending_recv = None;

            match result {
                // Empty payloads are skipped; a zero-length read means EOF
                Ok(Frame::Data {
                    data,
                    end_of_stream,
                    ..
                }) => {
                    this.owed += 1;
                    this.read_buffer = data;
                    this.read_closed = end_of_stream;
                }
                Ok(Frame::CloseStream { .. }) | Err(_) => this.read_closed = true,
                Ok(_) => {}
            }
        }
    }
}

impl AsyncWrite for VirtualStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if this.write_closed {
            return Poll::Ready(Err(broken_pipe("stream closed for writing")));
        }

        // A pending send was created from this same buffer on the previous call
        if this.pending_send.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let len = buf.len().min(this.max_chunk);
            let frame = Frame::Data {
                stream_id: this.stream_id,
                data: Bytes::copy_from_slice(&buf[..len]),
                end_of_stream: false,
            };
            let credit = Arc::clone(&this.credit);
            let tx = this.tx.clone();
            let send = async move {
                credit
                    .acquire()
                    .await
                    .map_err(|_| broken_pipe("stream reset by peer"))?
                    .forget();
                tx.send(frame).await.map_err(broken_pipe)
            };
            this.pending_send = Some((Box::pin(send), len));
        }

        let Some((fut, len)) = this.pending_send.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                let len = *len;
                this.pending_send = None;
                Poll::Ready(result.map(|()| len))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session writer as soon as a write completes
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.write_closed {
            return Poll::Ready(Ok(()));
        }

        let fut = this.pending_close.get_or_insert_with(|| {
            let tx = this.tx.clone();
            let frame = Frame::CloseStream {
                stream_id: this.stream_id,
                reason: CloseReason::Normal,
            };
            Box::pin(async move { tx.send(frame).await.map_err(broken_pipe) })
        });
        match fut.as_mut().poll(cx) {
            Poll::Ready(result) => {
                this.pending_close = None;
                this.write_closed = true;
                Poll::Ready(result)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
