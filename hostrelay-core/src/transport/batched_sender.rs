//! Batched frame sender for reduced syscall overhead
//!
//! Collects frames queued by a session's streams and flushes them together.

use bytes::BytesMut;
use hostrelay_protocol::codec::TunnelCodec;
use hostrelay_protocol::Frame;
use kanal::AsyncReceiver;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::codec::Encoder;
use tracing::warn;

const MAX_BATCH_SIZE: usize = 32;
const BATCH_TIMEOUT_MICROS: u64 = 100;

/// Drain `frame_rx` into `writer` until the channel closes or a write fails.
///
/// Frames that fail to encode (too large for the codec) are skipped.
pub async fn run_batched_sender<W>(frame_rx: AsyncReceiver<Frame>, mut writer: W, mut codec: TunnelCodec)
where
    W: AsyncWrite + Unpin + Send,
{
    let mut buffer = BytesMut::with_capacity(64 * 1024);

    loop {
        buffer.clear();

        let Ok(first) = frame_rx.recv().await else {
            break;
        };
        let mut batched = 0;
        if let Err(e) = codec.encode(first, &mut buffer) {
            warn!("Skipping frame that failed to encode: {}", e);
        } else {
            batched += 1;
        }

        let deadline = tokio::time::Instant::now() + Duration::from_micros(BATCH_TIMEOUT_MICROS);
        while batched < MAX_BATCH_SIZE {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, frame_rx.recv()).await {
                Ok(Ok(frame)) => {
                    if let Err(e) = codec.encode(frame, &mut buffer) {
                        warn!("Skipping frame that failed to encode: {}", e);
                        continue;
                    }
                    batched += 1;
                }
                _ => break,
            }
        }

        if buffer.is_empty() {
            continue;
        }
        if let Err(e) = writer.write_all(&buffer).await {
            warn!("Failed to write batched frames: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush batched writer: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
}
