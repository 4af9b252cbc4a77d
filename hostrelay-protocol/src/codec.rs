//! Codec for encoding and decoding multiplexer frames
//!
//! Encoding reuses a thread-local scratch buffer, decoding splits frames out
//! of the read buffer without copying the payload.

use crate::constants::MAX_FRAME_SIZE;
use crate::frame::Frame;
use bytes::{Buf, BufMut, BytesMut};
use std::cell::RefCell;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

thread_local! {
    static ENCODE_BUFFER: RefCell<Vec<u8>> = const { RefCell::new(Vec::new()) };
}

/// Capacity reserved the first time a thread encodes a frame
const INITIAL_ENCODE_BUFFER_CAPACITY: usize = 8192;

/// Tunnel frame codec
///
/// Frames are length-prefixed with a 4-byte big-endian length field,
/// followed by bincode-encoded Frame data. The limit applies to the encoded
/// frame, so a `Data` payload must leave room for the enum tag and ids.
///
/// ```text
/// ┌─────────────┬──────────────┐
/// │ Length (u32)│ Frame Data   │
/// │ 4 bytes     │ N bytes      │
/// └─────────────┴──────────────┘
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TunnelCodec {
    max_frame_size: usize,
}

impl Default for TunnelCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE as usize,
        }
    }
}

impl TunnelCodec {
    /// Codec with the protocol-wide [`MAX_FRAME_SIZE`] limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that rejects frames larger than `max_frame_size` in either direction
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Largest encoded frame this codec accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn too_large(&self, frame_length: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Frame too large: {frame_length} bytes (max: {})",
                self.max_frame_size
            ),
        )
    }
}

impl Decoder for TunnelCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Length prefix not complete yet
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek the length prefix without consuming it
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_length = u32::from_be_bytes(length_bytes) as usize;

        // Reject before reserving anything for a hostile length
        if frame_length > self.max_frame_size {
            return Err(self.too_large(frame_length));
        }

        if src.len() < 4 + frame_length {
            src.reserve(4 + frame_length - src.len());
            return Ok(None);
        }

        src.advance(4);
        // Payload `Bytes` inside the frame share this allocation
        let frame_bytes = src.split_to(frame_length).freeze();

        let frame = bincode::deserialize(&frame_bytes).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Decode error: {e}"))
        })?;

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for TunnelCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        ENCODE_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();

            if buf.capacity() == 0 {
                buf.reserve(INITIAL_ENCODE_BUFFER_CAPACITY);
            }
            buf.clear();

            bincode::serialize_into(&mut *buf, &frame).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("Encode error: {e}"))
            })?;

            let frame_length = buf.len();
            // Same limit the peer's decoder enforces
            if frame_length > self.max_frame_size {
                return Err(self.too_large(frame_length));
            }
            let prefix = u32::try_from(frame_length).map_err(|_| self.too_large(frame_length))?;

            dst.reserve(4 + frame_length);
            dst.put_u32(prefix);
            dst.put_slice(&buf);

            Ok(())
        })
    }
}
