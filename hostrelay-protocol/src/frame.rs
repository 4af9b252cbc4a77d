//! Multiplexer frame definitions

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Wire protocol frame
///
/// Stream ids opened by the dialing side are odd, those opened by the
/// accepting side are even.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    /// Open a new stream. `correlation` echoes the id of the control
    /// message this stream answers, if any.
    OpenStream {
        stream_id: u32,
        correlation: Option<String>,
    },

    Data {
        stream_id: u32,
        data: Bytes,
        end_of_stream: bool,
    },

    /// Close a stream
    CloseStream {
        stream_id: u32,
        reason: CloseReason,
    },

    /// Allow the peer to send `credit` more `Data` frames on a stream
    WindowUpdate {
        stream_id: u32,
        credit: u32,
    },

    // Keepalive
    Heartbeat {
        timestamp: u64,
    },

    HeartbeatAck {
        timestamp: u64,
    },
}

impl Frame {
    /// Stream the frame belongs to, `None` for session-level frames
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::OpenStream { stream_id, .. }
            | Frame::Data { stream_id, .. }
            | Frame::CloseStream { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. } => Some(*stream_id),
            Frame::Heartbeat { .. } | Frame::HeartbeatAck { .. } => None,
        }
    }
}

/// Stream close reasons
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CloseReason {
    /// The sender is done writing; it may still read
    Normal,
    /// The sender dropped the stream; stop writing to it
    Reset,
    Timeout,
    Error(String),
    ProtocolViolation,
}
