//! Control channel messages
//!
//! Control messages are self-describing JSON objects, one per line, written
//! over the handshake stream. The relay only ever sends [`ControlMessage`];
//! anything the client sends back is decoded as a generic JSON value and
//! logged.

use crate::constants::MAX_CONTROL_MESSAGE_LEN;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Instruction kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    /// Ask the client to open a new stream back to the relay
    #[serde(rename = "requestClientSession")]
    RequestClientSession,
}

/// Protocol the opened stream will carry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransportProtocol {
    #[serde(rename = "http")]
    Http,
}

/// Instruction sent from the relay to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ControlMessage {
    pub action: Action,
    pub protocol: TransportProtocol,
    /// Port the public request targeted, empty when the Host header had none
    pub local_port: String,
    /// Echoed back in the `OpenStream` frame of the answering stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ControlMessage {
    pub fn request_client_session(local_port: impl Into<String>) -> Self {
        Self {
            action: Action::RequestClientSession,
            protocol: TransportProtocol::Http,
            local_port: local_port.into(),
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Newline-delimited JSON codec for the control channel
///
/// Decodes to [`serde_json::Value`] so that unknown message shapes from the
/// peer are tolerated; encodes any serializable message.
#[derive(Debug, Clone, Copy)]
pub struct ControlCodec {
    max_len: usize,
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self {
            max_len: MAX_CONTROL_MESSAGE_LEN,
        }
    }
}

impl ControlCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ControlCodec {
    type Item = serde_json::Value;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_len {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("control message exceeds {} bytes", self.max_len),
                    ));
                }
                return Ok(None);
            };

            let line = src.split_to(newline);
            src.advance(1);

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let value = serde_json::from_slice(&line).map_err(|e| {
                io::Error::new(io::ErrorKind::InvalidData, format!("decode err: {e}"))
            })?;
            return Ok(Some(value));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(value) => Ok(Some(value)),
            None if src.iter().all(u8::is_ascii_whitespace) => {
                src.clear();
                Ok(None)
            }
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control channel closed mid-message",
            )),
        }
    }
}

impl<T: Serialize> Encoder<&T> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = serde_json::to_vec(item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        if encoded.len() > self.max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("control message exceeds {} bytes", self.max_len),
            ));
        }
        dst.reserve(encoded.len() + 1);
        dst.put_slice(&encoded);
        dst.put_u8(b'\n');
        Ok(())
    }
}
