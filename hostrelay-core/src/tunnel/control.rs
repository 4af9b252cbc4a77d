//! Per-identifier control channels

use crate::stream::VirtualStream;
use futures::{SinkExt, StreamExt};
use hostrelay_common::{Result, TunnelError};
use hostrelay_protocol::{ControlCodec, ControlMessage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Ordered message channel from the relay to one tunnel client.
///
/// Outbound messages are serialized under a lock so concurrent relays never
/// interleave. A background task drains whatever the client sends; a decode
/// error or EOF closes the channel.
pub struct ControlChannel {
    identifier: String,
    writer: tokio::sync::Mutex<FramedWrite<WriteHalf<VirtualStream>, ControlCodec>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("identifier", &self.identifier)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Wrap `stream` and start its read loop
    pub fn spawn(identifier: impl Into<String>, stream: VirtualStream) -> Arc<Self> {
        let identifier = identifier.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let channel = Arc::new(Self {
            identifier: identifier.clone(),
            writer: tokio::sync::Mutex::new(FramedWrite::new(write_half, ControlCodec::new())),
            cancel: CancellationToken::new(),
        });

        let reader = FramedRead::new(read_half, ControlCodec::new());
        tokio::spawn(read_loop(identifier, reader, channel.cancel.clone()));
        channel
    }

    /// Send one message; fails once the channel is closed
    pub async fn send(&self, message: &ControlMessage) -> Result<()> {
        if self.is_closed() {
            return Err(TunnelError::ControlClosed(self.identifier.clone()));
        }
        let mut writer = self.writer.lock().await;
        let sent = tokio::select! {
            () = self.cancel.cancelled() => {
                return Err(TunnelError::ControlClosed(self.identifier.clone()));
            }
            sent = writer.send(message) => sent,
        };
        if let Err(e) = sent {
            warn!(identifier = %self.identifier, "Control channel write failed: {}", e);
            self.cancel.cancel();
            return Err(TunnelError::ControlClosed(self.identifier.clone()));
        }
        Ok(())
    }

    /// Stop the read loop and refuse further sends
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            debug!(identifier = %self.identifier, "Closing control channel");
            self.cancel.cancel();
        }
    }

    /// Resolves once the channel has closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }
}

async fn read_loop(
    identifier: String,
    mut reader: FramedRead<ReadHalf<VirtualStream>, ControlCodec>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = reader.next() => next,
        };
        match next {
            Some(Ok(message)) => debug!(identifier = %identifier, %message, "Control message from client"),
            Some(Err(e)) => {
                warn!(identifier = %identifier, "Control channel decode error: {}", e);
                break;
            }
            None => {
                info!(identifier = %identifier, "Control channel closed by client");
                break;
            }
        }
    }
    cancel.cancel();
}

/// Control channels keyed by client identifier
#[derive(Debug, Default)]
pub struct ControlRegistry {
    channels: Mutex<HashMap<String, Arc<ControlChannel>>>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `channel`, returning the channel it replaced
    pub fn add(&self, identifier: &str, channel: Arc<ControlChannel>) -> Option<Arc<ControlChannel>> {
        self.channels.lock().insert(identifier.to_string(), channel)
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<ControlChannel>> {
        self.channels.lock().get(identifier).cloned()
    }

    pub fn delete(&self, identifier: &str) -> Option<Arc<ControlChannel>> {
        self.channels.lock().remove(identifier)
    }

    /// Remove `identifier` only while it still maps to this exact channel
    pub fn remove_if_same(&self, identifier: &str, channel: &Arc<ControlChannel>) -> bool {
        let mut channels = self.channels.lock();
        if channels
            .get(identifier)
            .is_some_and(|current| Arc::ptr_eq(current, channel))
        {
            channels.remove(identifier);
            return true;
        }
        false
    }

    /// Snapshot of every registered channel
    pub fn all(&self) -> Vec<Arc<ControlChannel>> {
        self.channels.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
