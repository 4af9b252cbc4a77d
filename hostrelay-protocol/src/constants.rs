//! Protocol constants

/// Path that turns a CONNECT request into a tunnel
pub const CONTROL_PATH: &str = "/_controlPath/";

/// Header carrying the client's opaque tunnel identifier
pub const IDENTIFIER_HEADER: &str = "X-Identifier";

/// Reason phrase of the status line acknowledging a CONNECT (`HTTP/1.1 200 Connected`)
pub const CONNECTED_REASON: &str = "Connected";

/// Token the client writes on the first stream
pub const HANDSHAKE_REQUEST: &[u8] = b"controlHandshake";

/// Token the relay answers with on the first stream
pub const HANDSHAKE_RESPONSE: &[u8] = b"controlOk";

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum encoded control message, newline excluded
pub const MAX_CONTROL_MESSAGE_LEN: usize = 64 * 1024;

/// Maximum correlation id length carried in an `OpenStream` frame
pub const MAX_CORRELATION_LEN: usize = 128;

/// `Data` frames either side may send on a new stream before the receiver
/// grants more credit with a `WindowUpdate`
pub const INITIAL_STREAM_WINDOW: u32 = 16;
