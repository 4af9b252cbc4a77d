//! `hostrelay` wire protocol
//!
//! Two layers ride on every tunnel connection: the multiplexer frames that
//! carry independent streams over the upgraded socket, and the control
//! messages exchanged over the first (handshake) stream.

pub mod codec;
pub mod constants;
pub mod control;
pub mod frame;
pub mod validation;

pub use codec::TunnelCodec;
pub use control::{Action, ControlCodec, ControlMessage, TransportProtocol};
pub use frame::{CloseReason, Frame};
