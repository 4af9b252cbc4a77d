//! Connection and routing engine of the relay.
//!
//! The engine keeps three independently locked maps (host directory,
//! control channels, sessions), turns upgraded connections into registered
//! tunnels, and hands out fresh streams for public requests.

pub mod auth;
pub mod resource_limits;
pub mod stream;
pub mod transport;
pub mod tunnel;

pub use tunnel::acceptor::TunnelAcceptor;
pub use tunnel::control::{ControlChannel, ControlRegistry};
pub use tunnel::directory::HostDirectory;
pub use tunnel::server::{RelayStream, Route, TunnelServer};
pub use tunnel::session::{Role, Session, SessionRegistry};
