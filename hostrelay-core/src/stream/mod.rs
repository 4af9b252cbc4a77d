pub mod multiplexer;

pub use multiplexer::{Multiplexer, VirtualStream};
