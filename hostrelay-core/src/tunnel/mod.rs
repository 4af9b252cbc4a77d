pub mod acceptor;
pub mod control;
pub mod directory;
pub mod server;
pub mod session;
