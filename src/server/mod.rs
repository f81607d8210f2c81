//! Server module - TCP listener and client connection handling

mod connection;
mod listener;

pub use connection::ClientConnection;
pub use listener::ServerListener;
