//! webterm: a browser terminal served over a hand-rolled WebSocket.
//!
//! One listener, one shell at a time. `GET /` returns the terminal page,
//! `GET /ws` upgrades and relays between the socket and a fresh PTY.

pub mod config;
pub mod digest;
pub mod frame;
pub mod handshake;
pub mod http;
pub mod pty;
pub mod relay;
pub mod server;

pub use config::{Config, ShellConfig};
pub use server::Server;
