//! Runtime configuration. The binary fills this from the command line.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::frame::DEFAULT_MAX_PAYLOAD;
use crate::pty::WindowSize;

pub const DEFAULT_PORT: u16 = 1111;
pub const DEFAULT_SHELL: &str = "bash";
pub const DEFAULT_ROWS: u16 = 50;
pub const DEFAULT_COLS: u16 = 180;

/// The program started on each new terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    /// Absolute path, or a bare name looked up on `PATH`.
    pub program: String,
    /// Pass `-l` so the shell runs as a login shell.
    pub login: bool,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_SHELL.to_string(),
            login: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    pub shell: ShellConfig,
    /// Window size until the client's first resize message arrives.
    pub initial_size: WindowSize,
    /// Largest client frame payload accepted; bigger frames end the session.
    pub max_frame_payload: usize,
}

impl Config {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            shell: ShellConfig::default(),
            initial_size: WindowSize::new(DEFAULT_ROWS, DEFAULT_COLS),
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}
