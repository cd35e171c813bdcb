//! webterm - a login shell in the browser.
//!
//! Usage: webterm [PORT] [--bind ADDR] [--shell PROGRAM] [--no-login]

use std::net::IpAddr;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webterm::config::{self, Config, ShellConfig};
use webterm::frame::DEFAULT_MAX_PAYLOAD;
use webterm::pty::{self, WindowSize};
use webterm::Server;

/// Serve a terminal page and relay its WebSocket to a shell on a PTY.
///
/// One session at a time: a second browser waits until the first disconnects.
#[derive(Parser, Debug)]
#[command(name = "webterm", version, about, long_about = None)]
struct Cli {
    /// TCP port to listen on
    #[arg(env = "WEBTERM_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Shell to start for each session (absolute path or name on PATH)
    #[arg(long, env = "WEBTERM_SHELL", default_value = config::DEFAULT_SHELL)]
    shell: String,

    /// Do not pass `-l` to the shell
    #[arg(long)]
    no_login: bool,

    /// Rows until the browser reports its size
    #[arg(long, default_value_t = config::DEFAULT_ROWS)]
    rows: u16,

    /// Columns until the browser reports its size
    #[arg(long, default_value_t = config::DEFAULT_COLS)]
    cols: u16,

    /// Largest client frame payload in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
    max_frame: usize,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            bind: self.bind,
            port: self.port,
            shell: ShellConfig {
                program: self.shell,
                login: !self.no_login,
            },
            initial_size: WindowSize::new(self.rows.max(1), self.cols.max(1)),
            max_frame_payload: self.max_frame,
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "webterm=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Resolves on SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::warn!(?err, "cannot listen for SIGTERM; only Ctrl-C stops the server");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = term.recv() => tracing::info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => tracing::info!("received Ctrl-C"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = Cli::parse().into_config();

    pty::ignore_child_exits().context("failed to ignore SIGCHLD")?;

    let addr = config.listen_addr();
    let server = Server::bind(config)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    server.run_until(shutdown_signal()).await?;
    Ok(())
}
