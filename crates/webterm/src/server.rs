//! Listening socket and the strictly sequential accept loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::handshake::{self, HandshakeError};
use crate::http::{self, HttpError, Request, Route};
use crate::pty::{PtyError, PtySession};
use crate::relay::{self, RelayError};

/// Terminal page served on `GET /`.
pub static PAGE: &[u8] = include_bytes!("../assets/index.html");

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("bad request: {0}")]
    Http(#[from] HttpError),

    #[error("handshake rejected: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("could not start shell: {0}")]
    Pty(#[from] PtyError),

    #[error("session aborted: {0}")]
    Relay(#[from] RelayError),

    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

/// Owns the listening socket and serves one connection at a time.
///
/// While a terminal session is running no other connection is accepted;
/// pending clients wait in the listen backlog.
pub struct Server {
    listener: TcpListener,
    config: Config,
    sessions: u64,
}

impl Server {
    pub async fn bind(config: Config) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr()).await?;
        Ok(Self {
            listener,
            config,
            sessions: 0,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` resolves. A session still running at that point
    /// is dropped, which hangs up its shell.
    pub async fn run_until<F>(mut self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!(addr = %self.local_addr()?, "listening");
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(?err, "accept failed");
                        continue;
                    }
                },
            };

            tokio::select! {
                _ = &mut shutdown => break,
                result = self.handle_connection(stream, peer) => {
                    if let Err(err) = result {
                        tracing::debug!(%peer, %err, "connection ended with error");
                    }
                }
            }
        }

        tracing::info!("shutting down");
        Ok(())
    }

    async fn handle_connection(
        &mut self,
        mut stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let request = match http::read_request(&mut stream, http::MAX_REQUEST_LEN).await {
            Ok(request) => request,
            Err(HttpError::BadRequestLine) => {
                tracing::debug!(%peer, "unparseable request line");
                stream.write_all(http::NOT_FOUND_RESPONSE).await?;
                let _ = stream.shutdown().await;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let route = http::route(&request);
        tracing::debug!(%peer, method = %request.method, path = %request.path, ?route, "request");

        match route {
            Route::Page => stream.write_all(&http::page_response(PAGE)).await?,
            Route::NotFound => stream.write_all(http::NOT_FOUND_RESPONSE).await?,
            Route::Terminal => return self.serve_terminal(stream, &request, peer).await,
        }
        let _ = stream.shutdown().await;
        Ok(())
    }

    async fn serve_terminal(
        &mut self,
        mut stream: TcpStream,
        request: &Request,
        peer: SocketAddr,
    ) -> Result<(), ConnectionError> {
        // A bad key or a failed spawn closes the socket before anything is sent.
        let key = handshake::client_key(request)?;
        let pty = PtySession::spawn(&self.config.shell, self.config.initial_size)?;
        handshake::complete(&mut stream, key).await?;

        self.sessions += 1;
        let session = self.sessions;
        let pid = pty.pid().as_raw();
        tracing::info!(session, %peer, pid, "session started");

        match relay::run(stream, pty, self.config.max_frame_payload).await {
            Ok(end) => {
                tracing::info!(session, ?end, "session ended");
                Ok(())
            }
            Err(err) => {
                tracing::info!(session, %err, "session aborted");
                Err(err.into())
            }
        }
    }
}
