//! The per-session event loop: PTY master <-> WebSocket client.

use std::io;

use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::frame::{
    encode_close, encode_frame, Frame, FrameDecoder, FrameError, OpCode, CLOSE_NORMAL,
};
use crate::pty::{self, PtyError, PtySession, WindowSize};

/// Bytes read from the PTY master per output frame.
const PTY_READ_CHUNK: usize = 8192;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("client framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("pty error: {0}")]
    Pty(#[from] PtyError),

    #[error("pty i/o failed: {0}")]
    PtyIo(#[source] io::Error),

    #[error("client write failed: {0}")]
    ClientIo(#[source] io::Error),
}

/// Why a session ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The shell exited (PTY hang-up).
    ShellExited,
    /// The client sent a close frame.
    ClientClosed,
    /// The client dropped the TCP connection.
    ClientGone,
}

// ── Client input ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ResizeMessage {
    cols: u16,
    rows: u16,
}

/// What a text frame from the client means.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientInput<'a> {
    Resize(WindowSize),
    Keystrokes(&'a [u8]),
}

/// Decide whether a text payload is a resize request or terminal input.
///
/// Only payloads starting with `{` are tried as `{"cols": N, "rows": N}`.
/// Anything that does not parse, or asks for a zero dimension, is input.
pub fn classify_text(payload: &[u8]) -> ClientInput<'_> {
    if payload.first() != Some(&b'{') {
        return ClientInput::Keystrokes(payload);
    }
    match serde_json::from_slice::<ResizeMessage>(payload) {
        Ok(msg) if msg.cols > 0 && msg.rows > 0 => {
            ClientInput::Resize(WindowSize::new(msg.rows, msg.cols))
        }
        _ => ClientInput::Keystrokes(payload),
    }
}

// ── Loop ─────────────────────────────────────────────────────────────

/// Queued keystrokes beyond which no further client frames are read until
/// the shell drains its input.
const MAX_PENDING_INPUT: usize = 64 * 1024;

enum Event {
    Output(io::Result<usize>),
    InputWritten(io::Result<usize>),
    Frame(Result<Frame, FrameError>),
}

/// Relay between `client` and `pty` until one side ends the session.
///
/// Owns both for the whole session; dropping them on return closes the
/// socket and hangs up the shell.
pub async fn run(
    mut client: TcpStream,
    mut pty: PtySession,
    max_payload: usize,
) -> Result<Termination, RelayError> {
    let mut buf = vec![0u8; PTY_READ_CHUNK];
    let mut decoder = FrameDecoder::new(max_payload);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        // All three arms are cancel-safe, so whichever loses keeps its progress.
        let event = tokio::select! {
            n = pty.read(&mut buf) => Event::Output(n),
            n = pty.write(&pending), if !pending.is_empty() => Event::InputWritten(n),
            frame = decoder.read_frame(&mut client), if pending.len() < MAX_PENDING_INPUT => {
                Event::Frame(frame)
            }
        };

        match event {
            Event::Output(Ok(0)) => return Ok(shell_exited(&mut client).await),
            Event::Output(Ok(n)) => {
                client
                    .write_all(&encode_frame(OpCode::Binary, &buf[..n]))
                    .await
                    .map_err(RelayError::ClientIo)?;
            }
            Event::Output(Err(err)) => return Err(RelayError::PtyIo(err)),
            Event::InputWritten(Ok(0)) => {
                return Err(RelayError::PtyIo(io::ErrorKind::WriteZero.into()));
            }
            Event::InputWritten(Ok(n)) => {
                pending.drain(..n);
            }
            Event::InputWritten(Err(err)) if pty::is_hangup(&err) => {
                return Ok(shell_exited(&mut client).await);
            }
            Event::InputWritten(Err(err)) => return Err(RelayError::PtyIo(err)),
            Event::Frame(Err(FrameError::Closed)) => return Ok(Termination::ClientGone),
            Event::Frame(Err(err)) => {
                if let Some(code) = err.close_code() {
                    let _ = client.write_all(&encode_close(code)).await;
                }
                return Err(err.into());
            }
            Event::Frame(Ok(frame)) => match frame.opcode {
                OpCode::Close => {
                    let code = frame.close_code().unwrap_or(CLOSE_NORMAL);
                    let _ = client.write_all(&encode_close(code)).await;
                    return Ok(Termination::ClientClosed);
                }
                OpCode::Ping => {
                    client
                        .write_all(&encode_frame(OpCode::Pong, &frame.payload))
                        .await
                        .map_err(RelayError::ClientIo)?;
                }
                OpCode::Pong => {}
                OpCode::Text => match classify_text(&frame.payload) {
                    ClientInput::Resize(size) => {
                        if size != pty.window_size() {
                            tracing::debug!(rows = size.rows, cols = size.cols, "resize");
                            pty.resize(size)?;
                        }
                    }
                    ClientInput::Keystrokes(bytes) => pending.extend_from_slice(bytes),
                },
                OpCode::Binary | OpCode::Continuation => pending.extend_from_slice(&frame.payload),
            },
        }
    }
}

async fn shell_exited(client: &mut TcpStream) -> Termination {
    let _ = client.write_all(&encode_close(CLOSE_NORMAL)).await;
    Termination::ShellExited
}
