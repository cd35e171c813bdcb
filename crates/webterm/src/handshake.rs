//! Server side of the RFC 6455 opening handshake (§4.2.2).

use std::io;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::digest::{base64_encode, is_base64_char, sha1};
use crate::http::Request;

/// Fixed GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A valid key is the base64 encoding of 16 bytes.
const KEY_LEN: usize = 24;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("malformed Sec-WebSocket-Key {0:?}")]
    MalformedKey(String),

    #[error("failed to send 101 response: {0}")]
    Io(#[from] io::Error),
}

/// Derive `Sec-WebSocket-Accept` from the client's key.
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + WS_GUID.len());
    input.push_str(client_key);
    input.push_str(WS_GUID);
    base64_encode(&sha1(input.as_bytes()))
}

/// Extract and validate the client's `Sec-WebSocket-Key`.
pub fn client_key(request: &Request) -> Result<&str, HandshakeError> {
    let key = request
        .header("Sec-WebSocket-Key")
        .ok_or(HandshakeError::MissingKey)?;
    let bytes = key.as_bytes();
    let well_formed = bytes.len() == KEY_LEN
        && bytes[..KEY_LEN - 2].iter().all(|&c| is_base64_char(c))
        && &bytes[KEY_LEN - 2..] == b"==";
    if well_formed {
        Ok(key)
    } else {
        Err(HandshakeError::MalformedKey(key.to_string()))
    }
}

/// The `101 Switching Protocols` response for `client_key`.
pub fn switching_protocols(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

/// Write the 101 response. After this the stream carries WebSocket frames.
pub async fn complete<W>(stream: &mut W, client_key: &str) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    stream
        .write_all(switching_protocols(client_key).as_bytes())
        .await?;
    stream.flush().await?;
    Ok(())
}
