//! Reusable test harness for webterm integration tests.
//!
//! Spawns the compiled binary on a free loopback port and talks to it with a
//! minimal blocking WebSocket client.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use base64::Engine;

pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xA;

/// The sample key from RFC 6455 §1.3 and its expected accept value.
pub const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
pub const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

// ── ServerHandle ────────────────────────────────────────────────────

/// Handle to a running webterm process. Kills it on drop.
pub struct ServerHandle {
    pub child: Child,
    pub addr: SocketAddr,
    pub home_dir: tempfile::TempDir,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl ServerHandle {
    pub fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(self.addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(stream)
    }

    /// Open a WebSocket with a fresh random key.
    pub fn open_ws(&self) -> io::Result<WsClient> {
        WsClient::open(self.connect()?, &random_key())
    }
}

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_webterm"))
}

fn free_port() -> io::Result<u16> {
    let socket = TcpListener::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?.port())
}

/// Spawn webterm running `/bin/sh` (non-login) with a temp HOME.
pub fn spawn_server() -> io::Result<ServerHandle> {
    spawn_server_with_args(&[])
}

pub fn spawn_server_with_args(extra: &[&str]) -> io::Result<ServerHandle> {
    start(extra, Stdio::inherit())
}

/// Like `spawn_server`, with stderr captured in `child.stderr`.
pub fn spawn_server_with_stderr() -> io::Result<ServerHandle> {
    start(&[], Stdio::piped())
}

fn start(extra: &[&str], stderr: Stdio) -> io::Result<ServerHandle> {
    let home_dir = tempfile::tempdir()?;
    let port = free_port()?;
    let addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let child = Command::new(binary_path())
        .arg(port.to_string())
        .args(["--bind", "127.0.0.1", "--shell", "/bin/sh", "--no-login"])
        .args(extra)
        .env("HOME", home_dir.path())
        .env_remove("WEBTERM_PORT")
        .env_remove("WEBTERM_SHELL")
        .env_remove("RUST_LOG")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr)
        .spawn()?;

    let handle = ServerHandle {
        child,
        addr,
        home_dir,
    };

    // Wait for the listener to come up.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        // A bare connect is accepted and served as a request with no head,
        // which the server drops.
        match TcpStream::connect(addr) {
            Ok(_) => break,
            Err(err) if Instant::now() > deadline => return Err(err),
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
    Ok(handle)
}

/// Base64 of 16 pseudo-random bytes.
pub fn random_key() -> String {
    let mut bytes = [0u8; 16];
    for (i, chunk) in bytes.chunks_mut(4).enumerate() {
        chunk.copy_from_slice(&rand_u32(i as u32).to_le_bytes());
    }
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn rand_u32(salt: u32) -> u32 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    std::thread::current().id().hash(&mut hasher);
    salt.hash(&mut hasher);
    hasher.finish() as u32
}

/// Send a raw request and read until the server closes.
pub fn http_exchange(handle: &ServerHandle, request: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = handle.connect()?;
    stream.write_all(request)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(response)
}

// ── WsClient ────────────────────────────────────────────────────────

/// Decoded server frame.
#[derive(Debug)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn close_code(&self) -> Option<u16> {
        (self.opcode == OP_CLOSE && self.payload.len() >= 2)
            .then(|| u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

pub struct WsClient {
    stream: TcpStream,
    read_buf: Vec<u8>,
    /// Response head of the opening handshake.
    pub response_head: String,
}

impl WsClient {
    /// Send the upgrade request and read the response head.
    pub fn open(mut stream: TcpStream, key: &str) -> io::Result<Self> {
        let request = format!(
            "GET /ws HTTP/1.1\r\n\
             Host: localhost\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes())?;

        let mut read_buf = Vec::new();
        let mut buf = [0u8; 1024];
        let head_end = loop {
            if let Some(pos) = read_buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut buf)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                ));
            }
            read_buf.extend_from_slice(&buf[..n]);
        };
        let response_head = String::from_utf8_lossy(&read_buf[..head_end]).into_owned();
        read_buf.drain(..head_end);

        Ok(Self {
            stream,
            read_buf,
            response_head,
        })
    }

    /// Value of a response header, matched case-insensitively.
    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    /// Send a masked frame, as browsers do.
    pub fn send(&mut self, opcode: u8, payload: &[u8]) -> io::Result<()> {
        self.stream.write_all(&masked_frame(opcode, payload))
    }

    pub fn send_text(&mut self, text: &str) -> io::Result<()> {
        self.send(OP_TEXT, text.as_bytes())
    }

    pub fn send_resize(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        self.send_text(&format!(r#"{{"cols":{cols},"rows":{rows}}}"#))
    }

    pub fn send_close(&mut self, code: u16) -> io::Result<()> {
        self.send(OP_CLOSE, &code.to_be_bytes())
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Read the next frame. Returns None on timeout or disconnect.
    pub fn recv_frame(&mut self) -> Option<Frame> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some((frame, used)) = parse_frame(&self.read_buf) {
                self.read_buf.drain(..used);
                return Some(frame);
            }
            if Instant::now() > deadline {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.stream
                .set_read_timeout(Some(remaining.max(Duration::from_millis(50))))
                .ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(_) => return None,
            }
        }
    }

    /// Collect binary output until it contains `needle`.
    /// Returns everything read so far, or None if the stream ended first.
    pub fn read_output_until(&mut self, needle: &str) -> Option<String> {
        let mut output = Vec::new();
        while !String::from_utf8_lossy(&output).contains(needle) {
            let frame = self.recv_frame()?;
            if frame.opcode == OP_BINARY {
                output.extend_from_slice(&frame.payload);
            }
        }
        Some(String::from_utf8_lossy(&output).into_owned())
    }

    /// Skip output frames until a close frame arrives.
    pub fn wait_for_close(&mut self) -> Option<Frame> {
        loop {
            let frame = self.recv_frame()?;
            if frame.opcode == OP_CLOSE {
                return Some(frame);
            }
        }
    }

    /// True if the server has closed the TCP connection.
    pub fn at_eof(&mut self) -> bool {
        self.stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .ok();
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => return true,
                Err(_) => return false,
            }
        }
    }
}

// ── Framing ─────────────────────────────────────────────────────────

pub fn masked_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let key = rand_u32(payload.len() as u32).to_be_bytes();
    let mut frame = vec![0x80 | opcode];
    match payload.len() {
        n if n < 126 => frame.push(0x80 | n as u8),
        n if n <= u16::MAX as usize => {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    frame.extend_from_slice(&key);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
    frame
}

/// Parse one unmasked server frame from the front of `buf`.
fn parse_frame(buf: &[u8]) -> Option<(Frame, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let fin = buf[0] & 0x80 != 0;
    let opcode = buf[0] & 0x0F;
    let (len, header) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            let mut ext = [0u8; 8];
            ext.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(ext) as usize, 10)
        }
        n => (n as usize, 2),
    };
    if buf.len() < header + len {
        return None;
    }
    let frame = Frame {
        fin,
        opcode,
        payload: buf[header..header + len].to_vec(),
    };
    Some((frame, header + len))
}
