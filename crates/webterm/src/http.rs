//! The HTTP/1.1 subset the server speaks before a connection is upgraded.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Upper bound on the request head (request line plus headers).
pub const MAX_REQUEST_LEN: usize = 8192;

const HEAD_END: &[u8] = b"\r\n\r\n";

pub const NOT_FOUND_RESPONSE: &[u8] =
    b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("connection closed before the request head was complete")]
    Closed,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request line")]
    BadRequestLine,

    #[error("socket read failed: {0}")]
    Io(#[from] io::Error),
}

// ── Request ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Parse a request head. Trailing bytes after the blank line are ignored.
    pub fn parse(raw: &[u8]) -> Result<Self, HttpError> {
        let text = String::from_utf8_lossy(raw);
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(HttpError::BadRequestLine)?;
        let mut parts = request_line.split(' ');
        let method = parts.next().filter(|m| !m.is_empty());
        let path = parts.next().filter(|p| p.starts_with('/'));
        let version = parts.next().filter(|v| v.starts_with("HTTP/"));
        let (method, path) = match (method, path, version) {
            (Some(m), Some(p), Some(_)) => (m.to_string(), p.to_string()),
            _ => return Err(HttpError::BadRequestLine),
        };

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();

        Ok(Self {
            method,
            path,
            headers,
        })
    }

    /// First value of header `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Path with any query string removed.
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// True if the `Upgrade` header names the websocket protocol.
    pub fn wants_websocket(&self) -> bool {
        self.header("Upgrade")
            .map(|v| v.split(',').any(|p| p.trim().eq_ignore_ascii_case("websocket")))
            .unwrap_or(false)
    }
}

/// Read from `reader` until the blank line that ends the request head.
pub async fn read_request<R>(reader: &mut R, limit: usize) -> Result<Request, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(HttpError::Closed);
        }
        // Only rescan the tail that could contain a new terminator.
        let scan_from = head.len().saturating_sub(HEAD_END.len() - 1);
        head.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&head[scan_from..], HEAD_END) {
            let end = scan_from + pos + HEAD_END.len();
            if end > limit {
                return Err(HttpError::TooLarge(limit));
            }
            return Request::parse(&head[..end]);
        }
        if head.len() >= limit {
            return Err(HttpError::TooLarge(limit));
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── Routing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// `GET /`: the terminal page.
    Page,
    /// `GET /ws` with `Upgrade: websocket`.
    Terminal,
    NotFound,
}

pub fn route(request: &Request) -> Route {
    if request.method != "GET" {
        return Route::NotFound;
    }
    match request.route_path() {
        "/" => Route::Page,
        "/ws" if request.wants_websocket() => Route::Terminal,
        _ => Route::NotFound,
    }
}

/// Full `200 OK` response carrying the terminal page.
pub fn page_response(body: &[u8]) -> Vec<u8> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html\r\n\
         Content-Length: {}\r\n\
         Cache-Control: no-store\r\n\
         Connection: close\r\n\r\n",
        body.len()
    );
    let mut response = Vec::with_capacity(head.len() + body.len());
    response.extend_from_slice(head.as_bytes());
    response.extend_from_slice(body);
    response
}
