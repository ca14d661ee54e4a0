//! HTTP/1.x message handling for the proxy.
//!
//! Heads are parsed with `httparse` and re-rendered: hop-by-hop headers are
//! dropped, requests are rewritten to origin form, and responses are always
//! presented to the client as HTTP/1.1. Close-delimited response bodies are
//! re-framed as chunked so the client connection can stay open, except for
//! HTTP/1.0 clients, which get the bytes as they come and a close.
//!
//! Requests bound for an HTTP parent keep the absolute-form target instead.

use std::fmt::Write as _;
use std::io;
use std::time::Duration;

use detour_site::Destination;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::ProxyError;

/// Largest accepted message head.
pub const MAX_HEAD: usize = 64 * 1024;

/// Largest accepted number of header lines.
pub const MAX_HEADERS: usize = 64;

/// Longest chunk-size or trailer line.
const MAX_LINE: usize = 4096;

const COPY_BUF: usize = 16 * 1024;

/// Sent to the client once a CONNECT tunnel is up.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Headers that only apply to a single hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

// ============================================================================
// Message framing
// ============================================================================

/// How a message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Response body ending when the server closes.
    UntilEof,
}

/// Progress of a request, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    Created,
    /// Head (and maybe body) written upstream.
    Sent,
    /// Response head forwarded to the client; no retry from here on.
    ReceivingBody,
    Done,
}

/// Header fields the proxy acts on.
#[derive(Debug, Default)]
struct HeaderInfo {
    retained: Vec<(String, String)>,
    content_length: Option<u64>,
    chunked: bool,
    connection_close: bool,
    connection_keep_alive: bool,
    keep_alive_timeout: Option<Duration>,
    has_host: bool,
}

fn scan_headers(headers: &[httparse::Header<'_>]) -> Result<HeaderInfo, ProxyError> {
    let mut info = HeaderInfo::default();
    // Headers named in Connection are hop-by-hop too.
    let mut listed: Vec<String> = Vec::new();
    for h in headers {
        if h.name.eq_ignore_ascii_case("connection") || h.name.eq_ignore_ascii_case("proxy-connection") {
            let value = String::from_utf8_lossy(h.value);
            for token in value.split(',').map(|t| t.trim().to_ascii_lowercase()) {
                match token.as_str() {
                    "close" => info.connection_close = true,
                    "keep-alive" => info.connection_keep_alive = true,
                    "" => {}
                    _ => listed.push(token),
                }
            }
        }
    }

    for h in headers {
        let value = String::from_utf8_lossy(h.value).trim().to_string();
        if h.name.eq_ignore_ascii_case("content-length") {
            let len = value
                .parse::<u64>()
                .map_err(|_| ProxyError::Protocol(format!("invalid Content-Length: {value}")))?;
            info.content_length = Some(len);
        } else if h.name.eq_ignore_ascii_case("transfer-encoding") {
            info.chunked = value.to_ascii_lowercase().contains("chunked");
        } else if h.name.eq_ignore_ascii_case("keep-alive") {
            info.keep_alive_timeout = parse_keep_alive_timeout(&value);
        } else if h.name.eq_ignore_ascii_case("host") {
            info.has_host = true;
        }

        if is_hop_by_hop(h.name) || listed.iter().any(|l| h.name.eq_ignore_ascii_case(l)) {
            continue;
        }
        if h.name.eq_ignore_ascii_case("content-length") && info.chunked {
            continue;
        }
        info.retained.push((h.name.to_string(), value));
    }
    if info.chunked {
        info.retained
            .retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
        info.content_length = None;
    }
    Ok(info)
}

/// Extract `timeout=N` from a `Keep-Alive` header value.
fn parse_keep_alive_timeout(value: &str) -> Option<Duration> {
    value.split(',').find_map(|param| {
        let (key, val) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("timeout") {
            val.trim().trim_matches('"').parse::<u64>().ok().map(Duration::from_secs)
        } else {
            None
        }
    })
}

/// Read a message head up to the blank line.
///
/// Returns `None` on a clean EOF before any byte. Leading blank lines are
/// skipped.
pub async fn read_head<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let start = head.len();
        let n = reader.read_until(b'\n', &mut head).await?;
        if n == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside message head",
            ));
        }
        if head.len() > MAX_HEAD {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "message head too large"));
        }
        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

// ============================================================================
// Request
// ============================================================================

/// A client request as forwarded upstream.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub dest: Destination,
    /// Origin-form target (`/path?query`); empty for CONNECT.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub is_connect: bool,
    pub seq: u64,
    pub try_cnt: u32,
    /// Some body bytes were consumed but not retained; no retry possible.
    pub partial: bool,
    /// Body (or tunnel) bytes retained for replay.
    pub body_buf: Option<Vec<u8>>,
    /// Head sent upstream.
    pub raw: Vec<u8>,
    pub body: BodyFraming,
    pub keep_alive: bool,
    /// The client spoke HTTP/1.0 and cannot read chunked bodies.
    pub http10: bool,
    pub state: RequestState,
}

impl Request {
    /// Parse a request head read from the client.
    pub fn parse(head: &[u8], seq: u64) -> Result<Self, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::Protocol("incomplete request head".into()))
            }
            Err(e) => return Err(ProxyError::Protocol(format!("malformed request: {e}"))),
        }
        let method = req.method.unwrap_or_default().to_ascii_uppercase();
        let target = req.path.unwrap_or_default();
        let minor = req.version.unwrap_or(1);
        let info = scan_headers(req.headers)?;

        let is_connect = method == "CONNECT";
        let (dest, path) = if is_connect {
            (Destination::parse_authority(target, 443)?, String::new())
        } else {
            parse_absolute_target(target)?
        };

        let keep_alive = if minor == 0 {
            info.connection_keep_alive
        } else {
            !info.connection_close
        };
        let body = if info.chunked {
            BodyFraming::Chunked
        } else {
            match info.content_length {
                Some(0) | None => BodyFraming::None,
                Some(n) => BodyFraming::Length(n),
            }
        };

        let mut request = Self {
            method,
            dest,
            path,
            headers: info.retained,
            is_connect,
            seq,
            try_cnt: 0,
            partial: false,
            body_buf: None,
            raw: Vec::new(),
            body,
            keep_alive,
            http10: minor == 0,
            state: RequestState::Created,
        };
        if !is_connect {
            request.raw = request.render_head(info.has_host);
        }
        Ok(request)
    }

    fn render_head(&self, has_host: bool) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        let _ = write!(out, "{} {} HTTP/1.1\r\n", self.method, self.path);
        if !has_host {
            let _ = write!(out, "Host: {}\r\n", host_header(&self.dest));
        }
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        if self.body == BodyFraming::Chunked {
            out.push_str("Transfer-Encoding: chunked\r\n");
        }
        out.push_str("Connection: keep-alive\r\n\r\n");
        out.into_bytes()
    }

    /// The head to send to an HTTP parent proxy: the absolute-form target
    /// plus the parent's credentials, if any.
    pub fn relay_head(&self, auth: Option<&str>) -> Vec<u8> {
        let mut out = format!(
            "{} http://{}{} HTTP/1.1\r\n",
            self.method,
            host_header(&self.dest),
            self.path
        );
        if let Some(auth) = auth {
            let _ = write!(out, "Proxy-Authorization: Basic {auth}\r\n");
        }
        let mut out = out.into_bytes();
        let rest = self
            .raw
            .windows(2)
            .position(|w| w == b"\r\n")
            .map_or(&self.raw[..], |idx| &self.raw[idx + 2..]);
        out.extend_from_slice(rest);
        out
    }

    /// Whether a response byte reached the client.
    pub fn response_sent(&self) -> bool {
        self.state >= RequestState::ReceivingBody
    }

    /// A failed attempt may be replayed: nothing reached the client and no
    /// body bytes were lost.
    pub fn can_retry(&self) -> bool {
        !self.partial && !self.response_sent()
    }

    pub fn has_body(&self) -> bool {
        self.body != BodyFraming::None
    }

    /// The client stream is positioned at the next request: the body is
    /// absent, kept in `body_buf`, or was forwarded in full.
    pub fn body_consumed(&self) -> bool {
        !self.has_body() || self.body_buf.is_some() || self.state >= RequestState::Sent
    }

    /// Short description for logs.
    pub fn summary(&self) -> String {
        if self.is_connect {
            format!("CONNECT {}", self.dest)
        } else {
            format!("{} {}{}", self.method, self.dest, self.path)
        }
    }
}

fn host_header(dest: &Destination) -> String {
    if dest.port() == 80 {
        if dest.host().contains(':') {
            format!("[{}]", dest.host())
        } else {
            dest.host().to_string()
        }
    } else {
        dest.host_port()
    }
}

/// Split `http://host[:port]/path` into destination and origin-form path.
fn parse_absolute_target(target: &str) -> Result<(Destination, String), ProxyError> {
    let (scheme, rest) = target.split_once("://").ok_or_else(|| {
        ProxyError::Protocol(format!("request target must be an absolute URI: {target}"))
    })?;
    let default_port = match scheme.to_ascii_lowercase().as_str() {
        "http" => 80,
        "https" => 443,
        other => return Err(ProxyError::Protocol(format!("unsupported scheme: {other}"))),
    };
    let (authority, path) = match rest.find(['/', '?']) {
        Some(idx) if rest[idx..].starts_with('?') => (&rest[..idx], format!("/{}", &rest[idx..])),
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    // Drop userinfo, it never goes upstream in the request line.
    let authority = authority.rsplit_once('@').map_or(authority, |(_, a)| a);
    let dest = Destination::parse_authority(authority, default_port)?;
    Ok((dest, path))
}

// ============================================================================
// Response
// ============================================================================

/// A parsed upstream response head.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: BodyFraming,
    /// The server will keep the connection open after this response.
    pub server_keep_alive: bool,
    pub keep_alive_timeout: Option<Duration>,
}

impl Response {
    /// Parse a response head. `method` is the request method, which decides
    /// whether a body follows.
    pub fn parse(head: &[u8], method: &str) -> Result<Self, ProxyError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ProxyError::Protocol("incomplete response head".into()))
            }
            Err(e) => return Err(ProxyError::Protocol(format!("malformed response: {e}"))),
        }
        let status = resp.code.unwrap_or(0);
        let minor = resp.version.unwrap_or(1);
        let reason = resp.reason.unwrap_or("").to_string();
        let info = scan_headers(resp.headers)?;

        let no_body = method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&status)
            || status == 204
            || status == 304;
        let body = if no_body {
            BodyFraming::None
        } else if info.chunked {
            BodyFraming::Chunked
        } else if let Some(n) = info.content_length {
            if n == 0 {
                BodyFraming::None
            } else {
                BodyFraming::Length(n)
            }
        } else {
            BodyFraming::UntilEof
        };

        let mut server_keep_alive = if minor == 0 {
            info.connection_keep_alive
        } else {
            !info.connection_close
        };
        if body == BodyFraming::UntilEof {
            server_keep_alive = false;
        }

        Ok(Self {
            status,
            reason,
            headers: info.retained,
            body,
            server_keep_alive,
            keep_alive_timeout: info.keep_alive_timeout,
        })
    }

    /// A close-delimited body sent as is to an HTTP/1.0 client, which ends
    /// the client connection.
    pub fn closes_client(&self, client_http10: bool) -> bool {
        client_http10 && self.body == BodyFraming::UntilEof
    }

    /// Render the head sent to the client.
    pub fn render_head(&self, client_keep_alive: bool, client_http10: bool) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        let _ = write!(out, "HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        let raw_eof = self.closes_client(client_http10);
        if self.body == BodyFraming::Chunked || (self.body == BodyFraming::UntilEof && !raw_eof) {
            out.push_str("Transfer-Encoding: chunked\r\n");
        }
        out.push_str(if client_keep_alive && !raw_eof {
            "Connection: keep-alive\r\n\r\n"
        } else {
            "Connection: close\r\n\r\n"
        });
        out.into_bytes()
    }
}

/// Read the final response head, skipping `100 Continue`.
pub async fn read_response<R>(reader: &mut R, method: &str) -> Result<Response, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let head = read_head(reader).await?.ok_or_else(|| {
            ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "server closed before responding",
            ))
        })?;
        let response = Response::parse(&head, method)?;
        if response.status == 100 {
            continue;
        }
        return Ok(response);
    }
}

// ============================================================================
// Body relay
// ============================================================================

/// Retains relayed bytes for replay, up to a limit.
#[derive(Debug)]
pub struct Capture<'a> {
    buf: &'a mut Option<Vec<u8>>,
    limit: usize,
}

impl<'a> Capture<'a> {
    /// Start capturing into `buf`, which must be `Some` to capture.
    pub fn new(buf: &'a mut Option<Vec<u8>>, limit: usize) -> Self {
        Self { buf, limit }
    }

    pub fn push(&mut self, data: &[u8]) {
        if let Some(b) = self.buf.as_mut() {
            if b.len() + data.len() > self.limit {
                *self.buf = None;
            } else {
                b.extend_from_slice(data);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.buf.is_some()
    }
}

/// Which side of a relay failed.
#[derive(Debug)]
pub enum CopyError {
    /// Reading the source failed or the body was malformed.
    Read(ProxyError),
    /// Writing to the sink failed.
    Write(io::Error),
}

struct Sink<'w, 'c, W> {
    writer: &'w mut W,
    capture: Option<Capture<'c>>,
    rechunk: bool,
    write_err: Option<io::Error>,
    written: u64,
}

impl<W: AsyncWrite + Unpin> Sink<'_, '_, W> {
    async fn put(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.push(data);
        }
        if self.write_err.is_some() {
            return;
        }
        let result = if self.rechunk {
            let size = format!("{:x}\r\n", data.len());
            async {
                self.writer.write_all(size.as_bytes()).await?;
                self.writer.write_all(data).await?;
                self.writer.write_all(b"\r\n").await
            }
            .await
        } else {
            self.writer.write_all(data).await
        };
        match result {
            Ok(()) => self.written += data.len() as u64,
            Err(e) => self.write_err = Some(e),
        }
    }

    /// Stop early once the sink failed and nothing is being retained.
    fn should_stop(&self) -> bool {
        self.write_err.is_some() && !self.capture.as_ref().is_some_and(|c| c.is_active())
    }
}

async fn timed<T>(
    read_timeout: Option<Duration>,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T, ProxyError> {
    match read_timeout {
        Some(d) => match timeout(d, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::timeout("body read", d)),
        },
        None => Ok(fut.await?),
    }
}

/// Relay a body from `reader` to `writer` according to `framing`.
///
/// Bytes are forwarded with their original framing, except `UntilEof`
/// bodies which are re-framed as chunked. With a capture, relayed bytes are
/// retained, and after a write failure the rest of the body is still read
/// so the capture holds the complete body. Returns bytes written.
pub async fn copy_body<R, W>(
    framing: BodyFraming,
    reader: &mut R,
    writer: &mut W,
    capture: Option<Capture<'_>>,
    read_timeout: Option<Duration>,
) -> Result<u64, CopyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sink = Sink {
        writer,
        capture,
        rechunk: framing == BodyFraming::UntilEof,
        write_err: None,
        written: 0,
    };
    let mut buf = vec![0u8; COPY_BUF];

    match framing {
        BodyFraming::None => {}
        BodyFraming::Length(mut remaining) => {
            while remaining > 0 && !sink.should_stop() {
                let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                let n = timed(read_timeout, reader.read(&mut buf[..want]))
                    .await
                    .map_err(CopyError::Read)?;
                if n == 0 {
                    return Err(CopyError::Read(ProxyError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "body shorter than Content-Length",
                    ))));
                }
                sink.put(&buf[..n]).await;
                remaining -= n as u64;
            }
        }
        BodyFraming::Chunked => loop {
            if sink.should_stop() {
                break;
            }
            let line = read_line(reader, read_timeout).await.map_err(CopyError::Read)?;
            let size = parse_chunk_size(&line).map_err(CopyError::Read)?;
            sink.put(&line).await;
            if size == 0 {
                // Trailers end with an empty line.
                loop {
                    let trailer = read_line(reader, read_timeout).await.map_err(CopyError::Read)?;
                    sink.put(&trailer).await;
                    if trailer == b"\r\n" || trailer == b"\n" {
                        break;
                    }
                }
                break;
            }
            let mut remaining = size;
            while remaining > 0 {
                let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                let n = timed(read_timeout, reader.read(&mut buf[..want]))
                    .await
                    .map_err(CopyError::Read)?;
                if n == 0 {
                    return Err(CopyError::Read(ProxyError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated chunk",
                    ))));
                }
                sink.put(&buf[..n]).await;
                remaining -= n as u64;
            }
            let mut crlf = [0u8; 2];
            timed(read_timeout, reader.read_exact(&mut crlf))
                .await
                .map_err(CopyError::Read)?;
            if &crlf != b"\r\n" {
                return Err(CopyError::Read(ProxyError::Protocol(
                    "missing CRLF after chunk data".into(),
                )));
            }
            sink.put(&crlf).await;
        },
        BodyFraming::UntilEof => loop {
            if sink.should_stop() {
                break;
            }
            let n = timed(read_timeout, reader.read(&mut buf))
                .await
                .map_err(CopyError::Read)?;
            if n == 0 {
                if sink.write_err.is_none() {
                    if let Err(e) = sink.writer.write_all(b"0\r\n\r\n").await {
                        sink.write_err = Some(e);
                    }
                }
                break;
            }
            sink.put(&buf[..n]).await;
        },
    }

    if let Some(e) = sink.write_err {
        return Err(CopyError::Write(e));
    }
    sink.writer.flush().await.map_err(CopyError::Write)?;
    Ok(sink.written)
}

/// Relay a close-delimited body unchanged until the server closes.
/// Returns bytes written.
pub async fn copy_until_eof<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, CopyError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut sink = Sink {
        writer,
        capture: None,
        rechunk: false,
        write_err: None,
        written: 0,
    };
    let mut buf = vec![0u8; COPY_BUF];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| CopyError::Read(e.into()))?;
        if n == 0 {
            break;
        }
        sink.put(&buf[..n]).await;
        if let Some(e) = sink.write_err.take() {
            return Err(CopyError::Write(e));
        }
    }
    sink.writer.flush().await.map_err(CopyError::Write)?;
    Ok(sink.written)
}

async fn read_line<R>(reader: &mut R, read_timeout: Option<Duration>) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::with_capacity(16);
    let n = timed(
        read_timeout,
        (&mut *reader).take(MAX_LINE as u64).read_until(b'\n', &mut line),
    )
    .await?;
    if n == 0 {
        return Err(ProxyError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed inside chunked body",
        )));
    }
    if !line.ends_with(b"\n") {
        return Err(ProxyError::Protocol("chunk line too long".into()));
    }
    Ok(line)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProxyError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::Protocol("non-ASCII chunk size".into()))?;
    let size = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size, 16)
        .map_err(|_| ProxyError::Protocol(format!("invalid chunk size line: {:?}", text.trim_end())))
}

// ============================================================================
// Error pages
// ============================================================================

/// An HTML error response that keeps the client connection open.
pub fn error_page(status: u16, reason: &str, title: &str, detail: &str) -> Vec<u8> {
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n<body>\n\
         <h1>{}</h1>\n<p>{}</p>\n<hr>\n<p>detour proxy</p>\n</body>\n</html>\n",
        escape_html(title),
        escape_html(detail),
    );
    let mut out = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/html; charset=utf-8\r\n\
         Connection: keep-alive\r\nCache-Control: no-cache\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .into_bytes();
    out.extend_from_slice(body.as_bytes());
    out
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::BufReader;

    fn text(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes).to_string()
    }

    #[test]
    fn test_request_rewritten_to_origin_form() {
        let head = b"GET http://www.example.com:8080/a/b?x=1 HTTP/1.1\r\n\
            Host: www.example.com:8080\r\n\
            Proxy-Connection: keep-alive\r\n\
            Proxy-Authorization: Basic Zm9vOmJhcg==\r\n\
            Connection: X-Secret\r\n\
            X-Secret: 1\r\n\
            Accept: */*\r\n\r\n";
        let req = Request::parse(head, 7).unwrap();
        assert_eq!(req.dest.host_port(), "www.example.com:8080");
        assert_eq!(req.path, "/a/b?x=1");
        assert_eq!(req.seq, 7);
        assert!(req.keep_alive);
        assert!(!req.has_body());

        let raw = text(&req.raw);
        assert!(raw.starts_with("GET /a/b?x=1 HTTP/1.1\r\n"));
        assert!(raw.contains("Host: www.example.com:8080\r\n"));
        assert!(raw.contains("Accept: */*\r\n"));
        assert!(!raw.contains("Proxy-"));
        assert!(!raw.contains("X-Secret"));
        assert!(raw.ends_with("Connection: keep-alive\r\n\r\n"));
    }

    #[test]
    fn test_request_adds_missing_host() {
        let req = Request::parse(b"GET http://example.org HTTP/1.0\r\n\r\n", 1).unwrap();
        assert_eq!(req.path, "/");
        assert!(!req.keep_alive);
        assert!(text(&req.raw).contains("Host: example.org\r\n"));
    }

    #[test]
    fn test_connect_request() {
        let req = Request::parse(b"CONNECT www.example.com:443 HTTP/1.1\r\n\r\n", 1).unwrap();
        assert!(req.is_connect);
        assert_eq!(req.dest.port(), 443);
        assert!(req.raw.is_empty());
    }

    #[test]
    fn test_retry_allowed_until_client_sees_response() {
        let mut req = Request::parse(
            b"POST http://example.com/form HTTP/1.1\r\nContent-Length: 3\r\n\r\n",
            1,
        )
        .unwrap();
        assert!(req.can_retry());
        assert!(!req.body_consumed());

        req.state = RequestState::Sent;
        assert!(req.can_retry());
        assert!(req.body_consumed());

        req.state = RequestState::ReceivingBody;
        assert!(!req.can_retry());

        req.state = RequestState::Created;
        req.partial = true;
        assert!(!req.can_retry());
    }

    #[rstest]
    #[case(&b"GET /index.html HTTP/1.1\r\nHost: proxy\r\n\r\n"[..])]
    #[case(&b"GET ftp://example.com/ HTTP/1.1\r\n\r\n"[..])]
    #[case(&b"CONNECT example.com:http HTTP/1.1\r\n\r\n"[..])]
    #[case(&b"GARBAGE\r\n\r\n"[..])]
    fn test_bad_requests(#[case] head: &[u8]) {
        let err = Request::parse(head, 1).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_) | ProxyError::Destination(_)));
    }

    #[test]
    fn test_chunked_request_drops_content_length() {
        let head = b"POST http://example.com/up HTTP/1.1\r\n\
            Transfer-Encoding: chunked\r\nContent-Length: 10\r\n\r\n";
        let req = Request::parse(head, 1).unwrap();
        assert_eq!(req.body, BodyFraming::Chunked);
        let raw = text(&req.raw);
        assert!(raw.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!raw.contains("Content-Length"));
    }

    #[test]
    fn test_http10_close_delimited_response_is_rechunked() {
        let resp = Response::parse(b"HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\n", "GET").unwrap();
        assert_eq!(resp.body, BodyFraming::UntilEof);
        assert!(!resp.server_keep_alive);
        let head = text(&resp.render_head(true, false));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(head.ends_with("Connection: keep-alive\r\n\r\n"));
    }

    #[test]
    fn test_close_delimited_body_to_http10_client_is_not_rechunked() {
        let req = Request::parse(
            b"GET http://example.com/ HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
            1,
        )
        .unwrap();
        assert!(req.http10);
        assert!(req.keep_alive);

        let resp = Response::parse(b"HTTP/1.0 200 OK\r\n\r\n", "GET").unwrap();
        assert!(resp.closes_client(req.http10));
        let head = text(&resp.render_head(req.keep_alive, req.http10));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(head.ends_with("Connection: close\r\n\r\n"));

        // Framed bodies keep the connection open.
        let resp = Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n", "GET").unwrap();
        assert!(!resp.closes_client(true));
        assert!(text(&resp.render_head(true, true)).ends_with("Connection: keep-alive\r\n\r\n"));
    }

    #[test]
    fn test_relay_head_uses_absolute_form() {
        let req = Request::parse(
            b"GET http://www.example.com:8080/a?b=1 HTTP/1.1\r\nHost: www.example.com:8080\r\nAccept: */*\r\n\r\n",
            1,
        )
        .unwrap();
        let head = text(&req.relay_head(Some("dXNlcjpwYXNz")));
        assert!(head.starts_with(
            "GET http://www.example.com:8080/a?b=1 HTTP/1.1\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n"
        ));
        assert!(head.contains("Host: www.example.com:8080\r\n"));
        assert!(head.contains("Accept: */*\r\n"));
        assert_eq!(head.matches(" HTTP/1.1\r\n").count(), 1);
        assert!(head.ends_with("\r\n\r\n"));

        let req = Request::parse(b"GET http://example.org/ HTTP/1.1\r\n\r\n", 1).unwrap();
        assert!(text(&req.relay_head(None)).starts_with("GET http://example.org/ HTTP/1.1\r\nHost: example.org\r\n"));
    }

    #[rstest]
    #[case("HEAD", 200)]
    #[case("GET", 204)]
    #[case("GET", 304)]
    fn test_responses_without_body(#[case] method: &str, #[case] status: u16) {
        let head = format!("HTTP/1.1 {status} X\r\nContent-Length: 42\r\n\r\n");
        let resp = Response::parse(head.as_bytes(), method).unwrap();
        assert_eq!(resp.body, BodyFraming::None);
        assert!(resp.server_keep_alive);
    }

    #[test]
    fn test_keep_alive_timeout() {
        let resp = Response::parse(
            b"HTTP/1.1 200 OK\r\nKeep-Alive: timeout=7, max=100\r\nContent-Length: 1\r\n\r\n",
            "GET",
        )
        .unwrap();
        assert_eq!(resp.keep_alive_timeout, Some(Duration::from_secs(7)));
        assert!(!text(&resp.render_head(true, false)).contains("Keep-Alive"));
    }

    #[tokio::test]
    async fn test_read_response_skips_continue() {
        let wire = b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
        let mut reader = BufReader::new(&wire[..]);
        let resp = read_response(&mut reader, "POST").await.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body, BodyFraming::Length(2));
    }

    #[tokio::test]
    async fn test_read_response_eof_is_retryable() {
        let mut reader = BufReader::new(&b""[..]);
        let err = read_response(&mut reader, "GET").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_copy_chunked_body_verbatim() {
        let wire = b"4\r\nwiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: y\r\n\r\nNEXT";
        let mut reader = BufReader::new(&wire[..]);
        let mut out = Vec::new();
        copy_body(BodyFraming::Chunked, &mut reader, &mut out, None, None)
            .await
            .unwrap();
        assert_eq!(out, &wire[..wire.len() - 4]);

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[tokio::test]
    async fn test_malformed_chunk_is_protocol_error() {
        let mut reader = BufReader::new(&b"zz\r\nabc\r\n"[..]);
        let mut out = Vec::new();
        let err = copy_body(BodyFraming::Chunked, &mut reader, &mut out, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Read(ProxyError::Protocol(_))));

        let mut reader = BufReader::new(&b"3\r\nabcXY0\r\n\r\n"[..]);
        let err = copy_body(BodyFraming::Chunked, &mut reader, &mut out, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Read(ProxyError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_until_eof_is_rechunked() {
        let mut reader = BufReader::new(&b"hello"[..]);
        let mut out = Vec::new();
        copy_body(BodyFraming::UntilEof, &mut reader, &mut out, None, None)
            .await
            .unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_copy_until_eof_is_verbatim() {
        let mut reader = BufReader::new(&b"hello world"[..]);
        let mut out = Vec::new();
        let n = copy_until_eof(&mut reader, &mut out).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_capture_respects_limit() {
        let body = vec![b'x'; 100];
        let mut buf = Some(Vec::new());
        let mut out = Vec::new();
        let mut reader = BufReader::new(&body[..]);
        copy_body(
            BodyFraming::Length(100),
            &mut reader,
            &mut out,
            Some(Capture::new(&mut buf, 1000)),
            None,
        )
        .await
        .unwrap();
        assert_eq!(buf.as_deref(), Some(&body[..]));

        let mut buf = Some(Vec::new());
        let mut reader = BufReader::new(&body[..]);
        copy_body(
            BodyFraming::Length(100),
            &mut reader,
            &mut out,
            Some(Capture::new(&mut buf, 10)),
            None,
        )
        .await
        .unwrap();
        assert!(buf.is_none());
    }

    #[test]
    fn test_error_page() {
        let page = text(&error_page(502, "Bad Gateway", "Upstream failed", "<reset>"));
        assert!(page.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(page.contains("Connection: keep-alive\r\n"));
        assert!(page.contains("&lt;reset&gt;"));
        let (head, body) = page.split_once("\r\n\r\n").unwrap();
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
    }
}
