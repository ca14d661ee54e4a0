//! HTTP parent proxies: a plain HTTP proxy, or another detour reached
//! through its encrypted listener.
//!
//! Plain requests are relayed in absolute form over a connection that can
//! serve any destination. Tunnels ask the parent for `CONNECT`.

use std::time::Duration;

use base64::Engine;
use detour_site::Destination;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::debug;

use super::shadowsocks::{AeadStream, CipherSpec};
use crate::error::ProxyError;
use crate::stream::{BoxedStream, Dialer};

/// Largest reply head accepted from the parent.
const MAX_REPLY_HEAD: usize = 8192;

#[derive(Debug, Clone)]
pub struct HttpParent {
    host: String,
    port: u16,
    /// Base64 of `user:password`.
    auth: Option<String>,
    /// Set when the parent is another detour's encrypted listener.
    cipher: Option<CipherSpec>,
}

impl HttpParent {
    pub fn new(host: String, port: u16, credentials: Option<(String, String)>) -> Self {
        let auth = credentials.map(|(user, password)| {
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"))
        });
        Self {
            host,
            port,
            auth,
            cipher: None,
        }
    }

    /// Another detour, speaking HTTP inside the AEAD stream.
    pub fn encrypted(host: String, port: u16, cipher: CipherSpec) -> Self {
        Self {
            host,
            port,
            auth: None,
            cipher: Some(cipher),
        }
    }

    pub fn name(&self) -> String {
        let scheme = if self.cipher.is_some() { "detour" } else { "http" };
        format!("{scheme}://{}", super::authority(&self.host, self.port))
    }

    pub fn auth(&self) -> Option<&str> {
        self.auth.as_deref()
    }

    /// Open a connection to the parent itself, ready for proxy requests.
    pub async fn open(&self, dialer: &Dialer, dial_timeout: Duration) -> Result<BoxedStream, ProxyError> {
        let tcp = dialer.connect(&self.host, self.port, dial_timeout).await?;
        Ok(match &self.cipher {
            Some(cipher) => Box::new(AeadStream::new(tcp, cipher.clone())),
            None => Box::new(tcp),
        })
    }

    /// Ask the parent to open a tunnel to `dest`.
    pub async fn connect(
        &self,
        dialer: &Dialer,
        dest: &Destination,
        dial_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<BoxedStream, ProxyError> {
        let mut stream = BufReader::new(self.open(dialer, dial_timeout).await?);
        match timeout(read_timeout, self.handshake(&mut stream, dest)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::timeout("http parent handshake", read_timeout)),
        }
        Ok(Box::new(stream))
    }

    async fn handshake<S>(&self, stream: &mut BufReader<S>, dest: &Destination) -> Result<(), ProxyError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let target = dest.host_port();
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = &self.auth {
            request.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.get_mut().write_all(request.as_bytes()).await?;
        stream.get_mut().flush().await?;

        let head = read_reply_head(stream).await?;
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut reply = httparse::Response::new(&mut headers);
        match reply.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) | Err(_) => {
                return Err(ProxyError::Protocol(format!(
                    "malformed CONNECT reply from {}",
                    self.name()
                )))
            }
        }
        let code = reply.code.unwrap_or(0);
        if !(200..300).contains(&code) {
            return Err(ProxyError::ParentRefused {
                parent: self.name(),
                reason: format!("CONNECT {target} answered {code}"),
            });
        }
        debug!(parent = %self.name(), target = %target, "tunnel established");
        Ok(())
    }
}

/// Read up to and including the blank line ending a reply head.
async fn read_reply_head<S>(stream: &mut BufReader<S>) -> Result<Vec<u8>, ProxyError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    loop {
        let before = head.len();
        let n = stream.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(ProxyError::Protocol("parent closed during handshake".into()));
        }
        if head.len() > MAX_REPLY_HEAD {
            return Err(ProxyError::Protocol("CONNECT reply head too large".into()));
        }
        let line = &head[before..];
        if line == b"\r\n" || line == b"\n" {
            return Ok(head);
        }
    }
}
