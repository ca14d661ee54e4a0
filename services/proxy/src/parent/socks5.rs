//! SOCKS5 parent proxy client (RFC 1928, RFC 1929 user/password auth).

use std::time::Duration;

use detour_site::Destination;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::socks_address;
use crate::error::ProxyError;
use crate::stream::{BoxedStream, Dialer};

const VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone)]
pub struct Socks5Parent {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl Socks5Parent {
    pub fn new(host: String, port: u16, credentials: Option<(String, String)>) -> Self {
        Self {
            host,
            port,
            credentials,
        }
    }

    pub fn name(&self) -> String {
        format!("socks5://{}", super::authority(&self.host, self.port))
    }

    pub async fn connect(
        &self,
        dialer: &Dialer,
        dest: &Destination,
        dial_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<BoxedStream, ProxyError> {
        let mut tcp = dialer.connect(&self.host, self.port, dial_timeout).await?;
        match timeout(read_timeout, self.handshake(&mut tcp, dest)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::timeout("socks5 handshake", read_timeout)),
        }
        Ok(Box::new(tcp))
    }

    async fn handshake<S>(&self, stream: &mut S, dest: &Destination) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        // Greeting
        let greeting: &[u8] = if self.credentials.is_some() {
            &[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]
        } else {
            &[VERSION, 1, METHOD_NO_AUTH]
        };
        stream.write_all(greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != VERSION {
            return Err(self.protocol(format!("unexpected version {}", choice[0])));
        }
        match choice[1] {
            METHOD_NO_AUTH => {}
            METHOD_USER_PASS => self.authenticate(stream).await?,
            METHOD_NONE_ACCEPTABLE => return Err(self.refused("no acceptable auth method")),
            other => return Err(self.protocol(format!("unsupported auth method {other}"))),
        }

        // Connect request
        let mut request = vec![VERSION, CMD_CONNECT, 0x00];
        request.extend_from_slice(&socks_address(dest));
        stream.write_all(&request).await?;

        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await?;
        if reply[0] != VERSION {
            return Err(self.protocol(format!("unexpected reply version {}", reply[0])));
        }
        if reply[1] != 0 {
            return Err(self.refused(reply_message(reply[1])));
        }
        let bound_len = match reply[3] {
            ATYP_IPV4 => 4,
            ATYP_IPV6 => 16,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                usize::from(len[0])
            }
            other => return Err(self.protocol(format!("unknown address type {other}"))),
        };
        // Bound address and port are not used.
        let mut bound = vec![0u8; bound_len + 2];
        stream.read_exact(&mut bound).await?;

        debug!(parent = %self.name(), target = %dest, "socks5 tunnel established");
        Ok(())
    }

    async fn authenticate<S>(&self, stream: &mut S) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some((user, password)) = &self.credentials else {
            return Err(self.protocol("server demanded credentials we did not offer".into()));
        };
        if user.len() > 255 || password.len() > 255 {
            return Err(ProxyError::Config("socks5 credentials longer than 255 bytes".into()));
        }
        let mut request = Vec::with_capacity(3 + user.len() + password.len());
        request.push(0x01);
        request.push(user.len() as u8);
        request.extend_from_slice(user.as_bytes());
        request.push(password.len() as u8);
        request.extend_from_slice(password.as_bytes());
        stream.write_all(&request).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[0] != 0x01 {
            return Err(self.protocol(format!("bad auth reply version {}", status[0])));
        }
        if status[1] != 0 {
            return Err(self.refused("authentication failed"));
        }
        Ok(())
    }

    fn protocol(&self, what: String) -> ProxyError {
        ProxyError::Protocol(format!("{}: {what}", self.name()))
    }

    fn refused(&self, reason: &str) -> ProxyError {
        ProxyError::ParentRefused {
            parent: self.name(),
            reason: reason.to_string(),
        }
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
