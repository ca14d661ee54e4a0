//! Shadowsocks AEAD relay.
//!
//! Wire format, per direction:
//!
//! ```text
//! [salt][len (2 bytes) + tag][payload + tag][len + tag][payload + tag]...
//! ```
//!
//! The master key comes from the password via `EVP_BytesToKey` (MD5); each
//! direction derives a subkey from its random salt with HKDF-SHA1. Nonces
//! are 12-byte little-endian counters incremented after every seal/open.
//! The client's first bytes are the SOCKS-style target address.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use bytes::{Buf, BytesMut};
use detour_site::Destination;
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::timeout;

use super::socks_address;
use crate::error::ProxyError;
use crate::stream::{BoxedStream, Dialer};

/// AEAD tag length for both supported methods.
pub const TAG_LEN: usize = 16;

/// Largest payload carried by one chunk.
pub const MAX_PAYLOAD: usize = 0x3FFF;

const SUBKEY_INFO: &[u8] = b"ss-subkey";
const NONCE_LEN: usize = 12;

type HmacSha1 = Hmac<Sha1>;

// ============================================================================
// Cipher configuration
// ============================================================================

/// Supported AEAD methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Gcm,
    Aes256Gcm,
}

impl Method {
    pub fn key_len(self) -> usize {
        match self {
            Method::Aes128Gcm => 16,
            Method::Aes256Gcm => 32,
        }
    }

    /// Salt length equals key length for these methods.
    pub fn salt_len(self) -> usize {
        self.key_len()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
        }
    }
}

impl FromStr for Method {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Method::Aes128Gcm),
            "aes-256-gcm" => Ok(Method::Aes256Gcm),
            other => Err(ProxyError::Config(format!(
                "unsupported encryption method: {other}"
            ))),
        }
    }
}

/// Method plus master key.
#[derive(Clone)]
pub struct CipherSpec {
    method: Method,
    key: Vec<u8>,
}

impl CipherSpec {
    pub fn new(method: Method, password: &str) -> Self {
        Self {
            method,
            key: evp_bytes_to_key(password.as_bytes(), method.key_len()),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }
}

impl fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSpec")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// OpenSSL `EVP_BytesToKey` with MD5, one iteration, no salt.
fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// HKDF-SHA1 (RFC 5869) extract and expand.
fn hkdf_sha1(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> io::Result<Vec<u8>> {
    let mut extract = <HmacSha1 as Mac>::new_from_slice(salt).map_err(io::Error::other)?;
    extract.update(ikm);
    let prk = extract.finalize().into_bytes();

    let mut okm = Vec::with_capacity(len + 20);
    let mut block: Vec<u8> = Vec::new();
    let mut counter = 1u8;
    while okm.len() < len {
        let mut expand = <HmacSha1 as Mac>::new_from_slice(&prk).map_err(io::Error::other)?;
        expand.update(&block);
        expand.update(info);
        expand.update(&[counter]);
        block = expand.finalize().into_bytes().to_vec();
        okm.extend_from_slice(&block);
        counter = counter.wrapping_add(1);
    }
    okm.truncate(len);
    Ok(okm)
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

// ============================================================================
// Per-direction AEAD state
// ============================================================================

enum AeadCipher {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

struct AeadState {
    cipher: AeadCipher,
    nonce: [u8; NONCE_LEN],
}

impl AeadState {
    fn new(spec: &CipherSpec, salt: &[u8]) -> io::Result<Self> {
        let subkey = hkdf_sha1(&spec.key, salt, SUBKEY_INFO, spec.method.key_len())?;
        let cipher = match spec.method {
            Method::Aes128Gcm => AeadCipher::Aes128(Box::new(
                <Aes128Gcm as KeyInit>::new_from_slice(&subkey).map_err(io::Error::other)?,
            )),
            Method::Aes256Gcm => AeadCipher::Aes256(Box::new(
                <Aes256Gcm as KeyInit>::new_from_slice(&subkey).map_err(io::Error::other)?,
            )),
        };
        Ok(Self {
            cipher,
            nonce: [0u8; NONCE_LEN],
        })
    }

    fn seal(&mut self, plain: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&self.nonce);
        let sealed = match &self.cipher {
            AeadCipher::Aes128(c) => c.encrypt(nonce, plain),
            AeadCipher::Aes256(c) => c.encrypt(nonce, plain),
        }
        .map_err(|_| io::Error::other("encryption failed"))?;
        self.advance();
        Ok(sealed)
    }

    fn open(&mut self, sealed: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = Nonce::from_slice(&self.nonce);
        let plain = match &self.cipher {
            AeadCipher::Aes128(c) => c.decrypt(nonce, sealed),
            AeadCipher::Aes256(c) => c.decrypt(nonce, sealed),
        }
        .map_err(|_| invalid_data("encrypted chunk failed authentication"))?;
        self.advance();
        Ok(plain)
    }

    fn advance(&mut self) {
        for byte in self.nonce.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }
    }
}

// ============================================================================
// AeadStream
// ============================================================================

/// An encrypted stream over any async transport.
///
/// Used by the client side toward a shadowsocks parent and by the server
/// side of the encrypted listener. Writes are buffered; callers flush.
pub struct AeadStream<S> {
    inner: S,
    spec: CipherSpec,
    dec: Option<AeadState>,
    /// Ciphertext received but not yet opened.
    rbuf: BytesMut,
    /// Length of the chunk whose header was already opened.
    pending_len: Option<usize>,
    /// Plaintext not yet returned to the reader.
    plain: BytesMut,
    enc: Option<AeadState>,
    /// Ciphertext not yet written to the transport.
    wbuf: BytesMut,
}

impl<S> AeadStream<S> {
    pub fn new(inner: S, spec: CipherSpec) -> Self {
        Self {
            inner,
            spec,
            dec: None,
            rbuf: BytesMut::with_capacity(MAX_PAYLOAD + TAG_LEN * 2 + 2),
            pending_len: None,
            plain: BytesMut::new(),
            enc: None,
            wbuf: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Open one complete chunk from `rbuf` if enough ciphertext arrived.
    fn decode_chunk(&mut self) -> io::Result<bool> {
        if self.dec.is_none() {
            let salt_len = self.spec.method.salt_len();
            if self.rbuf.len() < salt_len {
                return Ok(false);
            }
            let salt = self.rbuf.split_to(salt_len);
            self.dec = Some(AeadState::new(&self.spec, &salt)?);
        }
        let Some(dec) = self.dec.as_mut() else {
            return Ok(false);
        };

        let len = match self.pending_len {
            Some(len) => len,
            None => {
                if self.rbuf.len() < 2 + TAG_LEN {
                    return Ok(false);
                }
                let header = self.rbuf.split_to(2 + TAG_LEN);
                let header = dec.open(&header)?;
                let len = (usize::from(header[0]) << 8 | usize::from(header[1])) & MAX_PAYLOAD;
                if len == 0 {
                    return Err(invalid_data("empty encrypted chunk"));
                }
                self.pending_len = Some(len);
                len
            }
        };

        if self.rbuf.len() < len + TAG_LEN {
            return Ok(false);
        }
        let body = self.rbuf.split_to(len + TAG_LEN);
        let payload = dec.open(&body)?;
        self.pending_len = None;
        self.plain.extend_from_slice(&payload);
        Ok(true)
    }

    /// Seal one chunk into `wbuf`, emitting the salt first.
    fn encode_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if self.enc.is_none() {
            let mut salt = vec![0u8; self.spec.method.salt_len()];
            rand::rng().fill_bytes(&mut salt);
            self.enc = Some(AeadState::new(&self.spec, &salt)?);
            self.wbuf.extend_from_slice(&salt);
        }
        let Some(enc) = self.enc.as_mut() else {
            return Err(io::Error::other("cipher not initialized"));
        };
        // data.len() <= MAX_PAYLOAD fits in 14 bits
        let len = (data.len() as u16).to_be_bytes();
        let header = enc.seal(&len)?;
        let body = enc.seal(data)?;
        self.wbuf.extend_from_slice(&header);
        self.wbuf.extend_from_slice(&body);
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> AeadStream<S> {
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.wbuf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.wbuf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.wbuf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AeadStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.plain.is_empty() {
                let n = buf.remaining().min(this.plain.len());
                buf.put_slice(&this.plain[..n]);
                this.plain.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.decode_chunk()? {
                continue;
            }

            let mut chunk = [0u8; 8192];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            let filled = chunk_buf.filled();
            if filled.is_empty() {
                if this.rbuf.is_empty() && this.pending_len.is_none() {
                    return Poll::Ready(Ok(()));
                }
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated encrypted chunk",
                )));
            }
            this.rbuf.extend_from_slice(filled);
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AeadStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_PAYLOAD);
        this.encode_chunk(&buf[..n])?;
        // Errors here resurface on the next write or flush.
        let _ = this.poll_drain(cx);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Parent backend
// ============================================================================

/// A shadowsocks parent proxy.
#[derive(Debug, Clone)]
pub struct ShadowsocksParent {
    host: String,
    port: u16,
    cipher: CipherSpec,
}

impl ShadowsocksParent {
    pub fn new(host: String, port: u16, method: Method, password: &str) -> Self {
        Self {
            host,
            port,
            cipher: CipherSpec::new(method, password),
        }
    }

    pub fn name(&self) -> String {
        format!("ss://{}", super::authority(&self.host, self.port))
    }

    /// Open an encrypted stream and announce the destination.
    pub async fn connect(
        &self,
        dialer: &Dialer,
        dest: &Destination,
        dial_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<BoxedStream, ProxyError> {
        let tcp = dialer.connect(&self.host, self.port, dial_timeout).await?;
        let mut stream = AeadStream::new(tcp, self.cipher.clone());
        let handshake = async {
            stream.write_all(&socks_address(dest)).await?;
            stream.flush().await
        };
        match timeout(read_timeout, handshake).await {
            Ok(result) => result?,
            Err(_) => return Err(ProxyError::timeout("encrypted relay handshake", read_timeout)),
        }
        Ok(Box::new(stream))
    }
}
