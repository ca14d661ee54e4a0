//! Client sessions.
//!
//! A session reads requests from one client connection and handles them
//! strictly in order. Each request gets an upstream connection (pooled or
//! new), is forwarded, and its response relayed back. Failed attempts are
//! retried while nothing has reached the client and no body bytes were
//! lost:
//!
//! ```text
//! Created -> Sent -> ReceivingBody -> Done
//!    ^         |
//!    +- Retry -+   (reset, EOF, timeout; at most max_tries)
//! ```

mod connect;
mod server_conn;
mod tunnel;

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub use connect::{create_connection, get_connection};
pub use server_conn::{ConnKind, ConnMeta, ConnState, ServerConn, RELAY_POOL_KEY};

use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::http::{
    copy_body, copy_until_eof, error_page, read_head, read_response, Capture, CopyError, Request,
    RequestState,
};

/// How handling one request ended, short of success.
#[derive(Debug)]
pub enum SessionError {
    /// The attempt failed in a way worth replaying.
    Retry,
    /// An error page was sent to the client.
    PageSent,
    /// The client went away.
    ClientClosed,
    /// The client connection cannot continue.
    Fatal(ProxyError),
}

/// One client connection.
pub struct Session<S> {
    ctx: Arc<ProxyContext>,
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(ctx: Arc<ProxyContext>, stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            ctx,
            reader: BufReader::new(reader),
            writer,
        }
    }

    /// Serve requests until the client closes or a request ends the
    /// connection.
    pub async fn run(mut self) {
        loop {
            let head = match read_head(&mut self.reader).await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    debug!("client closed connection");
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "reading request failed");
                    return;
                }
            };

            let mut req = match Request::parse(&head, self.ctx.next_seq()) {
                Ok(req) => req,
                Err(e) => {
                    debug!(error = %e, "bad request");
                    let _ = self
                        .send_page(400, "Bad Request", "Bad request", &e.to_string())
                        .await;
                    return;
                }
            };
            debug!(seq = req.seq, request = %req.summary(), "request");

            if req.is_connect && !self.ctx.tunnel_allowed(req.dest.port()) {
                warn!(target = %req.dest, "CONNECT to port not in allow-list");
                let detail = format!("Tunnels to port {} are not allowed.", req.dest.port());
                if self.send_page(403, "Forbidden", "Forbidden", &detail).await.is_err() {
                    return;
                }
                continue;
            }

            match self.handle(&mut req).await {
                Ok(()) => {}
                Err(SessionError::PageSent) => {
                    if !req.body_consumed() {
                        return;
                    }
                }
                Err(SessionError::ClientClosed) => return,
                Err(SessionError::Fatal(e)) => {
                    debug!(request = %req.summary(), error = %e, "closing client connection");
                    return;
                }
                Err(SessionError::Retry) => return,
            }

            if req.is_connect || !req.keep_alive {
                return;
            }
        }
    }

    /// Run one request to completion, retrying per policy.
    async fn handle(&mut self, req: &mut Request) -> Result<(), SessionError> {
        let ctx = Arc::clone(&self.ctx);
        let mut final_attempt_used = false;
        loop {
            let mut conn = match get_connection(&ctx, req).await {
                Ok(conn) => conn,
                Err(e) => return Err(self.connect_failed(req, e).await),
            };

            let result = if req.is_connect {
                tunnel::run(&ctx, &mut self.reader, &mut self.writer, req, &mut conn).await
            } else {
                self.exchange(req, &mut conn).await
            };

            match result {
                Ok(true) => {
                    ctx.pool.put(conn).await;
                    return Ok(());
                }
                Ok(false) => return Ok(()),
                Err(SessionError::Retry) => {
                    let was_fake = conn.maybe_fake();
                    conn.meta.stop();
                    drop(conn);

                    req.try_cnt += 1;
                    if req.try_cnt < ctx.session.max_tries {
                        debug!(request = %req.summary(), try_cnt = req.try_cnt, "retrying");
                        continue;
                    }
                    if was_fake && !final_attempt_used && ctx.has_parent() {
                        info!(target = %req.dest, "retries exhausted on direct route, last try via parent");
                        ctx.sitestat.record_blocked(&req.dest).await;
                        req.try_cnt = 0;
                        final_attempt_used = true;
                        continue;
                    }
                    warn!(request = %req.summary(), tries = req.try_cnt, "giving up");
                    return Err(self
                        .page_if_possible(req, 502, "Bad Gateway", "Request failed", "Too many retries.")
                        .await);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Forward a plain request and relay the response. Returns whether the
    /// upstream connection can be reused.
    async fn exchange(&mut self, req: &mut Request, conn: &mut ServerConn) -> Result<bool, SessionError> {
        // Direct and silent so far.
        let fake = conn.maybe_fake();
        let head = match conn.meta.kind() {
            ConnKind::Relay { auth, .. } => req.relay_head(auth.as_deref()),
            _ => req.raw.clone(),
        };
        if let Err(e) = conn.io.write_all(&head).await {
            return Err(self.server_failed(req, fake, e.into()).await);
        }

        if let Some(body) = &req.body_buf {
            if let Err(e) = conn.io.write_all(body).await {
                return Err(self.server_failed(req, fake, e.into()).await);
            }
        } else if req.has_body() {
            req.body_buf = Some(Vec::new());
            let limit = self.ctx.session.replay_limit;
            let copied = copy_body(
                req.body,
                &mut self.reader,
                &mut conn.io,
                Some(Capture::new(&mut req.body_buf, limit)),
                None,
            )
            .await;
            if req.body_buf.is_none() {
                req.partial = true;
            }
            match copied {
                Ok(_) => {}
                Err(CopyError::Read(e)) => {
                    debug!(error = %e, "reading request body failed");
                    return Err(SessionError::ClientClosed);
                }
                Err(CopyError::Write(e)) => return Err(self.server_failed(req, fake, e.into()).await),
            }
        }
        if let Err(e) = conn.io.flush().await {
            return Err(self.server_failed(req, fake, e.into()).await);
        }
        req.state = RequestState::Sent;

        let first_read = fake.then(|| conn.meta.first_read_timeout(&self.ctx.estimator));
        let response = match first_read {
            Some(limit) => match timeout(limit, read_response(&mut conn.io, &req.method)).await {
                Ok(r) => r,
                Err(_) => Err(ProxyError::timeout("response", limit)),
            },
            None => read_response(&mut conn.io, &req.method).await,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => return Err(self.server_failed(req, fake, e).await),
        };
        conn.meta.set_response_received();
        req.state = RequestState::ReceivingBody;

        let raw_eof = response.closes_client(req.http10);
        if raw_eof {
            req.keep_alive = false;
        }
        let head = response.render_head(req.keep_alive, req.http10);
        let sent = async {
            self.writer.write_all(&head).await?;
            self.writer.flush().await
        };
        if sent.await.is_err() {
            return Err(SessionError::ClientClosed);
        }

        let copied = if raw_eof {
            copy_until_eof(&mut conn.io, &mut self.writer).await
        } else {
            copy_body(response.body, &mut conn.io, &mut self.writer, None, None).await
        };
        match copied {
            Ok(_) => {}
            Err(CopyError::Write(e)) => {
                debug!(error = %e, "writing response to client failed");
                return Err(SessionError::ClientClosed);
            }
            Err(CopyError::Read(e)) => {
                warn!(request = %req.summary(), error = %e, "response body read failed");
                return Err(SessionError::Fatal(e));
            }
        }
        req.state = RequestState::Done;

        if response.server_keep_alive {
            conn.touch(
                response
                    .keep_alive_timeout
                    .unwrap_or(self.ctx.session.server_keep_alive),
            );
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Decide between retry and an error page after an upstream failure
    /// before any response byte was forwarded. `fake` tells whether the
    /// connection was direct and silent so far.
    async fn server_failed(&mut self, req: &mut Request, fake: bool, e: ProxyError) -> SessionError {
        if fake && e.maybe_blocked() {
            info!(target = %req.dest, error = %e, "direct connection looks blocked");
            self.ctx.sitestat.record_blocked(&req.dest).await;
            if req.can_retry() && self.ctx.has_parent() {
                return SessionError::Retry;
            }
        }
        if e.is_retryable() && req.can_retry() {
            debug!(request = %req.summary(), error = %e, "retryable upstream error");
            return SessionError::Retry;
        }

        warn!(request = %req.summary(), error = %e, "upstream failed");
        if req.partial {
            return self
                .page_if_possible(
                    req,
                    502,
                    "Bad Gateway",
                    "Cannot retry request",
                    &format!("{e}. The request body was too large to keep for a retry."),
                )
                .await;
        }
        let (status, reason) = if matches!(e, ProxyError::Timeout { .. }) {
            (504, "Gateway Timeout")
        } else {
            (502, "Bad Gateway")
        };
        self.page_if_possible(req, status, reason, "Upstream error", &e.to_string())
            .await
    }

    async fn connect_failed(&mut self, req: &Request, e: ProxyError) -> SessionError {
        warn!(target = %req.dest, error = %e, "cannot connect");
        let (status, reason) = if matches!(e, ProxyError::Timeout { .. }) {
            (504, "Gateway Timeout")
        } else {
            (502, "Bad Gateway")
        };
        let mut detail = e.to_string();
        if e.maybe_blocked() && req.dest.domain().is_some() {
            detail.push_str(&format!(" Domain {} may be blocked, refresh to retry.", req.dest.domain().unwrap_or_default()));
        }
        self.page_if_possible(req, status, reason, "Connection failed", &detail)
            .await
    }

    /// Send an error page unless the client already got part of a response
    /// or a tunnel.
    async fn page_if_possible(
        &mut self,
        req: &Request,
        status: u16,
        reason: &str,
        title: &str,
        detail: &str,
    ) -> SessionError {
        let committed = if req.is_connect {
            req.state >= RequestState::Sent
        } else {
            req.response_sent()
        };
        if committed {
            return SessionError::Fatal(ProxyError::Protocol(format!("{title}: {detail}")));
        }
        let detail = format!("{}: {detail}", req.summary());
        match self.send_page(status, reason, title, &detail).await {
            Ok(()) => SessionError::PageSent,
            Err(_) => SessionError::ClientClosed,
        }
    }

    async fn send_page(&mut self, status: u16, reason: &str, title: &str, detail: &str) -> std::io::Result<()> {
        let page = error_page(status, reason, title, detail);
        self.writer.write_all(&page).await?;
        self.writer.flush().await
    }
}

/// Serve one client connection.
pub async fn serve<S>(ctx: Arc<ProxyContext>, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    Session::new(ctx, stream).run().await;
}
