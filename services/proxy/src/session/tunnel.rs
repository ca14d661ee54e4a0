//! CONNECT tunnels.
//!
//! Two copy loops run concurrently inside the session task. Each loop sends
//! a oneshot to its peer when it ends, and the retry decision is made only
//! after both have returned, so a retry never races a pending upstream
//! write.
//!
//! While the upstream is a possibly forged direct connection, client bytes
//! are captured so the tunnel can be replayed through a parent, and server
//! reads are bounded by the estimator's read timeout (the short one for
//! sites not yet known to work).

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use super::server_conn::{ConnMeta, ConnState, ServerConn};
use super::SessionError;
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::http::{Request, RequestState, CONNECT_ESTABLISHED};

const TUNNEL_BUF: usize = 16 * 1024;

/// Why a copy loop ended.
#[derive(Debug)]
enum TunnelEnd {
    /// EOF or an error that ends the tunnel.
    Closed,
    /// The peer loop ended first.
    Stopped,
    /// The upstream looked blocked before any response byte.
    Blocked(ProxyError),
}

/// Run a tunnel for a CONNECT request. Returns `Retry` when the upstream
/// looked forged and the captured client bytes can be replayed.
pub async fn run<CR, CW>(
    ctx: &ProxyContext,
    client_r: &mut CR,
    client_w: &mut CW,
    req: &mut Request,
    conn: &mut ServerConn,
) -> Result<bool, SessionError>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
{
    if req.state < RequestState::Sent {
        client_w
            .write_all(CONNECT_ESTABLISHED)
            .await
            .map_err(|_| SessionError::ClientClosed)?;
        client_w.flush().await.map_err(|_| SessionError::ClientClosed)?;
        req.state = RequestState::Sent;
    }

    let ServerConn { io, meta } = conn;
    let meta = &*meta;
    let (mut srv_r, mut srv_w) = tokio::io::split(io);

    let mut captured = req.body_buf.take();
    if let Some(replay) = captured.as_deref().filter(|b| !b.is_empty()) {
        debug!(target = %meta.dest(), bytes = replay.len(), "replaying tunnel prefix");
        let sent = async {
            srv_w.write_all(replay).await?;
            srv_w.flush().await
        };
        if let Err(e) = sent.await {
            let e = ProxyError::from(e);
            return Err(if meta.maybe_fake() && e.is_reset() {
                ctx.sitestat.record_blocked(meta.dest()).await;
                req.body_buf = captured;
                SessionError::Retry
            } else {
                SessionError::Fatal(e)
            });
        }
    }
    if meta.maybe_fake() && captured.is_none() {
        captured = Some(Vec::new());
    }

    let (cli_done_tx, cli_done_rx) = oneshot::channel::<()>();
    let (srv_done_tx, srv_done_rx) = oneshot::channel::<()>();
    let limit = ctx.session.replay_limit;
    let poll = ctx.session.tunnel_poll;
    let read_timeout = meta.first_read_timeout(&ctx.estimator);

    let c2s = async {
        let end = client_to_server(client_r, &mut srv_w, meta, &mut captured, limit, poll, srv_done_rx).await;
        let _ = cli_done_tx.send(());
        end
    };
    let s2c = async {
        let end = server_to_client(&mut srv_r, client_w, meta, read_timeout, cli_done_rx).await;
        let _ = srv_done_tx.send(());
        end
    };
    let (c_end, s_end) = tokio::join!(c2s, s2c);
    debug!(target = %meta.dest(), client = ?c_end, server = ?s_end, "tunnel finished");

    if meta.state() != ConnState::Connected {
        req.state = RequestState::ReceivingBody;
    }
    let blocked = match (c_end, s_end) {
        (TunnelEnd::Blocked(e), _) | (_, TunnelEnd::Blocked(e)) => Some(e),
        _ => None,
    };
    let still_fake = meta.maybe_fake();
    meta.stop();

    if let Some(e) = blocked {
        if still_fake {
            ctx.sitestat.record_blocked(meta.dest()).await;
            if captured.is_some() {
                req.body_buf = captured;
                return Err(SessionError::Retry);
            }
            req.partial = true;
            debug!(target = %meta.dest(), error = %e, "tunnel looked blocked but is too long to replay");
        }
    }
    req.state = RequestState::Done;
    Ok(false)
}

async fn client_to_server<CR, SW>(
    client: &mut CR,
    server: &mut SW,
    meta: &ConnMeta,
    captured: &mut Option<Vec<u8>>,
    limit: usize,
    poll: Duration,
    mut stop: oneshot::Receiver<()>,
) -> TunnelEnd
where
    CR: AsyncRead + Unpin,
    SW: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUF];
    loop {
        let fake = meta.maybe_fake();
        let read = async {
            if fake {
                timeout(poll, client.read(&mut buf)).await.ok()
            } else {
                Some(client.read(&mut buf).await)
            }
        };
        let n = tokio::select! {
            _ = &mut stop => return TunnelEnd::Stopped,
            r = read => match r {
                // Poll expired; look at the connection state again.
                None => continue,
                Some(Ok(0)) => return TunnelEnd::Closed,
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    debug!(error = %e, "tunnel client read failed");
                    return TunnelEnd::Closed;
                }
            },
        };

        if meta.maybe_fake() {
            if let Some(kept) = captured.as_mut() {
                if kept.len() + n > limit {
                    *captured = None;
                } else {
                    kept.extend_from_slice(&buf[..n]);
                }
            }
        } else {
            *captured = None;
        }

        let written = async {
            server.write_all(&buf[..n]).await?;
            server.flush().await
        };
        if let Err(e) = written.await {
            let e = ProxyError::from(e);
            if meta.maybe_fake() && e.is_reset() {
                return TunnelEnd::Blocked(e);
            }
            debug!(error = %e, "tunnel server write failed");
            return TunnelEnd::Closed;
        }
    }
}

async fn server_to_client<SR, CW>(
    server: &mut SR,
    client: &mut CW,
    meta: &ConnMeta,
    read_timeout: Duration,
    mut stop: oneshot::Receiver<()>,
) -> TunnelEnd
where
    SR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; TUNNEL_BUF];
    loop {
        let fake = meta.maybe_fake();
        let read = async {
            if fake {
                match timeout(read_timeout, server.read(&mut buf)).await {
                    Ok(r) => r.map_err(ProxyError::from),
                    Err(_) => Err(ProxyError::timeout("tunnel read", read_timeout)),
                }
            } else {
                server.read(&mut buf).await.map_err(ProxyError::from)
            }
        };
        let n = tokio::select! {
            _ = &mut stop => return TunnelEnd::Stopped,
            r = read => match r {
                Ok(0) => return TunnelEnd::Closed,
                Ok(n) => n,
                Err(e) if meta.maybe_fake() && e.maybe_blocked() => return TunnelEnd::Blocked(e),
                Err(e) => {
                    debug!(error = %e, "tunnel server read failed");
                    return TunnelEnd::Closed;
                }
            },
        };

        let written: io::Result<()> = async {
            client.write_all(&buf[..n]).await?;
            client.flush().await
        }
        .await;
        if written.is_err() {
            return TunnelEnd::Closed;
        }
        meta.set_response_received();
    }
}
