//! Getting an upstream connection for a request.

use detour_site::Destination;
use tracing::{debug, info, warn};

use super::server_conn::{ConnKind, ServerConn, RELAY_POOL_KEY};
use crate::context::ProxyContext;
use crate::error::ProxyError;
use crate::http::Request;
use crate::parent::Carriage;
use crate::sitestat::{SiteInfo, Verdict};

/// A pooled connection for the request's destination, or a new one.
/// Blocked sites may also reuse any idle relay connection to an HTTP
/// parent. CONNECT always gets a fresh connection.
pub async fn get_connection(ctx: &ProxyContext, req: &Request) -> Result<ServerConn, ProxyError> {
    if !req.is_connect {
        if let Some(conn) = ctx.pool.get(&req.dest.host_port()).await {
            return Ok(conn);
        }
        if ctx.has_parent() && ctx.sitestat.site_info(&req.dest).await.verdict == Verdict::Blocked {
            if let Some(conn) = ctx.pool.get(RELAY_POOL_KEY).await {
                debug!(target = %req.dest, "reusing relay connection");
                return Ok(conn);
            }
        }
    }
    create_connection(ctx, &req.dest, req.is_connect).await
}

/// Connect per the classifier's verdict, falling back between direct and
/// parent routes. `tunnel` asks for a byte stream to `dest` from every
/// route.
pub async fn create_connection(
    ctx: &ProxyContext,
    dest: &Destination,
    tunnel: bool,
) -> Result<ServerConn, ProxyError> {
    let result = connect_by_verdict(ctx, dest, tunnel).await;
    if let Err(e) = &result {
        if e.is_capacity() {
            warn!(target = %dest, error = %e, "out of descriptors, closing pooled connections");
            ctx.pool.close_all().await;
        }
    }
    result
}

async fn connect_by_verdict(ctx: &ProxyContext, dest: &Destination, tunnel: bool) -> Result<ServerConn, ProxyError> {
    let info = ctx.sitestat.site_info(dest).await;
    debug!(target = %dest, verdict = ?info.verdict, "routing");

    match info.verdict {
        Verdict::Blocked => match connect_parent(ctx, dest, tunnel, &info).await {
            Ok(conn) => Ok(conn),
            Err(e) if e.is_capacity() || info.always_blocked => Err(e),
            Err(e) => {
                debug!(target = %dest, error = %e, "parents failed, trying direct");
                connect_direct(ctx, dest, &info).await
            }
        },
        Verdict::Direct | Verdict::Unknown => {
            let err = match connect_direct(ctx, dest, &info).await {
                Ok(conn) => return Ok(conn),
                Err(e) => e,
            };
            if err.is_capacity()
                || !err.maybe_blocked()
                || dest.domain().is_none()
                || info.always_direct
                || !ctx.has_parent()
            {
                return Err(err);
            }
            info!(target = %dest, error = %err, "direct connect looks blocked, using parent");
            ctx.sitestat.record_blocked(dest).await;
            connect_parent(ctx, dest, tunnel, &info).await
        }
    }
}

/// Sites not yet known to work get short dial and first-read timeouts.
fn wants_short_timeouts(info: &SiteInfo) -> bool {
    info.verdict == Verdict::Unknown || info.once_blocked
}

async fn connect_direct(ctx: &ProxyContext, dest: &Destination, info: &SiteInfo) -> Result<ServerConn, ProxyError> {
    let short = wants_short_timeouts(info);
    let dial_timeout = if short {
        ctx.estimator.short_dial_timeout()
    } else {
        ctx.estimator.dial_timeout()
    };
    let stream = ctx.dialer.connect_dest(dest, dial_timeout).await?;
    let site = ctx.sitestat.entry(dest).await;
    let conn = ServerConn::new(
        Box::new(stream),
        dest,
        ConnKind::Direct,
        site,
        info.always_direct,
        ctx.session.server_keep_alive,
    );
    Ok(if short { conn.with_short_read() } else { conn })
}

async fn connect_parent(
    ctx: &ProxyContext,
    dest: &Destination,
    tunnel: bool,
    info: &SiteInfo,
) -> Result<ServerConn, ProxyError> {
    let conn = ctx.parents.connect(dest, tunnel, &ctx.dialer, &ctx.estimator).await?;
    let kind = match conn.carriage {
        Carriage::Tunnel => ConnKind::Parent(conn.parent),
        Carriage::Relay { auth } => ConnKind::Relay {
            parent: conn.parent,
            auth,
        },
    };
    Ok(ServerConn::new(
        conn.stream,
        dest,
        kind,
        None,
        info.always_direct,
        ctx.session.server_keep_alive,
    ))
}
