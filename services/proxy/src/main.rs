//! detour proxy server.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use detour_proxy::config::Config;
use detour_proxy::persistence::{self, StatFile, SAVE_INTERVAL};
use detour_proxy::{
    ConnPool, Dialer, Listener, ListenerConfig, ParentPool, PoolConfig, ProxyContext,
    SessionConfig, SiteStat, SiteStatConfig, TimeoutEstimator,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to DETOUR_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting detour proxy");
    info!(
        listeners = config.listen.len(),
        encrypted_listeners = config.listen_encrypted.len(),
        parents = config.parents.len(),
        load_balance = %config.load_balance,
        "Configuration loaded"
    );

    let sitestat = Arc::new(SiteStat::new(SiteStatConfig {
        has_parent: !config.parents.is_empty(),
        direct_delta: config.direct_delta,
        blocked_delta: config.blocked_delta,
        ..SiteStatConfig::default()
    }));
    let stat_file = config.stat_file.clone().map(|path| Arc::new(StatFile::new(path)));
    persistence::load_site_stat(
        &sitestat,
        stat_file.as_deref(),
        config.always_direct_file.as_deref(),
        config.always_blocked_file.as_deref(),
    )
    .await?;

    let estimator = Arc::new(TimeoutEstimator::new(config.dial_timeout, config.read_timeout));
    let dialer = Dialer::new(config.hosts.clone());
    let ctx = Arc::new(ProxyContext::new(
        Arc::clone(&sitestat),
        ConnPool::new(PoolConfig::default()),
        Arc::new(ParentPool::new(config.parents.clone(), config.load_balance)),
        Arc::clone(&estimator),
        dialer.clone(),
        SessionConfig {
            tunnel_ports: config.tunnel_ports.clone(),
            ..SessionConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let plain = config.listen.iter().map(|addr| ListenerConfig::new(*addr));
    let encrypted = config
        .listen_encrypted
        .iter()
        .map(|l| ListenerConfig::encrypted(l.addr, l.cipher.clone()));
    let mut listener_handles = Vec::new();
    for mut listener_config in plain.chain(encrypted) {
        listener_config.max_connections = config.max_connections;
        let bind_addr = listener_config.bind_addr;
        match Listener::bind(listener_config, Arc::clone(&ctx)).await {
            Ok(listener) => {
                let listener = Arc::new(listener);
                let shutdown = shutdown_rx.clone();
                listener_handles.push(tokio::spawn(async move {
                    if let Err(e) = listener.run(shutdown).await {
                        error!(error = %e, "Listener error");
                    }
                }));
            }
            Err(e) => {
                error!(bind_addr = %bind_addr, error = %e, "Failed to bind listener");
                return Err(e.into());
            }
        }
    }

    if let Some(target) = config.estimate_target.clone() {
        tokio::spawn(Arc::clone(&estimator).run(dialer, target, shutdown_rx.clone()));
    }
    if let Some(file) = &stat_file {
        tokio::spawn(persistence::run_saver(
            Arc::clone(file),
            Arc::clone(&sitestat),
            SAVE_INTERVAL,
            shutdown_rx.clone(),
        ));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    for handle in listener_handles {
        let _ = handle.await;
    }
    if let Some(file) = &stat_file {
        persistence::save_on_exit(file, &sitestat).await;
    }
    Ok(())
}
