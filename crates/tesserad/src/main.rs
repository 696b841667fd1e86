//! tesserad — Tessera node daemon.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::net::TcpListener;

use tessera_core::config::TesseraConfig;
use tessera_core::crypto::{generate_identity, Identity};
use tessera_services::{accept_loop, Context, RpcEndpoint};

mod echo;

const ROUTE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = TesseraConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TesseraConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TesseraConfig::default()
    });

    // Identity
    let identity = Arc::new(load_or_generate(
        &config.identity.identity_path,
        config.identity.key_bits,
    )?);

    // Shared state
    let ctx = Arc::new(Context::from_config(&config)?);
    let me = ctx.put_peer(identity.public_key())?;
    let servants = ctx.host_servants(me.clone());
    servants.insert("echo", Arc::new(echo::Echo));
    let echo_ref = ctx.put_servant_ref(&me, "echo")?;

    // Listener
    let listener = TcpListener::bind(config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    let local = listener.local_addr()?;
    let host = if config.network.advertise_host.is_empty() {
        local.ip().to_string()
    } else {
        config.network.advertise_host.clone()
    };
    ctx.register_tcp_route(&me, &host, local.port())?;
    if config.network.allow_plain {
        tracing::warn!("plain transport enabled, requests are accepted unencrypted");
    }

    tracing::info!(
        addr = %local,
        key = hex::encode(&identity.public_key().id()[..8]),
        peer = %me,
        echo = %echo_ref,
        "tesserad listening"
    );

    let endpoint = Arc::new(RpcEndpoint::new(ctx.clone()).with_sender(me));

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let prune_task = {
        let ctx = ctx.clone();
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ROUTE_PRUNE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {
                        let removed = ctx.prune_routes();
                        if removed > 0 {
                            tracing::info!(removed, "pruned stale routes");
                        }
                    }
                }
            }
        })
    };

    let listener_task = tokio::spawn(accept_loop(
        listener,
        identity,
        endpoint.clone(),
        shutdown_tx.clone(),
    ));

    match listener_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "listener failed"),
        Err(e) => tracing::error!(error = %e, "listener task panicked"),
    }
    let _ = prune_task.await;
    endpoint.stop().await;

    tracing::info!(capsules = ctx.mosaic().len(), "tesserad stopped");
    Ok(())
}

/// Load the node identity, creating it on first start.
fn load_or_generate(path: &Path, bits: usize) -> Result<Identity> {
    if path.exists() {
        let identity = Identity::load(path)
            .with_context(|| format!("failed to load identity {}", path.display()))?;
        tracing::info!(path = %path.display(), "identity loaded");
        return Ok(identity);
    }
    tracing::info!(path = %path.display(), bits, "generating identity");
    generate_identity(path, false, bits)
        .with_context(|| format!("failed to create identity {}", path.display()))
}
