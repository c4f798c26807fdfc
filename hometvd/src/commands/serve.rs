use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use hometv_core::access::{ContentKeyStore, DeliveryMode, UrlBuilder};
use hometv_core::gateway::{self, GatewayState, HttpTokenValidator};
use hometv_core::{
    load_channel_catalog, ChannelRegistry, ChannelSupervisor, HealthRegistry, HometvConfig,
    SessionGuard, SessionGuardConfig, SqliteSessionStore, SupervisorSettings,
};

use crate::{channels_path, AppError, Cli, Result};

pub async fn run(cli: &Cli, config: HometvConfig) -> Result<()> {
    // configuration problems are surfaced here, before anything is spawned
    let catalog_path = channels_path(cli, &config);
    let channels = load_channel_catalog(&catalog_path)?;
    if channels.is_empty() {
        return Err(AppError::EmptyCatalog(catalog_path));
    }

    let segment_root = config.resolve_path(&config.paths.segment_dir);
    std::fs::create_dir_all(&segment_root)?;

    let session_store = SqliteSessionStore::builder()
        .path(config.resolve_path(&config.paths.sessions_db))
        .build()?;
    session_store.initialize()?;
    let guard = Arc::new(SessionGuard::new(
        SessionGuardConfig::from_section(&config.sessions),
        Arc::new(session_store),
    ));

    let key_store = ContentKeyStore::builder()
        .path(config.resolve_path(&config.paths.keys_db))
        .public_base(config.server.public_base.clone())
        .build()?;
    key_store.initialize()?;
    let key_store = Arc::new(key_store);

    let health = Arc::new(HealthRegistry::new());
    let supervisor = Arc::new(ChannelSupervisor::new(
        SupervisorSettings::from_config(&config.encoder, &config.supervisor, segment_root.clone()),
        Some(Arc::clone(&key_store)),
        health.callback(),
    ));
    let registry = Arc::new(ChannelRegistry::new());

    let mode: DeliveryMode = config
        .delivery
        .mode
        .parse()
        .map_err(AppError::DeliveryMode)?;
    let secret_path = config.resolve_path(&config.delivery.secret_path);
    let secret = std::fs::read(&secret_path)?;
    if mode == DeliveryMode::Public && secret.is_empty() {
        return Err(AppError::EmptySecret(secret_path));
    }
    let urls = UrlBuilder::new(
        mode,
        config.server.public_base.clone(),
        config.delivery.cdn_base.clone(),
        secret,
        config.delivery.url_ttl_minutes,
    );

    let state = Arc::new(GatewayState {
        registry: Arc::clone(&registry),
        guard: Arc::clone(&guard),
        keys: Arc::clone(&key_store),
        validator: Arc::new(HttpTokenValidator::new(config.auth.identity_url.clone())),
        urls,
        segment_root,
        health: Arc::clone(&health),
        manifest_stale_after: Duration::from_secs(config.supervisor.manifest_stale_seconds),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = guard.spawn_reaper(shutdown_rx.clone());
    let reconciler = spawn_reconciler(
        catalog_path,
        Duration::from_secs(config.supervisor.reconcile_interval_seconds),
        Arc::clone(&registry),
        Arc::clone(&supervisor),
        shutdown_rx,
    );

    let listener = TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "gateway listening");
    let server = tokio::spawn(gateway::serve(state, listener));

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    // the reconciler must drain first or a mid-pass sync could respawn
    // workers behind stop_all's back
    let _ = reconciler.await;
    supervisor.stop_all().await;
    server.abort();
    let _ = reaper.await;
    Ok(())
}

/// Periodically re-reads the channel catalog and reconciles the desired
/// set against the supervisor and the gateway's registry.
fn spawn_reconciler(
    catalog_path: std::path::PathBuf,
    interval: Duration,
    registry: Arc<ChannelRegistry>,
    supervisor: Arc<ChannelSupervisor>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match load_channel_catalog(&catalog_path) {
                Ok(channels) => {
                    registry.replace_all(&channels);
                    supervisor.sync(&channels).await;
                }
                Err(error) => {
                    warn!(%error, "failed to load channel catalog, keeping previous set");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
    })
}
