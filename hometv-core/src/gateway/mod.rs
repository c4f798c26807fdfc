pub mod auth;
mod handlers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::access::{ContentKeyStore, UrlBuilder};
use crate::channel::ChannelRegistry;
use crate::session::SessionGuard;
use crate::supervisor::HealthRegistry;

pub use auth::{AuthError, HttpTokenValidator, SubscriberClaims, TokenValidator};
pub use handlers::is_safe_segment_name;

/// Everything a request handler needs, wired once at startup.
pub struct GatewayState {
    pub registry: Arc<ChannelRegistry>,
    pub guard: Arc<SessionGuard>,
    pub keys: Arc<ContentKeyStore>,
    pub validator: Arc<dyn TokenValidator>,
    pub urls: UrlBuilder,
    pub segment_root: PathBuf,
    pub health: Arc<HealthRegistry>,
    pub manifest_stale_after: Duration,
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stream/{slug}/stream.m3u8", get(handlers::playlist))
        .route("/stream/{slug}/master.m3u8", get(handlers::master_playlist))
        .route("/stream/{slug}/key", get(handlers::content_key))
        .route("/stream/{slug}/{segment}", get(handlers::segment))
        .with_state(state)
}

pub async fn serve(state: Arc<GatewayState>, listener: TcpListener) -> std::io::Result<()> {
    axum::serve(listener, router(state)).await
}
