use std::path::Path as FsPath;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::warn;

use crate::encoder::{render_master_playlist, variant_playlist_name, MANIFEST_NAME};
use crate::session::SessionError;
use crate::supervisor::probe_manifest;

use super::auth::{AuthError, SubscriberClaims};
use super::GatewayState;

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

#[derive(Debug, Deserialize)]
pub(super) struct StreamQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    expires: Option<i64>,
    #[serde(default)]
    sig: Option<String>,
    #[serde(default)]
    key_id: Option<String>,
}

pub(super) async fn health(State(state): State<Arc<GatewayState>>) -> Response {
    let workers = state.health.snapshot();
    let mut channels = serde_json::Map::new();
    for slug in state.registry.slugs() {
        let manifest = probe_manifest(&state.segment_root, &slug, state.manifest_stale_after);
        channels.insert(
            slug.clone(),
            json!({
                "worker": workers.get(&slug),
                "manifest": manifest,
            }),
        );
    }
    Json(json!({ "status": "ok", "channels": channels })).into_response()
}

pub(super) async fn playlist(
    Path(slug): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    if state.registry.get(&slug).is_none() {
        return error_response(StatusCode::NOT_FOUND, "unknown channel");
    }
    let claims = match authenticate(&state, query.token.as_deref()).await {
        Ok(claims) => claims,
        Err(response) => return response,
    };
    let Some(device_id) = query.device_id.filter(|value| !value.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "device_id is required");
    };

    let limit = claims
        .max_streams
        .unwrap_or_else(|| state.guard.default_max_streams());
    if let Err(SessionError::StreamLimitReached { .. }) =
        state
            .guard
            .on_playlist_request(&claims.subscriber_id, &slug, &device_id, limit)
    {
        return error_response(
            StatusCode::TOO_MANY_REQUESTS,
            "concurrent stream limit reached",
        );
    }

    let dir = state.segment_root.join(&slug);
    let mut playlist = dir.join(MANIFEST_NAME);
    if !playlist.exists() {
        // multi-variant channels only write per-variant playlists; the
        // lowest rung doubles as the default
        playlist = dir.join(variant_playlist_name(0));
    }
    stream_file(&playlist, PLAYLIST_CONTENT_TYPE).await.1
}

pub(super) async fn master_playlist(
    Path(slug): Path<String>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let Some(channel) = state.registry.get(&slug) else {
        return error_response(StatusCode::NOT_FOUND, "unknown channel");
    };
    if let Err(response) = authenticate(&state, query.token.as_deref()).await {
        return response;
    }

    // the pure renderer emits relative variant names; rewrite them to
    // delivery URLs so public deployments hand out signed relay links
    let rendered = render_master_playlist(&channel);
    let mut body = String::with_capacity(rendered.len());
    for line in rendered.lines() {
        if line.ends_with(".m3u8") {
            match state.urls.resource_url(&format!("/stream/{slug}/{line}")) {
                Ok(url) => body.push_str(&url),
                Err(error) => {
                    warn!(%error, "failed to build variant url");
                    return error_response(StatusCode::INTERNAL_SERVER_ERROR, "delivery error");
                }
            }
        } else {
            body.push_str(line);
        }
        body.push('\n');
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PLAYLIST_CONTENT_TYPE),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    (headers, body).into_response()
}

pub(super) async fn segment(
    Path((slug, segment)): Path<(String, String)>,
    Query(query): Query<StreamQuery>,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    // reject traversal attempts before anything touches the filesystem
    if !is_safe_segment_name(&segment) {
        return error_response(StatusCode::BAD_REQUEST, "invalid segment name");
    }
    if state.registry.get(&slug).is_none() {
        return error_response(StatusCode::NOT_FOUND, "unknown channel");
    }

    // a signed relay URL carries its own authorization; everything else
    // needs a subscriber token
    let mut accounted: Option<(SubscriberClaims, String)> = None;
    if let (Some(expires), Some(sig)) = (query.expires, query.sig.as_deref()) {
        let path = format!("/stream/{slug}/{segment}");
        if !state.urls.validate(&path, expires, sig) {
            return error_response(StatusCode::FORBIDDEN, "invalid or expired signature");
        }
    } else {
        let claims = match authenticate(&state, query.token.as_deref()).await {
            Ok(claims) => claims,
            Err(response) => return response,
        };
        if let Some(device_id) = query.device_id.filter(|value| !value.is_empty()) {
            accounted = Some((claims, device_id));
        }
    }

    let path = state.segment_root.join(&slug).join(&segment);
    let content_type = if segment.ends_with(".m3u8") {
        PLAYLIST_CONTENT_TYPE
    } else {
        "video/mp2t"
    };
    let (length, response) = stream_file(&path, content_type).await;

    if let (Some((claims, device_id)), Some(bytes)) = (accounted, length) {
        state
            .guard
            .on_segment_request(&claims.subscriber_id, &slug, &device_id, bytes);
    }
    response
}

pub(super) async fn content_key(
    Path(slug): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
    State(state): State<Arc<GatewayState>>,
) -> Response {
    let Some(channel) = state.registry.get(&slug) else {
        return error_response(StatusCode::NOT_FOUND, "unknown channel");
    };
    let token = bearer_token(&headers).or(query.token.clone());
    if let Err(response) = authenticate(&state, token.as_deref()).await {
        return response;
    }

    let lookup = match query.key_id.as_deref() {
        Some(key_id) => state.keys.key_by_id(key_id),
        None => state.keys.active_key(&channel.id),
    };
    let key = match lookup {
        Ok(Some(key)) if key.channel_id == channel.id => key,
        Ok(_) => return error_response(StatusCode::NOT_FOUND, "no key for channel"),
        Err(error) => {
            warn!(%error, channel = %slug, "key store lookup failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "key store error");
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    (headers, key.key_bytes).into_response()
}

/// Segment names must be plain file names. Anything that could walk the
/// tree is rejected before the path is ever joined.
pub fn is_safe_segment_name(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

async fn authenticate(
    state: &GatewayState,
    token: Option<&str>,
) -> Result<SubscriberClaims, Response> {
    let Some(token) = token.filter(|value| !value.is_empty()) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "missing token"));
    };
    state.validator.validate(token).await.map_err(|error| match error {
        AuthError::MissingToken | AuthError::Rejected => {
            error_response(StatusCode::FORBIDDEN, "access denied")
        }
        AuthError::Unreachable(detail) => {
            warn!(detail = %detail, "identity service unreachable");
            error_response(StatusCode::BAD_GATEWAY, "identity service unavailable")
        }
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|value| value.to_string())
}

/// Opens a file and streams it out. Returns the byte length alongside the
/// response so segment accounting can record what was actually served.
async fn stream_file(path: &FsPath, content_type: &'static str) -> (Option<u64>, Response) {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(_) => {
            return (
                None,
                error_response(StatusCode::NOT_FOUND, "not available"),
            )
        }
    };
    let length = file.metadata().await.map(|meta| meta.len()).ok();
    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    (length, (headers, body).into_response())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
