use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::TcpListener;

use hometv_core::access::{ContentKeyStore, DeliveryMode, UrlBuilder};
use hometv_core::gateway::{self, AuthError, GatewayState, SubscriberClaims, TokenValidator};
use hometv_core::supervisor::HealthRegistry;
use hometv_core::{
    Channel, ChannelRegistry, EncodingConfig, EncodingMode, SessionGuard, SessionGuardConfig,
    SourceType, SqliteSessionStore,
};

const SEGMENT_BYTES: usize = 188 * 10;

struct StaticValidator;

#[async_trait]
impl TokenValidator for StaticValidator {
    async fn validate(&self, token: &str) -> Result<SubscriberClaims, AuthError> {
        match token {
            "tok-sub1" => Ok(SubscriberClaims {
                subscriber_id: "sub1".into(),
                max_streams: Some(2),
            }),
            "tok-sub2" => Ok(SubscriberClaims {
                subscriber_id: "sub2".into(),
                max_streams: None,
            }),
            _ => Err(AuthError::Rejected),
        }
    }
}

fn channel(slug: &str, mode: EncodingMode, variants: Vec<String>) -> Channel {
    Channel {
        id: format!("ch-{slug}"),
        slug: slug.into(),
        name: slug.into(),
        source_url: "http://upstream.lan/feed/index.m3u8".into(),
        source_type: SourceType::Hls,
        encoding: EncodingConfig {
            mode,
            variants,
            encrypt: false,
        },
        is_active: true,
    }
}

struct Fixture {
    base: String,
    state: Arc<GatewayState>,
    guard: Arc<SessionGuard>,
    keys: Arc<ContentKeyStore>,
    _dir: TempDir,
}

async fn start_gateway(mode: DeliveryMode) -> Fixture {
    let dir = TempDir::new().unwrap();
    let segment_root = dir.path().join("segments");
    let plain_dir = segment_root.join("plain");
    std::fs::create_dir_all(&plain_dir).unwrap();
    std::fs::write(
        plain_dir.join("stream.m3u8"),
        "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nsegment_000.ts\n",
    )
    .unwrap();
    std::fs::write(plain_dir.join("segment_000.ts"), vec![0u8; SEGMENT_BYTES]).unwrap();

    let registry = Arc::new(ChannelRegistry::new());
    registry.replace_all(&[
        channel("plain", EncodingMode::Passthrough, vec![]),
        channel(
            "news",
            EncodingMode::Transcode,
            vec!["360p".into(), "720p".into()],
        ),
    ]);

    let store = SqliteSessionStore::builder()
        .path(dir.path().join("sessions.sqlite"))
        .build()
        .unwrap();
    store.initialize().unwrap();
    let guard = Arc::new(SessionGuard::new(
        SessionGuardConfig {
            max_streams: 2,
            idle_timeout: chrono::Duration::seconds(60),
            activity_window: chrono::Duration::seconds(30),
            lookback: chrono::Duration::seconds(60),
            reaper_interval: Duration::from_secs(15),
        },
        Arc::new(store),
    ));

    let keys = Arc::new(
        ContentKeyStore::builder()
            .path(dir.path().join("keys.sqlite"))
            .public_base("http://origin.test")
            .build()
            .unwrap(),
    );
    keys.initialize().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let urls = UrlBuilder::new(
        mode,
        "http://origin.test",
        base.clone(),
        b"gateway-secret".to_vec(),
        15,
    );
    let state = Arc::new(GatewayState {
        registry,
        guard: Arc::clone(&guard),
        keys: Arc::clone(&keys),
        validator: Arc::new(StaticValidator),
        urls,
        segment_root,
        health: Arc::new(HealthRegistry::new()),
        manifest_stale_after: Duration::from_secs(30),
    });
    tokio::spawn(gateway::serve(Arc::clone(&state), listener));
    Fixture {
        base,
        state,
        guard,
        keys,
        _dir: dir,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn health_needs_no_auth() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    let response = reqwest::get(format!("{}/health", fixture.base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["channels"]["plain"]["manifest"], "healthy");
    assert_eq!(body["channels"]["news"]["manifest"], "offline");
}

#[tokio::test(flavor = "multi_thread")]
async fn playlist_rejects_missing_and_invalid_tokens() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    let missing = reqwest::get(format!(
        "{}/stream/plain/stream.m3u8?device_id=tv",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(missing.status(), 401);

    let invalid = reqwest::get(format!(
        "{}/stream/plain/stream.m3u8?token=bogus&device_id=tv",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(invalid.status(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn playlist_is_served_to_valid_token() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    let response = reqwest::get(format!(
        "{}/stream/plain/stream.m3u8?token=tok-sub1&device_id=tv",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.starts_with("#EXTM3U"));
    assert_eq!(fixture.guard.active_session_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn third_device_gets_a_capacity_error() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    for device in ["tv", "phone"] {
        let ok = reqwest::get(format!(
            "{}/stream/plain/stream.m3u8?token=tok-sub1&device_id={device}",
            fixture.base
        ))
        .await
        .unwrap();
        assert_eq!(ok.status(), 200);
    }
    let rejected = reqwest::get(format!(
        "{}/stream/plain/stream.m3u8?token=tok-sub1&device_id=laptop",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(rejected.status(), 429);
    let body: serde_json::Value = rejected.json().await.unwrap();
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("concurrent stream limit"));
}

#[tokio::test(flavor = "multi_thread")]
async fn master_playlist_lists_both_variants_in_order() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    let response = reqwest::get(format!(
        "{}/stream/news/master.m3u8?token=tok-sub1",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines[2], "#EXT-X-STREAM-INF:BANDWIDTH=928000,RESOLUTION=640x360");
    assert_eq!(lines[3], "http://origin.test/stream/news/stream_0.m3u8");
    assert_eq!(
        lines[4],
        "#EXT-X-STREAM-INF:BANDWIDTH=2628000,RESOLUTION=1280x720"
    );
    assert_eq!(lines[5], "http://origin.test/stream/news/stream_1.m3u8");
}

#[tokio::test(flavor = "multi_thread")]
async fn traversal_attempts_never_reach_the_filesystem() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    for fragment in ["..%2F..%2Fetc%2Fpasswd", "a%2Fb.ts", "..%5C..%5Cboot.ini"] {
        let response = reqwest::get(format!(
            "{}/stream/plain/{fragment}?token=tok-sub1&device_id=tv",
            fixture.base
        ))
        .await
        .unwrap();
        assert_eq!(response.status(), 400, "fragment {fragment} must be rejected");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn segments_are_served_and_accounted() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    let playlist = reqwest::get(format!(
        "{}/stream/plain/stream.m3u8?token=tok-sub1&device_id=tv",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(playlist.status(), 200);

    let segment = reqwest::get(format!(
        "{}/stream/plain/segment_000.ts?token=tok-sub1&device_id=tv",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(segment.status(), 200);
    assert_eq!(
        segment.headers()["content-type"].to_str().unwrap(),
        "video/mp2t"
    );
    let body = segment.bytes().await.unwrap();
    assert_eq!(body.len(), SEGMENT_BYTES);

    let session = fixture
        .guard
        .on_playlist_request("sub1", "plain", "tv", 2)
        .unwrap();
    assert_eq!(session.bytes_transferred, SEGMENT_BYTES as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn public_mode_serves_signed_urls_without_a_token() {
    let fixture = start_gateway(DeliveryMode::Public).await;
    let signed = fixture
        .state
        .urls
        .resource_url("/stream/plain/segment_000.ts")
        .unwrap();
    let response = reqwest::get(&signed).await.unwrap();
    assert_eq!(response.status(), 200);

    // flip the last signature nibble
    let mut tampered = signed.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == 'a' { 'b' } else { 'a' });
    let rejected = reqwest::get(&tampered).await.unwrap();
    assert_eq!(rejected.status(), 403);

    // neither a token nor a signature
    let bare = reqwest::get(format!(
        "{}/stream/plain/segment_000.ts",
        fixture.base
    ))
    .await
    .unwrap();
    assert_eq!(bare.status(), 401);
}

#[tokio::test(flavor = "multi_thread")]
async fn content_key_requires_a_live_token_and_is_never_cached() {
    let fixture = start_gateway(DeliveryMode::Private).await;
    let first = fixture.keys.generate_key("ch-news", "news").unwrap();

    let client = reqwest::Client::new();
    let unauthorized = client
        .get(format!("{}/stream/news/key", fixture.base))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthorized.status(), 401);

    let authorized = client
        .get(format!("{}/stream/news/key", fixture.base))
        .bearer_auth("tok-sub1")
        .send()
        .await
        .unwrap();
    assert_eq!(authorized.status(), 200);
    assert_eq!(
        authorized.headers()["cache-control"].to_str().unwrap(),
        "no-store"
    );
    let body = authorized.bytes().await.unwrap();
    assert_eq!(body.len(), 16);
    assert_eq!(&body[..], &first.key_bytes[..]);

    // rotation keeps the superseded key reachable by id
    let second = fixture.keys.generate_key("ch-news", "news").unwrap();
    let old = client
        .get(format!(
            "{}/stream/news/key?key_id={}",
            fixture.base, first.key_id
        ))
        .bearer_auth("tok-sub1")
        .send()
        .await
        .unwrap();
    assert_eq!(old.status(), 200);
    assert_eq!(&old.bytes().await.unwrap()[..], &first.key_bytes[..]);

    let current = client
        .get(format!("{}/stream/news/key", fixture.base))
        .bearer_auth("tok-sub1")
        .send()
        .await
        .unwrap();
    assert_eq!(&current.bytes().await.unwrap()[..], &second.key_bytes[..]);
}
