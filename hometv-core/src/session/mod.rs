pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::SessionsSection;

pub use store::{
    SessionStore, SessionStoreError, SessionStoreResult, SqliteSessionStore,
    SqliteSessionStoreBuilder,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("subscriber {subscriber_id} reached the concurrent stream limit ({limit})")]
    StreamLimitReached { subscriber_id: String, limit: u32 },
}

/// One subscriber/device/channel streaming session. The guard's copy is
/// the authoritative one; the durable row trails it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub subscriber_id: String,
    pub channel_slug: String,
    pub device_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone)]
pub struct SessionGuardConfig {
    pub max_streams: u32,
    pub idle_timeout: Duration,
    pub activity_window: Duration,
    pub lookback: Duration,
    pub reaper_interval: std::time::Duration,
}

impl SessionGuardConfig {
    pub fn from_section(section: &SessionsSection) -> Self {
        Self {
            max_streams: section.max_streams,
            idle_timeout: Duration::seconds(section.idle_timeout_seconds as i64),
            activity_window: Duration::seconds(section.activity_window_seconds as i64),
            lookback: Duration::seconds(section.lookback_seconds as i64),
            reaper_interval: std::time::Duration::from_secs(section.reaper_interval_seconds),
        }
    }
}

type SessionKey = (String, String, String);

#[derive(Default)]
struct GuardState {
    sessions: HashMap<SessionKey, Session>,
    device_activity: HashMap<String, HashMap<String, DateTime<Utc>>>,
}

/// Tracks live sessions and enforces the per-subscriber concurrent-stream
/// ceiling. All mutable state sits behind one lock; the lock is only ever
/// held for in-memory work, durable writes go through detached tasks.
pub struct SessionGuard {
    config: SessionGuardConfig,
    store: Arc<dyn SessionStore>,
    inner: Mutex<GuardState>,
}

impl SessionGuard {
    pub fn new(config: SessionGuardConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            config,
            store,
            inner: Mutex::new(GuardState::default()),
        }
    }

    pub fn default_max_streams(&self) -> u32 {
        self.config.max_streams
    }

    /// Admission check for a playlist request. Counts the subscriber's
    /// *other* recently-active devices against the plan ceiling, then
    /// refreshes this device and returns its session (creating one on
    /// first contact).
    pub fn on_playlist_request(
        &self,
        subscriber_id: &str,
        channel_slug: &str,
        device_id: &str,
        max_streams: u32,
    ) -> Result<Session, SessionError> {
        let now = Utc::now();
        let (session, created) = {
            let mut state = self.inner.lock().unwrap();
            let devices = state
                .device_activity
                .entry(subscriber_id.to_string())
                .or_default();
            devices.retain(|_, seen| now - *seen <= self.config.lookback);
            let active_others = devices
                .iter()
                .filter(|(device, seen)| {
                    device.as_str() != device_id && now - **seen <= self.config.activity_window
                })
                .count() as u32;
            if active_others >= max_streams {
                return Err(SessionError::StreamLimitReached {
                    subscriber_id: subscriber_id.to_string(),
                    limit: max_streams,
                });
            }
            devices.insert(device_id.to_string(), now);

            let key = (
                subscriber_id.to_string(),
                channel_slug.to_string(),
                device_id.to_string(),
            );
            match state.sessions.get_mut(&key) {
                Some(session) => {
                    session.last_activity = now;
                    (session.clone(), false)
                }
                None => {
                    let session = Session {
                        id: Uuid::new_v4().to_string(),
                        subscriber_id: subscriber_id.to_string(),
                        channel_slug: channel_slug.to_string(),
                        device_id: device_id.to_string(),
                        started_at: now,
                        last_activity: now,
                        bytes_transferred: 0,
                    };
                    state.sessions.insert(key, session.clone());
                    (session, true)
                }
            }
        };
        if created {
            self.persist_detached(session.clone());
        }
        Ok(session)
    }

    /// Activity refresh for a segment request. No-op when the triple has
    /// no session. The byte counter is flushed by a detached task:
    /// at-least-once accounting, a crash between the in-memory bump and
    /// the flush loses that increment.
    pub fn on_segment_request(
        &self,
        subscriber_id: &str,
        channel_slug: &str,
        device_id: &str,
        byte_count: u64,
    ) {
        let now = Utc::now();
        let session_id = {
            let mut state = self.inner.lock().unwrap();
            let key = (
                subscriber_id.to_string(),
                channel_slug.to_string(),
                device_id.to_string(),
            );
            let Some(session) = state.sessions.get_mut(&key) else {
                return;
            };
            session.last_activity = now;
            session.bytes_transferred += byte_count;
            let id = session.id.clone();
            state
                .device_activity
                .entry(subscriber_id.to_string())
                .or_default()
                .insert(device_id.to_string(), now);
            id
        };

        let store = self.store.clone();
        tokio::spawn(async move {
            let flush =
                tokio::task::spawn_blocking(move || store.add_bytes(&session_id, byte_count, now))
                    .await;
            match flush {
                Ok(Err(error)) => warn!(%error, "byte-count flush failed"),
                Err(error) => warn!(%error, "byte-count flush task panicked"),
                Ok(Ok(())) => {}
            }
        });
    }

    /// Closes every session idle past the timeout and drops it from the
    /// concurrency-counting state. Returns the closed sessions.
    pub fn expire_idle(&self) -> Vec<Session> {
        let now = Utc::now();
        let expired: Vec<Session> = {
            let mut state = self.inner.lock().unwrap();
            let idle_keys: Vec<SessionKey> = state
                .sessions
                .iter()
                .filter(|(_, session)| now - session.last_activity > self.config.idle_timeout)
                .map(|(key, _)| key.clone())
                .collect();
            let mut expired = Vec::with_capacity(idle_keys.len());
            for key in idle_keys {
                if let Some(session) = state.sessions.remove(&key) {
                    if let Some(devices) = state.device_activity.get_mut(&session.subscriber_id) {
                        devices.remove(&session.device_id);
                    }
                    expired.push(session);
                }
            }
            state.device_activity.retain(|_, devices| !devices.is_empty());
            expired
        };

        for session in &expired {
            let store = self.store.clone();
            let id = session.id.clone();
            tokio::spawn(async move {
                let flush = tokio::task::spawn_blocking(move || store.close(&id, now)).await;
                match flush {
                    Ok(Err(error)) => warn!(%error, "session close flush failed"),
                    Err(error) => warn!(%error, "session close task panicked"),
                    Ok(Ok(())) => {}
                }
            });
        }
        expired
    }

    pub fn active_session_count(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    /// Periodic idle reaper. Runs until the shutdown signal flips.
    pub fn spawn_reaper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(guard.config.reaper_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let closed = guard.expire_idle();
                        if !closed.is_empty() {
                            debug!(count = closed.len(), "closed idle sessions");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn persist_detached(&self, session: Session) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let flush = tokio::task::spawn_blocking(move || store.persist(&session)).await;
            match flush {
                Ok(Err(error)) => warn!(%error, "session persist failed"),
                Err(error) => warn!(%error, "session persist task panicked"),
                Ok(Ok(())) => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct NullStore;

    impl SessionStore for NullStore {
        fn persist(&self, _session: &Session) -> SessionStoreResult<()> {
            Ok(())
        }

        fn add_bytes(
            &self,
            _session_id: &str,
            _bytes: u64,
            _at: DateTime<Utc>,
        ) -> SessionStoreResult<()> {
            Ok(())
        }

        fn close(&self, _session_id: &str, _ended_at: DateTime<Utc>) -> SessionStoreResult<()> {
            Ok(())
        }
    }

    fn guard(config: SessionGuardConfig) -> SessionGuard {
        SessionGuard::new(config, Arc::new(NullStore))
    }

    fn fast_config() -> SessionGuardConfig {
        SessionGuardConfig {
            max_streams: 2,
            idle_timeout: Duration::milliseconds(50),
            activity_window: Duration::milliseconds(50),
            lookback: Duration::milliseconds(100),
            reaper_interval: std::time::Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn third_device_is_rejected_at_ceiling() {
        let guard = guard(fast_config());
        guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        guard.on_playlist_request("sub1", "news", "dev-b", 2).unwrap();
        let rejected = guard.on_playlist_request("sub1", "news", "dev-c", 2);
        assert!(matches!(
            rejected,
            Err(SessionError::StreamLimitReached { limit: 2, .. })
        ));
    }

    #[tokio::test]
    async fn existing_device_is_never_counted_against_itself() {
        let guard = guard(fast_config());
        guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        guard.on_playlist_request("sub1", "news", "dev-b", 2).unwrap();
        // both devices can keep refreshing
        guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        guard.on_playlist_request("sub1", "news", "dev-b", 2).unwrap();
    }

    #[tokio::test]
    async fn idle_devices_free_capacity() {
        let guard = guard(fast_config());
        guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        guard.on_playlist_request("sub1", "news", "dev-b", 2).unwrap();
        assert!(guard.on_playlist_request("sub1", "news", "dev-c", 2).is_err());

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        guard.on_playlist_request("sub1", "news", "dev-c", 2).unwrap();
    }

    #[tokio::test]
    async fn playlist_request_reuses_session_for_triple() {
        let guard = guard(fast_config());
        let first = guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        let second = guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn segment_request_without_session_is_noop() {
        let guard = guard(fast_config());
        guard.on_segment_request("sub1", "news", "dev-a", 1024);
        assert_eq!(guard.active_session_count(), 0);
    }

    #[tokio::test]
    async fn reaper_closes_idle_sessions() {
        let guard = guard(fast_config());
        guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        assert_eq!(guard.active_session_count(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        let closed = guard.expire_idle();
        assert_eq!(closed.len(), 1);
        assert_eq!(guard.active_session_count(), 0);
    }

    #[tokio::test]
    async fn bytes_accumulate_in_memory() {
        let guard = guard(fast_config());
        guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        guard.on_segment_request("sub1", "news", "dev-a", 1000);
        guard.on_segment_request("sub1", "news", "dev-a", 500);
        let session = guard.on_playlist_request("sub1", "news", "dev-a", 2).unwrap();
        assert_eq!(session.bytes_transferred, 1500);
    }
}
