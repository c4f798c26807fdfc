use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::encoder::{variant_playlist_name, MANIFEST_NAME};

/// Status reported through the supervisor's health callback on every
/// worker state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Starting,
    Healthy,
    Restarting,
    Unhealthy,
}

/// Outcome of the manifest mtime probe. A worker can be alive while its
/// source has stalled, so this check is independent of process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestHealth {
    Healthy,
    Stale,
    Offline,
}

pub type HealthCallback = Arc<dyn Fn(&str, WorkerStatus) + Send + Sync>;

/// Latest per-channel worker status, fed by the supervisor callback and
/// read by the health endpoint without polling anything.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    states: Mutex<HashMap<String, WorkerStatus>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, slug: &str, status: WorkerStatus) {
        self.states
            .lock()
            .unwrap()
            .insert(slug.to_string(), status);
    }

    pub fn remove(&self, slug: &str) {
        self.states.lock().unwrap().remove(slug);
    }

    pub fn status(&self, slug: &str) -> Option<WorkerStatus> {
        self.states.lock().unwrap().get(slug).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, WorkerStatus> {
        self.states.lock().unwrap().clone()
    }

    pub fn callback(self: &Arc<Self>) -> HealthCallback {
        let registry = Arc::clone(self);
        Arc::new(move |slug, status| registry.record(slug, status))
    }
}

/// Checks how recently the channel's playlist was rewritten: `Healthy`
/// within `stale_after`, `Stale` beyond it, `Offline` when no playlist
/// exists at all. Multi-variant channels are probed through their first
/// variant playlist.
pub fn probe_manifest(segment_root: &Path, slug: &str, stale_after: Duration) -> ManifestHealth {
    let dir = segment_root.join(slug);
    let mut manifest = dir.join(MANIFEST_NAME);
    if !manifest.exists() {
        manifest = dir.join(variant_playlist_name(0));
    }
    let Ok(metadata) = std::fs::metadata(&manifest) else {
        return ManifestHealth::Offline;
    };
    match metadata.modified().ok().and_then(|mtime| mtime.elapsed().ok()) {
        Some(age) if age <= stale_after => ManifestHealth::Healthy,
        Some(_) => ManifestHealth::Stale,
        // mtime in the future means a write raced the probe
        None => ManifestHealth::Healthy,
    }
}
