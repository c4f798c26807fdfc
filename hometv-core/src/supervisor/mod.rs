pub mod health;
mod worker;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::ContentKeyStore;
use crate::channel::Channel;
use crate::config::{EncoderSection, SupervisorSection};

pub use health::{probe_manifest, HealthCallback, HealthRegistry, ManifestHealth, WorkerStatus};
pub use worker::{backoff_delay, LifecycleState, WorkerSnapshot};

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub ffmpeg_path: PathBuf,
    pub log_level: String,
    pub segment_root: PathBuf,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub max_retries: u32,
    pub retry_window: Duration,
    pub grace_period: Duration,
}

impl SupervisorSettings {
    pub fn from_config(
        encoder: &EncoderSection,
        supervisor: &SupervisorSection,
        segment_root: PathBuf,
    ) -> Self {
        Self {
            ffmpeg_path: PathBuf::from(&encoder.ffmpeg_path),
            log_level: encoder.log_level.clone(),
            segment_root,
            backoff_base: supervisor.backoff_base(),
            backoff_max: supervisor.backoff_max(),
            max_retries: supervisor.max_retries,
            retry_window: supervisor.retry_window(),
            grace_period: supervisor.grace_period(),
        }
    }
}

struct WorkerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    shared: Arc<worker::WorkerShared>,
}

/// Owns one worker task per supervised channel and reconciles the set of
/// workers against the desired channel list.
pub struct ChannelSupervisor {
    settings: SupervisorSettings,
    keys: Option<Arc<ContentKeyStore>>,
    health: HealthCallback,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl ChannelSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        keys: Option<Arc<ContentKeyStore>>,
        health: HealthCallback,
    ) -> Self {
        Self {
            settings,
            keys,
            health,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Diffs the desired active-channel set against running workers:
    /// missing-from-desired workers are stopped, newly-desired channels
    /// get a fresh worker. Workers whose task already exited (Fatal or
    /// stopped) are replaced, which is how a Fatal channel comes back.
    pub async fn sync(&self, channels: &[Channel]) {
        let desired: Vec<&Channel> = channels.iter().filter(|channel| channel.is_active).collect();
        let desired_slugs: HashSet<String> =
            desired.iter().map(|channel| channel.slug.clone()).collect();

        let mut stopped = Vec::new();
        {
            let mut workers = self.workers.lock().unwrap();
            let obsolete: Vec<String> = workers
                .iter()
                .filter(|(slug, handle)| {
                    !desired_slugs.contains(slug.as_str()) || handle.task.is_finished()
                })
                .map(|(slug, _)| slug.clone())
                .collect();
            for slug in obsolete {
                if let Some(handle) = workers.remove(&slug) {
                    stopped.push((slug, handle));
                }
            }
            for channel in &desired {
                if !workers.contains_key(&channel.slug) {
                    info!(
                        channel = %channel.slug,
                        source = %channel.redacted_source(),
                        "supervising channel"
                    );
                    let handle = self.spawn_worker((*channel).clone());
                    workers.insert(channel.slug.clone(), handle);
                }
            }
        }

        let grace = self.settings.grace_period;
        let removed: Vec<String> = futures::future::join_all(stopped.into_iter().map(
            |(slug, handle)| async move {
                stop_worker(&slug, handle, grace).await;
                slug
            },
        ))
        .await;

        for slug in removed {
            if !desired_slugs.contains(&slug) {
                self.cleanup_channel_dir(&slug);
            }
        }
    }

    /// Stops every worker concurrently. Returns once all workers exited
    /// or the grace period elapsed, whichever comes first.
    pub async fn stop_all(&self) {
        let drained: Vec<(String, WorkerHandle)> =
            { self.workers.lock().unwrap().drain().collect() };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "stopping all channel workers");
        let grace = self.settings.grace_period;
        futures::future::join_all(
            drained
                .into_iter()
                .map(|(slug, handle)| async move { stop_worker(&slug, handle, grace).await }),
        )
        .await;
    }

    pub fn snapshot(&self, slug: &str) -> Option<WorkerSnapshot> {
        self.workers
            .lock()
            .unwrap()
            .get(slug)
            .map(|handle| handle.shared.snapshot())
    }

    pub fn snapshots(&self) -> HashMap<String, WorkerSnapshot> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|(slug, handle)| (slug.clone(), handle.shared.snapshot()))
            .collect()
    }

    pub fn supervised_count(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    fn spawn_worker(&self, channel: Channel) -> WorkerHandle {
        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(worker::WorkerShared::new());
        let task = tokio::spawn(worker::run_worker(
            channel,
            self.settings.clone(),
            self.keys.clone(),
            Arc::clone(&shared),
            Arc::clone(&self.health),
            stop_rx,
        ));
        WorkerHandle { stop, task, shared }
    }

    /// Best-effort removal of a retired channel's segment directory,
    /// detached from the reconciliation pass.
    fn cleanup_channel_dir(&self, slug: &str) {
        let dir = self.settings.segment_root.join(slug);
        let slug = slug.to_string();
        tokio::spawn(async move {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!(channel = %slug, "removed segment directory"),
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(channel = %slug, %error, "failed to remove segment directory");
                }
            }
        });
    }
}

async fn stop_worker(slug: &str, mut handle: WorkerHandle, grace: Duration) {
    let _ = handle.stop.send(true);
    // the worker itself waits out the grace period before force-killing;
    // give it one extra second before abandoning the task
    let deadline = grace + Duration::from_secs(1);
    if tokio::time::timeout(deadline, &mut handle.task).await.is_err() {
        warn!(channel = slug, "worker exceeded shutdown grace period, aborting");
        handle.task.abort();
    } else {
        debug!(channel = slug, "worker stopped");
    }
}
