use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::access::ContentKeyStore;
use crate::channel::Channel;
use crate::encoder::build_encoder_args;

use super::health::{HealthCallback, WorkerStatus};
use super::SupervisorSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Healthy,
    Backoff,
    Fatal,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub state: LifecycleState,
    pub pid: Option<u32>,
    pub consecutive_failures: u32,
    pub total_restarts: u64,
    pub last_exit_code: Option<i32>,
}

#[derive(Debug)]
pub(super) struct WorkerShared {
    state: Mutex<WorkerState>,
}

#[derive(Debug)]
struct WorkerState {
    state: LifecycleState,
    pid: Option<u32>,
    consecutive_failures: u32,
    total_restarts: u64,
    last_exit_code: Option<i32>,
    recent_restarts: VecDeque<DateTime<Utc>>,
}

impl WorkerShared {
    pub(super) fn new() -> Self {
        Self {
            state: Mutex::new(WorkerState {
                state: LifecycleState::Stopped,
                pid: None,
                consecutive_failures: 0,
                total_restarts: 0,
                last_exit_code: None,
                recent_restarts: VecDeque::new(),
            }),
        }
    }

    pub(super) fn snapshot(&self) -> WorkerSnapshot {
        let state = self.state.lock().unwrap();
        WorkerSnapshot {
            state: state.state,
            pid: state.pid,
            consecutive_failures: state.consecutive_failures,
            total_restarts: state.total_restarts,
            last_exit_code: state.last_exit_code,
        }
    }

    fn set_state(&self, value: LifecycleState) {
        self.state.lock().unwrap().state = value;
    }
}

/// Delay before restart attempt `failures` (1-based):
/// `min(base * 2^(failures-1), max)`.
pub fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (failures - 1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}

pub(super) async fn run_worker(
    channel: Channel,
    settings: SupervisorSettings,
    keys: Option<Arc<ContentKeyStore>>,
    shared: Arc<WorkerShared>,
    health: HealthCallback,
    mut stop: watch::Receiver<bool>,
) {
    let output_dir = settings.segment_root.join(&channel.slug);
    let window = chrono::Duration::from_std(settings.retry_window)
        .unwrap_or_else(|_| chrono::Duration::seconds(300));
    let mut started_once = false;

    loop {
        if *stop.borrow() {
            shared.set_state(LifecycleState::Stopped);
            return;
        }

        {
            let mut state = shared.state.lock().unwrap();
            let now = Utc::now();
            while state
                .recent_restarts
                .front()
                .map(|timestamp| *timestamp < now - window)
                .unwrap_or(false)
            {
                state.recent_restarts.pop_front();
            }
            if state.recent_restarts.len() as u32 >= settings.max_retries {
                state.state = LifecycleState::Fatal;
                drop(state);
                (health)(&channel.slug, WorkerStatus::Unhealthy);
                error!(
                    channel = %channel.slug,
                    retries = settings.max_retries,
                    "restart ceiling reached, supervision suspended until next reconciliation"
                );
                return;
            }
            state.state = LifecycleState::Starting;
            state.pid = None;
        }
        (health)(&channel.slug, WorkerStatus::Starting);

        if let Err(error) = tokio::fs::create_dir_all(&output_dir).await {
            warn!(channel = %channel.slug, %error, "failed to create segment directory");
            if record_failure(&shared, &channel, &settings, &health, None, &mut stop).await {
                return;
            }
            continue;
        }

        if channel.encoding.encrypt {
            if let Some(store) = keys.as_ref() {
                if let Err(error) = store.ensure_key_material(&channel, &output_dir) {
                    warn!(channel = %channel.slug, %error, "failed to prepare key material");
                    if record_failure(&shared, &channel, &settings, &health, None, &mut stop).await
                    {
                        return;
                    }
                    continue;
                }
            }
        }

        let mut command = Command::new(&settings.ffmpeg_path);
        command
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg(&settings.log_level)
            .arg("-y");
        for arg in build_encoder_args(&channel, &output_dir) {
            command.arg(arg);
        }
        command.kill_on_drop(true);
        info!(
            channel = %channel.slug,
            source = %channel.redacted_source(),
            "spawning encoder"
        );
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                warn!(channel = %channel.slug, %error, "failed to spawn encoder");
                if record_failure(&shared, &channel, &settings, &health, None, &mut stop).await {
                    return;
                }
                continue;
            }
        };

        // Capture the pid under the lifecycle lock right after the spawn;
        // no other task ever reads the live child handle.
        {
            let mut state = shared.state.lock().unwrap();
            state.pid = child.id();
            state.state = LifecycleState::Healthy;
            if started_once {
                state.total_restarts += 1;
            }
        }
        started_once = true;
        (health)(&channel.slug, WorkerStatus::Healthy);

        let exit = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop.changed() => None,
        };

        match exit {
            None => {
                shutdown_child(&mut child, settings.grace_period, &channel.slug).await;
                shared.set_state(LifecycleState::Stopped);
                return;
            }
            Some(Err(error)) => {
                warn!(channel = %channel.slug, %error, "failed to wait on encoder");
                if record_failure(&shared, &channel, &settings, &health, None, &mut stop).await {
                    return;
                }
            }
            Some(Ok(status)) => {
                let code = status.code();
                if status.success() {
                    // A clean exit is not a crash: forgive prior failures
                    // and keep supervising.
                    let mut state = shared.state.lock().unwrap();
                    state.pid = None;
                    state.last_exit_code = code;
                    state.consecutive_failures = 0;
                    state.recent_restarts.clear();
                    drop(state);
                    info!(channel = %channel.slug, "encoder exited cleanly, restarting");
                } else if record_failure(&shared, &channel, &settings, &health, code, &mut stop)
                    .await
                {
                    return;
                }
            }
        }
    }
}

/// Records a failed attempt and sleeps out the back-off. Returns `true`
/// when a stop request interrupted the sleep.
async fn record_failure(
    shared: &Arc<WorkerShared>,
    channel: &Channel,
    settings: &SupervisorSettings,
    health: &HealthCallback,
    code: Option<i32>,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    let failures = {
        let mut state = shared.state.lock().unwrap();
        state.pid = None;
        state.last_exit_code = code;
        state.consecutive_failures += 1;
        state.recent_restarts.push_back(Utc::now());
        state.state = LifecycleState::Backoff;
        state.consecutive_failures
    };
    (health)(&channel.slug, WorkerStatus::Restarting);
    let delay = backoff_delay(settings.backoff_base, settings.backoff_max, failures);
    warn!(
        channel = %channel.slug,
        code = ?code,
        failures,
        delay_ms = delay.as_millis() as u64,
        "encoder failed, backing off"
    );
    tokio::select! {
        _ = sleep(delay) => false,
        _ = stop.changed() => {
            shared.set_state(LifecycleState::Stopped);
            true
        }
    }
}

/// Asks the encoder to stop, waits out the grace period, then kills it.
/// Partially-written segments are dropped from the next playlist window,
/// so a forced kill only costs the segment in flight.
async fn shutdown_child(child: &mut Child, grace: Duration, slug: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    let deadline = tokio::time::Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                info!(channel = slug, code = ?status.code(), "encoder stopped");
                return;
            }
            Ok(None) => {
                if tokio::time::Instant::now() >= deadline {
                    break;
                }
                sleep(Duration::from_millis(100)).await;
            }
            Err(_) => break,
        }
    }
    warn!(channel = slug, "encoder ignored termination signal, killing");
    let _ = child.start_kill();
    let _ = child.wait().await;
}
