use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct HometvConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub encoder: EncoderSection,
    pub supervisor: SupervisorSection,
    pub sessions: SessionsSection,
    pub delivery: DeliverySection,
    pub auth: AuthSection,
}

impl HometvConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.base_dir).join(path)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub bind_addr: String,
    pub public_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsSection {
    pub base_dir: String,
    pub segment_dir: String,
    pub sessions_db: String,
    pub keys_db: String,
    pub channels_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EncoderSection {
    pub ffmpeg_path: String,
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSection {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_retries: u32,
    pub retry_window_seconds: u64,
    pub grace_period_seconds: u64,
    pub manifest_stale_seconds: u64,
    pub reconcile_interval_seconds: u64,
}

impl SupervisorSection {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn retry_window(&self) -> Duration {
        Duration::from_secs(self.retry_window_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    pub max_streams: u32,
    pub idle_timeout_seconds: u64,
    pub activity_window_seconds: u64,
    pub lookback_seconds: u64,
    pub reaper_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliverySection {
    pub mode: String,
    pub cdn_base: String,
    pub secret_path: String,
    pub url_ttl_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    pub identity_url: String,
}

pub fn load_hometv_config<P: AsRef<Path>>(path: P) -> Result<HometvConfig> {
    load_toml(path)
}

pub(crate) fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
