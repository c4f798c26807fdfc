pub mod access;
pub mod channel;
pub mod config;
pub mod encoder;
pub mod error;
pub mod gateway;
pub mod session;
pub mod sqlite;
pub mod supervisor;

pub use access::{
    sign_url, validate_signature, ContentKey, ContentKeyStore, DeliveryMode, SigningError,
    UrlBuilder,
};
pub use channel::{
    load_channel_catalog, Channel, ChannelRegistry, EncodingConfig, EncodingMode, SourceType,
    VariantSpec, AUDIO_BITRATE_KBPS, VARIANT_LADDER,
};
pub use config::{load_hometv_config, HometvConfig};
pub use encoder::{build_encoder_args, render_master_playlist};
pub use error::{ConfigError, Result};
pub use gateway::{GatewayState, HttpTokenValidator, SubscriberClaims, TokenValidator};
pub use session::{
    Session, SessionError, SessionGuard, SessionGuardConfig, SessionStore, SqliteSessionStore,
};
pub use supervisor::{
    probe_manifest, ChannelSupervisor, HealthRegistry, LifecycleState, ManifestHealth,
    SupervisorSettings, WorkerSnapshot, WorkerStatus,
};
