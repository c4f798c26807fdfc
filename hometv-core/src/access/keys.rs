use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::channel::Channel;
use crate::encoder::KEY_INFO_NAME;
use crate::sqlite::configure_connection;

const KEYS_SCHEMA: &str = include_str!("../../sql/keys.sql");
const KEY_FILE_NAME: &str = "enc.key";
pub const KEY_LENGTH: usize = 16;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("failed to open key database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on key database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("key store path not configured")]
    MissingStore,
    #[error("io error at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

/// A channel's AES-128 content key. At most one key per channel is
/// `active`; superseded keys keep their bytes so players holding
/// pre-rotation playlists can still decrypt until their access tokens
/// run out.
#[derive(Debug, Clone)]
pub struct ContentKey {
    pub key_id: String,
    pub channel_id: String,
    pub key_bytes: Vec<u8>,
    pub key_uri: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ContentKeyStoreBuilder {
    path: Option<PathBuf>,
    public_base: String,
    create_if_missing: bool,
}

impl Default for ContentKeyStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            public_base: String::new(),
            create_if_missing: true,
        }
    }
}

impl ContentKeyStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn public_base(mut self, base: impl Into<String>) -> Self {
        self.public_base = base.into();
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> KeyStoreResult<ContentKeyStore> {
        let path = self.path.ok_or(KeyStoreError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(ContentKeyStore {
            path,
            flags,
            public_base: self.public_base,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ContentKeyStore {
    path: PathBuf,
    flags: OpenFlags,
    public_base: String,
}

impl ContentKeyStore {
    pub fn builder() -> ContentKeyStoreBuilder {
        ContentKeyStoreBuilder::new()
    }

    fn open(&self) -> KeyStoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            KeyStoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| KeyStoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> KeyStoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(KEYS_SCHEMA)?;
        Ok(())
    }

    /// Issues a fresh 16-byte key for the channel and makes it the single
    /// active one. The swap is transactional: readers either see the old
    /// key active or the new one, never both or neither.
    pub fn generate_key(&self, channel_id: &str, slug: &str) -> KeyStoreResult<ContentKey> {
        let mut key_bytes = vec![0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key_bytes);
        let key_id = Uuid::new_v4().to_string();
        let key_uri = format!("{}/stream/{}/key?key_id={}", self.public_base, slug, key_id);
        let created_at = Utc::now();

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE content_keys SET active = 0 WHERE channel_id = ?1",
            params![channel_id],
        )?;
        tx.execute(
            "INSERT INTO content_keys (key_id, channel_id, key_bytes, key_uri, active, created_at)
             VALUES (?1, ?2, ?3, ?4, 1, ?5)",
            params![
                &key_id,
                channel_id,
                &key_bytes,
                &key_uri,
                created_at.to_rfc3339()
            ],
        )?;
        tx.commit()?;

        Ok(ContentKey {
            key_id,
            channel_id: channel_id.to_string(),
            key_bytes,
            key_uri,
            active: true,
            created_at,
        })
    }

    pub fn active_key(&self, channel_id: &str) -> KeyStoreResult<Option<ContentKey>> {
        let conn = self.open()?;
        let key = conn
            .query_row(
                "SELECT key_id, channel_id, key_bytes, key_uri, active, created_at
                 FROM content_keys WHERE channel_id = ?1 AND active = 1",
                params![channel_id],
                Self::key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    pub fn key_by_id(&self, key_id: &str) -> KeyStoreResult<Option<ContentKey>> {
        let conn = self.open()?;
        let key = conn
            .query_row(
                "SELECT key_id, channel_id, key_bytes, key_uri, active, created_at
                 FROM content_keys WHERE key_id = ?1",
                params![key_id],
                Self::key_from_row,
            )
            .optional()?;
        Ok(key)
    }

    /// Makes sure the channel has an active key and that the segment
    /// directory carries the `enc.key`/`enc.keyinfo` pair the encoder
    /// references. Called by the worker before each encoder spawn.
    pub fn ensure_key_material(
        &self,
        channel: &Channel,
        output_dir: &Path,
    ) -> KeyStoreResult<ContentKey> {
        let key = match self.active_key(&channel.id)? {
            Some(key) => key,
            None => self.generate_key(&channel.id, &channel.slug)?,
        };
        self.write_key_material(&key, output_dir)?;
        Ok(key)
    }

    fn write_key_material(&self, key: &ContentKey, output_dir: &Path) -> KeyStoreResult<()> {
        fs::create_dir_all(output_dir).map_err(|source| KeyStoreError::Io {
            source,
            path: output_dir.to_path_buf(),
        })?;
        let key_path = output_dir.join(KEY_FILE_NAME);
        fs::write(&key_path, &key.key_bytes).map_err(|source| KeyStoreError::Io {
            source,
            path: key_path.clone(),
        })?;

        let mut iv = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut iv);
        let key_info = format!(
            "{}\n{}\n{}\n",
            key.key_uri,
            key_path.display(),
            hex::encode(iv)
        );
        let info_path = output_dir.join(KEY_INFO_NAME);
        fs::write(&info_path, key_info).map_err(|source| KeyStoreError::Io {
            source,
            path: info_path,
        })?;
        Ok(())
    }

    fn key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContentKey> {
        let created_at: String = row.get("created_at")?;
        Ok(ContentKey {
            key_id: row.get("key_id")?,
            channel_id: row.get("channel_id")?,
            key_bytes: row.get("key_bytes")?,
            key_uri: row.get("key_uri")?,
            active: row.get::<_, i64>("active")? != 0,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
