pub mod keys;
pub mod signing;

use chrono::Utc;

pub use keys::{ContentKey, ContentKeyStore, ContentKeyStoreBuilder, KeyStoreError, KEY_LENGTH};
pub use signing::{sign_url, validate_signature, validate_signature_at, SigningError};

/// How delivery URLs are handed out. `Private` deployments sit on a LAN
/// and serve straight from the origin; `Public` deployments hide the
/// origin behind a CDN relay and every URL is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Private,
    Public,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "public" => Ok(Self::Public),
            other => Err(format!("unknown delivery mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UrlBuilder {
    mode: DeliveryMode,
    origin_base: String,
    cdn_base: String,
    secret: Vec<u8>,
    ttl_seconds: i64,
}

impl UrlBuilder {
    pub fn new(
        mode: DeliveryMode,
        origin_base: impl Into<String>,
        cdn_base: impl Into<String>,
        secret: Vec<u8>,
        ttl_minutes: u64,
    ) -> Self {
        Self {
            mode,
            origin_base: origin_base.into(),
            cdn_base: cdn_base.into(),
            secret,
            ttl_seconds: ttl_minutes as i64 * 60,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Returns the URL a client should fetch `path` from: the direct
    /// origin in private mode, a signed CDN-relay URL in public mode.
    /// Playlist and segment requests share the same TTL.
    pub fn resource_url(&self, path: &str) -> Result<String, SigningError> {
        match self.mode {
            DeliveryMode::Private => Ok(format!("{}{}", self.origin_base, path)),
            DeliveryMode::Public => {
                let expires_at = Utc::now().timestamp() + self.ttl_seconds;
                sign_url(&self.cdn_base, &self.secret, path, expires_at)
            }
        }
    }

    /// Checks the `expires`/`sig` pair a relay request carries.
    pub fn validate(&self, path: &str, expires: i64, sig: &str) -> bool {
        validate_signature(&self.secret, path, expires, sig)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_mode_returns_unsigned_origin_url() {
        let builder = UrlBuilder::new(
            DeliveryMode::Private,
            "http://origin.local:8080",
            "https://cdn.example",
            b"secret".to_vec(),
            15,
        );
        let url = builder.resource_url("/stream/news/seg1.ts").unwrap();
        assert_eq!(url, "http://origin.local:8080/stream/news/seg1.ts");
    }

    #[test]
    fn public_mode_signs_with_ttl() {
        let builder = UrlBuilder::new(
            DeliveryMode::Public,
            "http://origin.local:8080",
            "https://cdn.example",
            b"secret".to_vec(),
            15,
        );
        let url = builder.resource_url("/stream/news/seg1.ts").unwrap();
        assert!(url.starts_with("https://cdn.example/stream/news/seg1.ts?expires="));
        assert!(url.contains("&sig="));
    }
}
