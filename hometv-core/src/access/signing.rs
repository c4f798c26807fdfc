use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing secret is empty")]
    EmptySecret,
    #[error("path is empty")]
    EmptyPath,
}

/// Signs `path` until `expires_at` (Unix seconds) and returns the full
/// relay URL: `{base}{path}?expires={expires_at}&sig={hex}`.
pub fn sign_url(
    base: &str,
    secret: &[u8],
    path: &str,
    expires_at: i64,
) -> Result<String, SigningError> {
    let signature = compute_signature(secret, path, expires_at)?;
    Ok(format!(
        "{base}{path}?expires={expires_at}&sig={}",
        hex::encode(signature)
    ))
}

/// Checks a signature produced by [`sign_url`]. Expiry is rejected before
/// any HMAC work; the comparison itself is constant-time.
pub fn validate_signature(secret: &[u8], path: &str, expires: i64, sig: &str) -> bool {
    validate_signature_at(secret, path, expires, sig, Utc::now().timestamp())
}

pub fn validate_signature_at(
    secret: &[u8],
    path: &str,
    expires: i64,
    sig: &str,
    now: i64,
) -> bool {
    if now > expires {
        return false;
    }
    let Ok(claimed) = hex::decode(sig) else {
        return false;
    };
    let Ok(mac) = mac_for(secret, path, expires) else {
        return false;
    };
    mac.verify_slice(&claimed).is_ok()
}

fn compute_signature(secret: &[u8], path: &str, expires: i64) -> Result<Vec<u8>, SigningError> {
    let mac = mac_for(secret, path, expires)?;
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_for(secret: &[u8], path: &str, expires: i64) -> Result<HmacSha256, SigningError> {
    if secret.is_empty() {
        return Err(SigningError::EmptySecret);
    }
    if path.is_empty() {
        return Err(SigningError::EmptyPath);
    }
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|_| SigningError::EmptySecret)?;
    mac.update(path.as_bytes());
    mac.update(b":");
    mac.update(expires.to_string().as_bytes());
    Ok(mac)
}
