use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing access token")]
    MissingToken,
    #[error("token rejected")]
    Rejected,
    #[error("identity service unreachable: {0}")]
    Unreachable(String),
}

/// What the identity service knows about a bearer token: who the
/// subscriber is and how many concurrent streams their plan allows.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberClaims {
    pub subscriber_id: String,
    #[serde(default)]
    pub max_streams: Option<u32>,
}

#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<SubscriberClaims, AuthError>;
}

/// Asks the external identity service to resolve a bearer token.
pub struct HttpTokenValidator {
    client: Client,
    endpoint: String,
}

impl HttpTokenValidator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl TokenValidator for HttpTokenValidator {
    async fn validate(&self, token: &str) -> Result<SubscriberClaims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let response = self
            .client
            .get(&self.endpoint)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|error| AuthError::Unreachable(error.to_string()))?;
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            return Err(AuthError::Rejected);
        }
        response
            .error_for_status()
            .map_err(|error| AuthError::Unreachable(error.to_string()))?
            .json()
            .await
            .map_err(|error| AuthError::Unreachable(error.to_string()))
    }
}
