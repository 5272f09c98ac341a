//! Ephemeral credential handling for the voice streaming endpoint.
//!
//! The credential issuer is an external collaborator: it returns either a
//! short-lived token with an expiry or a raw API key. The controller treats
//! the token as opaque and simply re-fetches when it has expired.

use crate::error::VoiceError;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// An opaque access token plus an optional expiry timestamp.
#[derive(Clone, Debug)]
pub struct EphemeralCredential {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EphemeralCredential {
    /// Whether the credential can no longer be used to open a session.
    /// Credentials without an expiry never expire.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(at) => at <= Utc::now(),
            None => false,
        }
    }
}

/// Source of usable credentials. Implementations decide whether tokens are
/// minted remotely or a static key is handed through.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch(&self) -> Result<EphemeralCredential, VoiceError>;
}

/// Wire shape returned by the token issuance endpoint.
#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: Option<DateTime<Utc>>,
}

/// Fetches short-lived tokens from an HTTP issuance endpoint.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTokenProvider {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait::async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch(&self) -> Result<EphemeralCredential, VoiceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .send()
            .await
            .map_err(|e| VoiceError::Credential(e.to_string()))?;
        if !response.status().is_success() {
            return Err(VoiceError::Credential(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Credential(format!("malformed token response: {e}")))?;
        Ok(EphemeralCredential {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}

/// Hands a raw API key through unchanged. The key never expires, so the
/// controller will fetch it exactly once.
pub struct StaticKeyProvider {
    key: String,
}

impl StaticKeyProvider {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait::async_trait]
impl TokenProvider for StaticKeyProvider {
    async fn fetch(&self) -> Result<EphemeralCredential, VoiceError> {
        Ok(EphemeralCredential {
            token: self.key.clone(),
            expires_at: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_credential_without_expiry_never_expires() {
        let cred = EphemeralCredential {
            token: "k".to_string(),
            expires_at: None,
        };
        assert!(!cred.is_expired());
    }

    #[test]
    fn test_credential_expiry_boundaries() {
        let fresh = EphemeralCredential {
            token: "t".to_string(),
            expires_at: Some(Utc::now() + Duration::minutes(30)),
        };
        assert!(!fresh.is_expired());

        let stale = EphemeralCredential {
            token: "t".to_string(),
            expires_at: Some(Utc::now() - Duration::seconds(1)),
        };
        assert!(stale.is_expired());
    }

    #[tokio::test]
    async fn test_static_key_provider_round_trip() {
        let provider = StaticKeyProvider::new("raw-api-key");
        let cred = provider.fetch().await.expect("static fetch cannot fail");
        assert_eq!(cred.token, "raw-api-key");
        assert!(cred.expires_at.is_none());
    }

    #[test]
    fn test_token_response_parsing() {
        let body = r#"{"token":"auth_tokens/abc","expiresAt":"2026-01-01T00:00:00Z"}"#;
        let parsed: TokenResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.token, "auth_tokens/abc");
        assert!(parsed.expires_at.is_some());

        let body = r#"{"token":"raw-key"}"#;
        let parsed: TokenResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.expires_at.is_none());
    }
}
