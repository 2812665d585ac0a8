//! Request authentication.
//!
//! API keys are random 32-byte tokens with a fixed prefix, stored only as
//! hex-encoded SHA-256 digests. JWT validation is an external collaborator:
//! the pipeline consumes its claims through the [`JwtVerifier`] trait.

use crate::error::{GatewayError, Result};
use crate::model::ApiKey;
use crate::repository::ApiKeyRepository;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Prefix of every issued key's plaintext.
pub const KEY_PREFIX: &str = "ve_live_";

/// Length of the random portion in hex characters.
const KEY_HEX_LEN: usize = 64;

/// Generates a fresh API key.
///
/// Returns `(plaintext, key_hash)`. The plaintext is `ve_live_` plus 64
/// lowercase hex characters and must be handed to the caller exactly once;
/// only the hash is ever persisted.
pub fn generate_key() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let plaintext = format!("{}{}", KEY_PREFIX, hex::encode(bytes));
    let key_hash = hash_key(&plaintext);
    (plaintext, key_hash)
}

/// Hex-encoded SHA-256 of a presented key, prefix included.
pub fn hash_key(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Display prefix stored alongside the hash (first 12 characters).
pub fn display_prefix(plaintext: &str) -> String {
    plaintext.chars().take(12).collect()
}

/// Checks a plaintext key for the expected shape before hashing.
pub fn is_well_formed(plaintext: &str) -> bool {
    plaintext
        .strip_prefix(KEY_PREFIX)
        .is_some_and(|rest| rest.len() == KEY_HEX_LEN && rest.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Claims produced by the external JWT collaborator.
#[derive(Debug, Clone)]
pub struct JwtClaims {
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
}

/// External token validation boundary.
///
/// The gateway only consumes the outcome; signature and issuer checks live
/// behind this trait.
pub trait JwtVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<JwtClaims>;
}

/// Who a request turned out to be, after the auth stage.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub api_key_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// "api_key" or "jwt"; `None` for anonymous routes.
    pub method: Option<&'static str>,
}

/// Validates presented API keys against the key store.
pub struct ApiKeyValidator {
    api_keys: Arc<dyn ApiKeyRepository>,
}

impl ApiKeyValidator {
    pub fn new(api_keys: Arc<dyn ApiKeyRepository>) -> Self {
        Self { api_keys }
    }

    /// Validates a presented key and records its use.
    ///
    /// Accepts the raw key or an `Authorization` value with a `Bearer ` or
    /// `ApiKey ` prefix. Fails for unknown, inactive, or expired keys.
    pub async fn validate(&self, presented: &str, at: DateTime<Utc>) -> Result<ApiKey> {
        let presented = presented
            .trim()
            .trim_start_matches("Bearer ")
            .trim_start_matches("ApiKey ");
        if presented.is_empty() {
            return Err(GatewayError::AuthFailed("api key is empty".to_string()));
        }

        let key = self.api_keys.get_by_hash(&hash_key(presented)).await?;

        if !key.is_active {
            return Err(GatewayError::AuthFailed("api key is inactive".to_string()));
        }
        if key.is_expired(at) {
            return Err(GatewayError::AuthFailed("api key is expired".to_string()));
        }

        if let Err(e) = self.api_keys.record_usage(key.id).await {
            debug!(error = %e, "failed to record api key usage");
        }

        Ok(key)
    }
}

/// Creates and stores a key for a tenant, returning the entity and the
/// plaintext (the only time it exists outside the caller's hands).
pub async fn issue_key(
    api_keys: &Arc<dyn ApiKeyRepository>,
    tenant_id: Uuid,
    name: impl Into<String>,
    scopes: Vec<String>,
) -> Result<(ApiKey, String)> {
    let (plaintext, key_hash) = generate_key();
    let key = ApiKey {
        id: Uuid::new_v4(),
        tenant_id,
        user_id: None,
        name: name.into(),
        key_prefix: display_prefix(&plaintext),
        key_hash,
        scopes,
        expires_at: None,
        last_used_at: None,
        usage_count: 0,
        is_active: true,
        created_at: Utc::now(),
    };
    let stored = api_keys.create(key).await?;
    Ok((stored, plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryApiKeyRepository;

    #[test]
    fn test_generated_key_shape() {
        let (plaintext, key_hash) = generate_key();
        assert!(plaintext.starts_with(KEY_PREFIX));
        assert_eq!(plaintext.len(), KEY_PREFIX.len() + KEY_HEX_LEN);
        assert!(is_well_formed(&plaintext));
        assert_eq!(key_hash, hash_key(&plaintext));
        assert_eq!(key_hash.len(), 64);
    }

    #[test]
    fn test_keys_are_unique() {
        let (a, _) = generate_key();
        let (b, _) = generate_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_malformed_keys_rejected_by_shape_check() {
        assert!(!is_well_formed("ve_live_short"));
        assert!(!is_well_formed("other_prefix_0000"));
        let (plaintext, _) = generate_key();
        assert!(!is_well_formed(&plaintext[..plaintext.len() - 1]));
    }

    #[tokio::test]
    async fn test_validate_round_trip() {
        let repo: Arc<dyn ApiKeyRepository> = Arc::new(InMemoryApiKeyRepository::new());
        let tenant_id = Uuid::new_v4();
        let (stored, plaintext) = issue_key(&repo, tenant_id, "ci", vec!["*".into()])
            .await
            .unwrap();

        let validator = ApiKeyValidator::new(Arc::clone(&repo));
        let validated = validator.validate(&plaintext, Utc::now()).await.unwrap();
        assert_eq!(validated.id, stored.id);
        assert_eq!(validated.tenant_id, tenant_id);

        // Usage was recorded.
        let fresh = repo.get_by_id(stored.id).await.unwrap();
        assert_eq!(fresh.usage_count, 1);
        assert!(fresh.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_validate_accepts_bearer_prefix() {
        let repo: Arc<dyn ApiKeyRepository> = Arc::new(InMemoryApiKeyRepository::new());
        let (_, plaintext) = issue_key(&repo, Uuid::new_v4(), "ci", vec![]).await.unwrap();

        let validator = ApiKeyValidator::new(Arc::clone(&repo));
        let presented = format!("Bearer {}", plaintext);
        assert!(validator.validate(&presented, Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_validate_rejects_one_bit_change() {
        let repo: Arc<dyn ApiKeyRepository> = Arc::new(InMemoryApiKeyRepository::new());
        let (_, plaintext) = issue_key(&repo, Uuid::new_v4(), "ci", vec![]).await.unwrap();

        // Flip the final hex digit.
        let mut corrupted = plaintext.clone();
        let last = corrupted.pop().unwrap();
        corrupted.push(if last == '0' { '1' } else { '0' });

        let validator = ApiKeyValidator::new(Arc::clone(&repo));
        assert!(validator.validate(&corrupted, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn test_validate_rejects_inactive_and_expired() {
        let repo: Arc<dyn ApiKeyRepository> = Arc::new(InMemoryApiKeyRepository::new());
        let validator = ApiKeyValidator::new(Arc::clone(&repo));

        let (mut stored, plaintext) = issue_key(&repo, Uuid::new_v4(), "ci", vec![])
            .await
            .unwrap();

        stored.is_active = false;
        repo.update(stored.clone()).await.unwrap();
        assert!(validator.validate(&plaintext, Utc::now()).await.is_err());

        stored.is_active = true;
        stored.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        repo.update(stored).await.unwrap();
        assert!(validator.validate(&plaintext, Utc::now()).await.is_err());
    }
}
