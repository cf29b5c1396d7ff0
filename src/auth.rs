//! Auth Gate (C10): admin login/session issuance, request bearer
//! validation, and per-IP login rate-limiting.

use crate::config::Config;
use crate::error::ApiError;
use crate::models::AuthToken;
use crate::store::Store;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

const SESSION_TTL_SECS: i64 = 24 * 3600;
const LOCKOUT_THRESHOLD: u32 = 5;
const BASE_LOCKOUT_SECS: u64 = 30;

pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct LoginAttempts {
    failures: u32,
    locked_until: i64,
}

/// Request-authentication outcome: either a store-backed token (subject to
/// `allowed_models`/cost-cap enforcement) or a static bearer from
/// `AUTH_TOKENS` (unrestricted, not logged with an `auth_token_id`).
pub enum AuthResult {
    Token(AuthToken),
    StaticBearer,
}

pub struct AuthGate {
    store: Arc<dyn Store>,
    admin_password: String,
    static_bearers: Vec<String>,
    login_attempts: RwLock<HashMap<IpAddr, LoginAttempts>>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            admin_password: config.admin_password.clone(),
            static_bearers: config.auth_tokens.clone(),
            login_attempts: RwLock::new(HashMap::new()),
        }
    }

    /// Admin login: checked against the per-IP lockout first, then the
    /// configured admin password. On success mints and stores a session.
    pub async fn login(&self, ip: IpAddr, password: &str, now: i64) -> Result<(String, i64), ApiError> {
        {
            let attempts = self.login_attempts.read().await;
            if let Some(state) = attempts.get(&ip) {
                if state.locked_until > now {
                    return Err(ApiError::TooManyRequests((state.locked_until - now) as u64));
                }
            }
        }

        if password != self.admin_password {
            let mut attempts = self.login_attempts.write().await;
            let entry = attempts.entry(ip).or_insert(LoginAttempts { failures: 0, locked_until: 0 });
            entry.failures += 1;
            if entry.failures >= LOCKOUT_THRESHOLD {
                let extra = entry.failures - LOCKOUT_THRESHOLD;
                let lockout_secs = BASE_LOCKOUT_SECS.saturating_mul(1u64 << extra.min(10));
                entry.locked_until = now + lockout_secs as i64;
                return Err(ApiError::TooManyRequests(lockout_secs));
            }
            return Err(ApiError::Unauthorized);
        }

        {
            let mut attempts = self.login_attempts.write().await;
            attempts.remove(&ip);
        }

        let token = random_token();
        let expires_at = now + SESSION_TTL_SECS;
        self.store
            .create_admin_session(&hash_token(&token), now, expires_at)
            .await?;
        Ok((token, SESSION_TTL_SECS))
    }

    pub async fn logout(&self, token: &str) -> Result<(), ApiError> {
        self.store.delete_admin_session(&hash_token(token)).await?;
        Ok(())
    }

    /// Validate an admin bearer against stored sessions.
    pub async fn check_admin_session(&self, token: &str, now: i64) -> Result<(), ApiError> {
        let expires_at = self
            .store
            .get_admin_session(&hash_token(token))
            .await?
            .ok_or(ApiError::Unauthorized)?;
        if expires_at <= now {
            return Err(ApiError::Unauthorized);
        }
        Ok(())
    }

    /// Validate a proxy-request bearer: static bearers first (cheap, no DB
    /// hit), then store-backed tokens.
    pub async fn check_request_token(&self, token: &str) -> Result<AuthResult, ApiError> {
        if self.static_bearers.iter().any(|t| t == token) {
            return Ok(AuthResult::StaticBearer);
        }
        let record = self
            .store
            .get_auth_token_by_hash(&hash_token(token))
            .await?
            .ok_or(ApiError::Unauthorized)?;
        if !record.active {
            return Err(ApiError::Unauthorized);
        }
        if let Some(expires_at) = record.expires_at {
            if expires_at <= now_epoch() {
                return Err(ApiError::Unauthorized);
            }
        }
        Ok(AuthResult::Token(record))
    }

    /// Enforce `allowed_models` and the cost cap for a store-backed token.
    pub fn enforce_limits(&self, token: &AuthToken, model: &str) -> Result<(), ApiError> {
        if !token.allowed_models.is_empty() && !token.allowed_models.iter().any(|m| m == model) {
            return Err(ApiError::Forbidden(format!("model {model} not permitted for this token")));
        }
        if let Some(cap) = token.cost_cap_microusd {
            if token.cost_used_microusd >= cap {
                return Err(ApiError::Forbidden("cost cap exceeded".into()));
            }
        }
        Ok(())
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    async fn gate() -> (AuthGate, Arc<dyn Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(dir.path().join("t.db")).await.unwrap());
        let config = Config {
            port: 8080,
            admin_password: "hunter2".into(),
            auth_tokens: vec!["static-bearer".into()],
            db_path: "unused".into(),
            max_concurrency: 1000,
            max_key_retries: 3,
            first_byte_timeout_secs: 30,
            log_buffer_size: 1000,
            log_workers: 3,
            log_retention_days: 7,
            skip_tls_verify: false,
            redis_url: None,
        };
        (AuthGate::new(Arc::clone(&store), &config), store)
    }

    #[tokio::test]
    async fn correct_password_mints_a_session() {
        let (gate, _store) = gate().await;
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let (token, expires_in) = gate.login(ip, "hunter2", 1000).await.unwrap();
        assert_eq!(expires_in, SESSION_TTL_SECS);
        gate.check_admin_session(&token, 1000).await.unwrap();
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_and_counted() {
        let (gate, _store) = gate().await;
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let result = gate.login(ip, "wrong", 1000).await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
    }

    #[tokio::test]
    async fn repeated_failures_trigger_lockout() {
        let (gate, _store) = gate().await;
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..LOCKOUT_THRESHOLD {
            let _ = gate.login(ip, "wrong", 1000).await;
        }
        let result = gate.login(ip, "wrong", 1000).await;
        assert!(matches!(result, Err(ApiError::TooManyRequests(_))));
    }

    #[tokio::test]
    async fn static_bearer_is_accepted_without_store_lookup() {
        let (gate, _store) = gate().await;
        let result = gate.check_request_token("static-bearer").await.unwrap();
        assert!(matches!(result, AuthResult::StaticBearer));
    }

    #[tokio::test]
    async fn unknown_bearer_is_unauthorized() {
        let (gate, _store) = gate().await;
        let result = gate.check_request_token("nope").await;
        assert!(matches!(result, Err(ApiError::Unauthorized)));
    }
}
