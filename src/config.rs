//! Configuration management.
//!
//! Configuration is loaded once at startup from environment variables:
//! - `PORT` - Optional. Server port. Defaults to `8080`.
//! - `ADMIN_PASSWORD` - Required. Admin login password.
//! - `AUTH_TOKENS` - Optional. Comma-separated static bearer tokens accepted on the proxy surface.
//! - `DB_PATH` - Optional. SQLite file path. Defaults to `./data/proxy.db`.
//! - `MAX_CONCURRENCY` - Optional. Admission semaphore capacity. Defaults to `1000`.
//! - `MAX_KEY_RETRIES` - Optional. Outer per-channel retry budget. Defaults to `3`.
//! - `FIRST_BYTE_TIMEOUT_SECONDS` - Optional. `0` disables the watchdog. Defaults to `0`.
//! - `LOG_BUFFER_SIZE` - Optional. Log queue capacity. Defaults to `1000`.
//! - `LOG_WORKERS` - Optional. Number of log-flush workers. Defaults to `3`.
//! - `LOG_RETENTION_DAYS` - Optional. Defaults to `7`.
//! - `SKIP_TLS_VERIFY` - Optional bool. Defaults to `false`.
//! - `REDIS_URL` - Optional. Secondary-cache DSN (unused unless set).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Process-wide configuration, loaded once at startup.
///
/// Malformed *optional* numeric overrides fall back to their documented
/// default with a logged warning rather than failing startup; only a
/// missing `ADMIN_PASSWORD` is a hard configuration error (exit code 1).
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub admin_password: String,
    pub auth_tokens: Vec<String>,
    pub db_path: String,
    pub max_concurrency: usize,
    pub max_key_retries: u32,
    pub first_byte_timeout_secs: u64,
    pub log_buffer_size: usize,
    pub log_workers: usize,
    pub log_retention_days: u32,
    pub skip_tls_verify: bool,
    pub redis_url: Option<String>,
}

fn parse_env_or_default<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `ADMIN_PASSWORD` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let admin_password = std::env::var("ADMIN_PASSWORD")
            .map_err(|_| ConfigError::MissingEnvVar("ADMIN_PASSWORD".to_string()))?;
        if admin_password.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "ADMIN_PASSWORD".to_string(),
                "must not be empty".to_string(),
            ));
        }

        let auth_tokens = std::env::var("AUTH_TOKENS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let db_path = std::env::var("DB_PATH")
            .or_else(|_| std::env::var("DB_DSN"))
            .unwrap_or_else(|_| "./data/proxy.db".to_string());

        let skip_tls_verify = std::env::var("SKIP_TLS_VERIFY")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            port: parse_env_or_default("PORT", 8080),
            admin_password,
            auth_tokens,
            db_path,
            max_concurrency: parse_env_or_default("MAX_CONCURRENCY", 1000),
            max_key_retries: parse_env_or_default("MAX_KEY_RETRIES", 3),
            first_byte_timeout_secs: parse_env_or_default("FIRST_BYTE_TIMEOUT_SECONDS", 0),
            log_buffer_size: parse_env_or_default("LOG_BUFFER_SIZE", 1000),
            log_workers: parse_env_or_default("LOG_WORKERS", 3),
            log_retention_days: parse_env_or_default("LOG_RETENTION_DAYS", 7),
            skip_tls_verify,
            redis_url: std::env::var("REDIS_URL").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_admin_password_is_an_error() {
        std::env::remove_var("ADMIN_PASSWORD");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn defaults_apply_when_optional_vars_absent() {
        std::env::set_var("ADMIN_PASSWORD", "hunter2");
        std::env::remove_var("PORT");
        std::env::remove_var("MAX_CONCURRENCY");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.max_concurrency, 1000);
        std::env::remove_var("ADMIN_PASSWORD");
    }
}
