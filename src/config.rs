// src/config.rs

use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;
use url::Url;

/// Default bound for the backend reachability probe.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 6_000;

/// Two attempts for the same test and track closer than this are one attempt.
pub const DEFAULT_DUPLICATE_WINDOW_SECS: i64 = 10;

/// Cached test definitions are considered fresh for one hour.
pub const DEFAULT_TEST_CACHE_TTL_SECS: i64 = 3_600;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub cache_database_url: String,
    pub backend_url: Option<Url>,
    pub backend_anon_key: String,
    pub backend_service_key: Option<String>,
    pub jwt_secret: String,
    pub jwt_expiration: u64,
    pub admin_username: Option<String>,
    /// Plain password, hashed once at startup when no hash is configured.
    pub admin_password: Option<String>,
    pub admin_password_hash: Option<String>,
    pub probe_timeout_ms: u64,
    pub duplicate_window_secs: i64,
    pub test_cache_ttl_secs: i64,
    pub bind_addr: String,
    pub static_dir: Option<PathBuf>,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok();

        let cache_database_url = env::var("CACHE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://mock_test.db?mode=rwc".to_string());

        let backend_url = match optional("BACKEND_URL") {
            Some(raw) => Some(Url::parse(&raw).map_err(|e| ConfigError::Invalid {
                name: "BACKEND_URL",
                reason: e.to_string(),
            })?),
            None => None,
        };

        let jwt_secret = env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;

        Ok(Self {
            cache_database_url,
            backend_url,
            backend_anon_key: optional("BACKEND_ANON_KEY").unwrap_or_default(),
            backend_service_key: optional("BACKEND_SERVICE_KEY"),
            jwt_secret,
            jwt_expiration: parsed("JWT_EXPIRATION", 3_600)?,
            admin_username: optional("ADMIN_USERNAME"),
            admin_password: optional("ADMIN_PASSWORD"),
            admin_password_hash: optional("ADMIN_PASSWORD_HASH"),
            probe_timeout_ms: parsed("PROBE_TIMEOUT_MS", DEFAULT_PROBE_TIMEOUT_MS)?,
            duplicate_window_secs: parsed("DUPLICATE_WINDOW_SECS", DEFAULT_DUPLICATE_WINDOW_SECS)?,
            test_cache_ttl_secs: parsed("TEST_CACHE_TTL_SECS", DEFAULT_TEST_CACHE_TTL_SECS)?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            static_dir: optional("STATIC_DIR").map(PathBuf::from),
            rust_log: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

/// Unset and blank values are treated the same.
fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}
