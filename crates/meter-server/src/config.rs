//! Server Configuration

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Process-level settings read from the environment
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Postgres connection string; the in-memory store is used when unset
    pub database_url: Option<String>,

    /// HMAC key for bearer tokens
    pub identity_secret: String,

    /// Lifetime of one-shot handoff entries
    pub handoff_ttl_secs: i64,
}

impl ServerConfig {
    pub const DEFAULT_BIND_ADDR: &'static str = "0.0.0.0:3000";
    pub const DEFAULT_HANDOFF_TTL_SECS: i64 = 300;

    pub fn from_env() -> Result<Self, ConfigError> {
        let identity_secret = std::env::var("IDENTITY_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("IDENTITY_SECRET"))?;

        let handoff_ttl_secs = match std::env::var("HANDOFF_TTL_SECS") {
            Ok(raw) => raw.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
                name: "HANDOFF_TTL_SECS",
                reason: e.to_string(),
            })?,
            Err(_) => Self::DEFAULT_HANDOFF_TTL_SECS,
        };
        if handoff_ttl_secs <= 0 {
            return Err(ConfigError::Invalid {
                name: "HANDOFF_TTL_SECS",
                reason: "must be positive".into(),
            });
        }

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| Self::DEFAULT_BIND_ADDR.into()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            identity_secret,
            handoff_ttl_secs,
        })
    }
}
