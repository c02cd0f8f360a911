use anyhow::{Context, Result, anyhow};
use std::{env, net::SocketAddr, str::FromStr};

use crate::ratelimit::{Policy, redis_backend::IncrementMode};

#[derive(Debug, Clone)]
pub struct LimiterConfig {
    pub bind_addr: SocketAddr,
    pub anonymous: Policy,
    pub credentialed: Policy,
    pub token_header: String,
    pub backend: StoreBackendConfig,
    pub expose_diagnostics: bool,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub enum StoreBackendConfig {
    InMemory,
    Redis(RedisConfig),
}

#[derive(Clone)]
pub struct RedisConfig {
    pub addr: String,
    pub password: String,
    pub db: i64,
    pub increment_mode: IncrementMode,
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("addr", &self.addr)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("db", &self.db)
            .field("increment_mode", &self.increment_mode)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unsupported log format: {other}")),
        }
    }
}

impl LimiterConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr = lookup("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let anonymous = Policy::new(
            parse_or(&lookup, "RATE_LIMIT_IP", 5u64),
            parse_or(&lookup, "BLOCK_DURATION_IP", 300u64),
        );
        let credentialed = Policy::new(
            parse_or(&lookup, "RATE_LIMIT_TOKEN", 10u64),
            parse_or(&lookup, "BLOCK_DURATION_TOKEN", 300u64),
        );

        let backend = match lookup("STORE_BACKEND")
            .unwrap_or_else(|| "redis".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => StoreBackendConfig::InMemory,
            "redis" => {
                let increment_mode = lookup("REDIS_INCREMENT_MODE")
                    .map(|raw| raw.parse::<IncrementMode>())
                    .transpose()
                    .map_err(|e| anyhow!(e))?
                    .unwrap_or_default();
                StoreBackendConfig::Redis(RedisConfig {
                    addr: lookup("REDIS_ADDR").unwrap_or_else(|| "localhost:6379".to_string()),
                    password: lookup("REDIS_PASSWORD").unwrap_or_default(),
                    db: parse_or(&lookup, "REDIS_DB", 0i64),
                    increment_mode,
                })
            }
            other => return Err(anyhow!("unsupported STORE_BACKEND: {other}")),
        };

        Ok(Self {
            bind_addr,
            anonymous,
            credentialed,
            token_header: lookup("TOKEN_HEADER").unwrap_or_else(|| "API_KEY".to_string()),
            backend,
            expose_diagnostics: parse_or(&lookup, "EXPOSE_DIAGNOSTICS", false),
            log_format: parse_or(&lookup, "LOG_FORMAT", LogFormat::Compact),
        })
    }
}

/// Missing or unparseable values fall back to `default`.
fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .unwrap_or(default)
}
