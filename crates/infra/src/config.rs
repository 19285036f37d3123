//! Runtime configuration from the environment.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `SAGAFLOW_REPOSITORY` | `memory` | `memory` or `postgres` |
//! | `DATABASE_URL` | | required for `postgres` |
//! | `SAGAFLOW_CONCURRENCY` | `optimistic` | `optimistic` or `pessimistic` |
//! | `SAGAFLOW_LOCK_TIMEOUT_MS` | `5000` | pessimistic lock wait |
//! | `SAGAFLOW_RETRY_MAX_ATTEMPTS` | `5` | pipeline re-runs after a concurrency conflict |
//! | `SAGAFLOW_RETRY_BASE_DELAY_MS` | `10` | first retry delay, doubling up to 1s |

use std::time::Duration;

use thiserror::Error;

use crate::repository::{ConcurrencyMode, InMemorySagaRepository};
use crate::retry::RetryPolicy;

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 10;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: invalid value '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

/// Which repository backend to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryBackend {
    Memory,
    Postgres { database_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SagaConfig {
    pub backend: RepositoryBackend,
    pub concurrency: ConcurrencyMode,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            backend: RepositoryBackend::Memory,
            concurrency: ConcurrencyMode::Optimistic,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
        }
    }
}

impl SagaConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match var("SAGAFLOW_REPOSITORY").as_deref().unwrap_or("memory") {
            "memory" => RepositoryBackend::Memory,
            "postgres" => RepositoryBackend::Postgres {
                database_url: var("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
            },
            other => return Err(invalid("SAGAFLOW_REPOSITORY", other, "expected memory or postgres")),
        };

        let lock_timeout_ms = parse(
            "SAGAFLOW_LOCK_TIMEOUT_MS",
            var("SAGAFLOW_LOCK_TIMEOUT_MS"),
            DEFAULT_LOCK_TIMEOUT_MS,
        )?;
        let concurrency = match var("SAGAFLOW_CONCURRENCY").as_deref().unwrap_or("optimistic") {
            "optimistic" => ConcurrencyMode::Optimistic,
            "pessimistic" => ConcurrencyMode::Pessimistic {
                lock_timeout: Duration::from_millis(lock_timeout_ms),
            },
            other => {
                return Err(invalid(
                    "SAGAFLOW_CONCURRENCY",
                    other,
                    "expected optimistic or pessimistic",
                ));
            }
        };
        if concurrency.is_pessimistic() && matches!(backend, RepositoryBackend::Postgres { .. }) {
            return Err(invalid(
                "SAGAFLOW_CONCURRENCY",
                "pessimistic",
                "the postgres repository is optimistic only",
            ));
        }

        Ok(Self {
            backend,
            concurrency,
            retry_max_attempts: parse(
                "SAGAFLOW_RETRY_MAX_ATTEMPTS",
                var("SAGAFLOW_RETRY_MAX_ATTEMPTS"),
                DEFAULT_RETRY_MAX_ATTEMPTS,
            )?,
            retry_base_delay: Duration::from_millis(parse(
                "SAGAFLOW_RETRY_BASE_DELAY_MS",
                var("SAGAFLOW_RETRY_BASE_DELAY_MS"),
                DEFAULT_RETRY_BASE_DELAY_MS,
            )?),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::doubling(
            self.retry_max_attempts,
            self.retry_base_delay,
            MAX_RETRY_DELAY.max(self.retry_base_delay),
        )
    }

    pub fn in_memory_repository<D>(&self) -> InMemorySagaRepository<D> {
        InMemorySagaRepository::with_mode(self.concurrency)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<N>(var: &'static str, value: Option<String>, default: N) -> Result<N, ConfigError>
where
    N: std::str::FromStr,
    N::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: N::Err| invalid(var, &raw, e.to_string())),
    }
}
