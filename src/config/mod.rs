/// Configuration management for the nodeloom engine
///
/// Handles server binding, the SQLite store, execution limits and the cron
/// reconciler. Every value can be overridden with a `NODELOOM_*` variable.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Run execution limits
    pub engine: EngineConfig,
    /// Cron reconciliation
    pub scheduler: SchedulerConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL (default: "sqlite://data/nodeloom.db")
    pub url: String,
}

/// Execution limits applied to every run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Task queue the local worker serves
    pub task_queue: String,
    /// Attempts per run, first one included
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles afterwards
    pub retry_backoff_ms: u64,
    /// Deadline for one execution attempt
    pub activity_timeout_secs: u64,
    /// Default timeout for outbound HTTP requests
    pub http_timeout_secs: u64,
}

/// Cron reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub tick_interval_secs: u64,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: env_or("NODELOOM_HOST", "0.0.0.0".to_string()),
                port: env_or("NODELOOM_PORT", 3004),
            },
            database: DatabaseConfig {
                url: env_or("NODELOOM_DATABASE_URL", "sqlite://data/nodeloom.db".to_string()),
            },
            engine: EngineConfig {
                task_queue: env_or("NODELOOM_TASK_QUEUE", "flow-runs".to_string()),
                max_attempts: env_or("NODELOOM_MAX_ATTEMPTS", 3),
                retry_backoff_ms: env_or("NODELOOM_RETRY_BACKOFF_MS", 1000),
                activity_timeout_secs: env_or("NODELOOM_ACTIVITY_TIMEOUT_SECS", 600),
                http_timeout_secs: env_or("NODELOOM_HTTP_TIMEOUT_SECS", 30),
            },
            scheduler: SchedulerConfig {
                enabled: std::env::var("NODELOOM_SCHEDULER_ENABLED")
                    .ok()
                    .and_then(|v| crate::workflow::value::parse_bool_str(&v))
                    .unwrap_or(true),
                tick_interval_secs: env_or(
                    "NODELOOM_SCHEDULER_TICK_SECS",
                    crate::runtime::scheduler::DEFAULT_TICK_INTERVAL.as_secs(),
                ),
            },
        }
    }
}

/// Read and parse an environment variable, falling back on absence or parse errors
fn env_or<T: FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(fallback)
}
