//! Runtime configuration read from the environment

use std::env;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_SUMMARY_MODEL: &str = "claude-sonnet-4-5";
const DEFAULT_YOUTUBE_BASE_URL: &str = "https://www.youtube.com";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MODEL_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CRON_SECONDS: u64 = 5;
const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_LEASE_SECONDS: i64 = 900;
/// Shorter leases leave the heartbeat too little slack to renew in time
const MIN_LEASE_SECONDS: i64 = 30;
const DEFAULT_RUN_RETENTION_HOURS: i64 = 72;
const DEFAULT_STEP_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_STEP_BACKOFF_MS: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Where queue items and workflow runs live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub cron_seconds: u64,
    pub concurrency: usize,
    pub lease_seconds: i64,
    /// Finished workflow runs older than this are purged
    pub run_retention_hours: i64,
    pub step_max_attempts: u32,
    pub step_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub backend: QueueBackend,
    pub database_url: Option<String>,
    pub jwt_secret: Vec<u8>,
    pub anthropic_api_key: String,
    pub anthropic_base_url: String,
    pub summary_model: String,
    pub youtube_base_url: String,
    pub proxy_url: Option<String>,
    pub upstream_timeout: Duration,
    pub model_timeout: Duration,
    pub json_logs: bool,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let backend = match optional("QUEUE_BACKEND").as_deref() {
            None | Some("postgres") => QueueBackend::Postgres,
            Some("memory") => QueueBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "QUEUE_BACKEND",
                    value: other.to_string(),
                });
            }
        };

        let database_url = optional("DATABASE_URL");
        if backend == QueueBackend::Postgres && database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(Self {
            port: parsed("PORT", DEFAULT_PORT, |_| true),
            backend,
            database_url,
            jwt_secret: required("JWT_SECRET")?.into_bytes(),
            anthropic_api_key: required("ANTHROPIC_API_KEY")?,
            anthropic_base_url: optional("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_BASE_URL.to_string()),
            summary_model: optional("SUMMARY_MODEL")
                .unwrap_or_else(|| DEFAULT_SUMMARY_MODEL.to_string()),
            youtube_base_url: optional("YOUTUBE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_YOUTUBE_BASE_URL.to_string()),
            proxy_url: optional("PROXY_URL"),
            upstream_timeout: Duration::from_secs(parsed(
                "UPSTREAM_TIMEOUT_SECS",
                DEFAULT_UPSTREAM_TIMEOUT_SECS,
                |v| *v > 0,
            )),
            model_timeout: Duration::from_secs(parsed(
                "MODEL_TIMEOUT_SECS",
                DEFAULT_MODEL_TIMEOUT_SECS,
                |v| *v > 0,
            )),
            json_logs: optional("LOG_FORMAT").is_some_and(|v| v.eq_ignore_ascii_case("json")),
            worker: WorkerConfig {
                cron_seconds: parsed("WORKER_CRON_SECONDS", DEFAULT_CRON_SECONDS, |v| {
                    *v > 0 && *v <= 59
                }),
                concurrency: parsed("WORKER_CONCURRENCY", DEFAULT_CONCURRENCY, |v| *v > 0),
                lease_seconds: parsed("WORKER_LEASE_SECONDS", DEFAULT_LEASE_SECONDS, lease_is_valid),
                run_retention_hours: parsed(
                    "WORKER_RUN_RETENTION_HOURS",
                    DEFAULT_RUN_RETENTION_HOURS,
                    |v| *v > 0,
                ),
                step_max_attempts: parsed("STEP_MAX_ATTEMPTS", DEFAULT_STEP_MAX_ATTEMPTS, |v| {
                    *v > 0
                }),
                step_backoff: Duration::from_millis(parsed(
                    "STEP_BACKOFF_MS",
                    DEFAULT_STEP_BACKOFF_MS,
                    |_| true,
                )),
            },
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    optional(name).ok_or(ConfigError::Missing(name))
}

fn lease_is_valid(seconds: &i64) -> bool {
    *seconds >= MIN_LEASE_SECONDS
}

/// Unparsable or out-of-range values fall back to the default
fn parsed<T: std::str::FromStr>(name: &str, default: T, valid: impl Fn(&T) -> bool) -> T {
    optional(name)
        .and_then(|s| s.parse().ok())
        .filter(|v| valid(v))
        .unwrap_or(default)
}
