//! Configuration loading and representation.
//!
//! Settings come from environment variables with defaults suitable for local
//! development. [`Settings::from_lookup`] takes any key lookup so tests never
//! touch the process environment.

use std::net::SocketAddr;
use std::time::Duration;

use conveyor_core::UnknownTaskPolicy;
pub use conveyor_observability::{LogConfig, LogFormat};

pub const DEFAULT_APP_NAME: &str = "Conveyor";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8123";
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/0";
pub const DEFAULT_TASK_QUEUE: &str = "conveyor:tasks";
pub const DEFAULT_RESULT_EXPIRES: Duration = Duration::from_secs(3600);
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://localhost:8123";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("unsupported backend url for {key}: {url}")]
    UnsupportedScheme { key: &'static str, url: String },
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Backend selected by a broker or result-store URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// `memory://` or `cache+memory://`
    Memory,
    /// `redis://` or `rediss://`; carries the full URL.
    Redis(String),
}

impl BackendKind {
    pub fn parse(key: &'static str, url: &str) -> Result<Self, ConfigError> {
        let url = url.trim();
        if url.starts_with("memory://") || url.starts_with("cache+memory://") {
            Ok(Self::Memory)
        } else if url.starts_with("redis://") || url.starts_with("rediss://") {
            Ok(Self::Redis(url.to_string()))
        } else {
            Err(ConfigError::UnsupportedScheme {
                key,
                url: url.to_string(),
            })
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, Self::Memory)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_name: String,
    pub environment: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub bind_addr: SocketAddr,
    pub redis_url: String,
    pub broker: BackendKind,
    pub result_backend: BackendKind,
    /// Run handlers inline at submission instead of through a broker.
    pub task_always_eager: bool,
    pub task_queue: String,
    pub result_expires: Duration,
    pub visibility_timeout: Duration,
    pub worker_concurrency: usize,
    /// Run workers inside the API process.
    pub embedded_workers: bool,
    pub unknown_task_state: UnknownTaskPolicy,
    pub allowed_origins: Vec<String>,
}

impl Settings {
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let redis_url = get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
        let task_always_eager = parse_bool("TASK_ALWAYS_EAGER", get("TASK_ALWAYS_EAGER"), false)?;

        let (broker, result_backend) = if task_always_eager {
            (BackendKind::Memory, BackendKind::Memory)
        } else {
            let broker_url = get("BROKER_URL").unwrap_or_else(|| redis_url.clone());
            let backend_url = get("RESULT_BACKEND").unwrap_or_else(|| redis_url.clone());
            (
                BackendKind::parse("BROKER_URL", &broker_url)?,
                BackendKind::parse("RESULT_BACKEND", &backend_url)?,
            )
        };

        let bind = get("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::invalid("BIND_ADDR", &bind, e))?;

        let log_format = match get("LOG_FORMAT").as_deref().map(str::to_ascii_lowercase) {
            None => LogFormat::Json,
            Some(v) if v == "json" => LogFormat::Json,
            Some(v) if v == "pretty" || v == "text" => LogFormat::Pretty,
            Some(v) => return Err(ConfigError::invalid("LOG_FORMAT", &v, "expected json or pretty")),
        };

        let worker_concurrency = parse_num("WORKER_CONCURRENCY", get("WORKER_CONCURRENCY"), 4)?;
        if worker_concurrency == 0 {
            return Err(ConfigError::invalid("WORKER_CONCURRENCY", "0", "must be at least 1"));
        }

        let unknown_task_state = match get("UNKNOWN_TASK_STATE") {
            None => UnknownTaskPolicy::default(),
            Some(v) => v
                .parse::<UnknownTaskPolicy>()
                .map_err(|e| ConfigError::invalid("UNKNOWN_TASK_STATE", &v, e))?,
        };

        let allowed_origins = get("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGINS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();

        Ok(Self {
            app_name: get("APP_NAME").unwrap_or_else(|| DEFAULT_APP_NAME.to_string()),
            environment: get("ENVIRONMENT").unwrap_or_else(|| "development".to_string()),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            bind_addr,
            redis_url,
            embedded_workers: parse_bool(
                "EMBEDDED_WORKERS",
                get("EMBEDDED_WORKERS"),
                broker.is_memory() && !task_always_eager,
            )?,
            broker,
            result_backend,
            task_always_eager,
            task_queue: get("TASK_QUEUE").unwrap_or_else(|| DEFAULT_TASK_QUEUE.to_string()),
            result_expires: Duration::from_secs(parse_num(
                "RESULT_EXPIRES_SECS",
                get("RESULT_EXPIRES_SECS"),
                DEFAULT_RESULT_EXPIRES.as_secs(),
            )?),
            visibility_timeout: Duration::from_secs(parse_num(
                "VISIBILITY_TIMEOUT_SECS",
                get("VISIBILITY_TIMEOUT_SECS"),
                DEFAULT_VISIBILITY_TIMEOUT.as_secs(),
            )?),
            worker_concurrency,
            unknown_task_state,
            allowed_origins,
        })
    }
}

fn parse_bool(key: &'static str, raw: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, &raw, "expected a boolean")),
    }
}

fn parse_num<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::invalid(key, &raw, e)),
    }
}
