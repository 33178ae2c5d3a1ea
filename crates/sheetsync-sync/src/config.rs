use std::path::PathBuf;
use std::time::Duration;

use reqwest::Url;
use sheetsync_storage::HttpClientConfig;
use thiserror::Error;

pub const ENV_REMOTE_URL: &str = "REMOTE_FILE_URL";
pub const ENV_FILE_PATH: &str = "FILE_PATH";
pub const ENV_CHECK_INTERVAL: &str = "CHECK_INTERVAL";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_HTTP_TIMEOUT: &str = "SHEETSYNC_HTTP_TIMEOUT_SECS";
pub const ENV_USER_AGENT: &str = "SHEETSYNC_USER_AGENT";
pub const ENV_RECONCILE_ON_STARTUP: &str = "SHEETSYNC_RECONCILE_ON_STARTUP";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub remote_url: String,
    pub artifact_path: PathBuf,
    pub poll_interval: Duration,
    pub database_url: String,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub reconcile_on_startup: bool,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same rules as [`SyncConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &'static str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let remote_url = require(ENV_REMOTE_URL)?;
        let parsed = Url::parse(&remote_url).map_err(|err| ConfigError::Invalid {
            name: ENV_REMOTE_URL,
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid {
                name: ENV_REMOTE_URL,
                reason: format!("unsupported scheme `{}`", parsed.scheme()),
            });
        }

        let artifact_path = PathBuf::from(require(ENV_FILE_PATH)?);
        let interval_secs = positive_secs(ENV_CHECK_INTERVAL, &require(ENV_CHECK_INTERVAL)?)?;
        let poll_interval = Duration::from_secs(interval_secs);
        let database_url = require(ENV_DATABASE_URL)?;

        let http_timeout = match get(ENV_HTTP_TIMEOUT) {
            Some(raw) => Duration::from_secs(positive_secs(ENV_HTTP_TIMEOUT, &raw)?),
            None => HttpClientConfig::default().timeout,
        };
        let user_agent = get(ENV_USER_AGENT).unwrap_or_else(|| "sheetsync/0.1".to_string());
        let reconcile_on_startup = match get(ENV_RECONCILE_ON_STARTUP) {
            Some(raw) => parse_flag(ENV_RECONCILE_ON_STARTUP, &raw)?,
            None => true,
        };

        Ok(Self {
            remote_url,
            artifact_path,
            poll_interval,
            database_url,
            http_timeout,
            user_agent,
            reconcile_on_startup,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.http_timeout,
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

fn positive_secs(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.parse::<u64>() {
        Ok(0) => Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".into(),
        }),
        Ok(secs) => Ok(secs),
        Err(err) => Err(ConfigError::Invalid {
            name,
            reason: format!("{raw:?}: {err}"),
        }),
    }
}

fn parse_flag(name: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            reason: format!("{raw:?} is not a boolean"),
        }),
    }
}
