//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Relay configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path to the SQLite database file.
    pub db_path: String,
    /// Address the HTTP API binds to.
    pub bind_addr: String,
    /// Timeout for a single backend forwarding call.
    pub http_timeout: Duration,
    /// Maximum number of jobs executing at once.
    pub max_concurrent_jobs: usize,
    /// How often the runner polls the queue for due jobs.
    pub poll_interval: Duration,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_cap: Duration,
    /// `host:port` probed to track connectivity. `None` means the relay
    /// assumes it is always online.
    pub probe_addr: Option<String>,
    /// Interval between connectivity probes.
    pub probe_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/sms-relay.db".to_string(),
            bind_addr: "0.0.0.0:8484".to_string(),
            http_timeout: Duration::from_secs(30),
            max_concurrent_jobs: 4,
            poll_interval: Duration::from_millis(500),
            retry_base: Duration::from_secs(30),
            retry_cap: Duration::from_secs(3600), // 1 hour
            probe_addr: None,
            probe_interval: Duration::from_secs(15),
        }
    }
}

impl RelayConfig {
    /// Build config from environment variables, falling back to defaults for
    /// anything unset. A variable that is set but unparseable is an error
    /// rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("SMS_RELAY_DB_PATH").unwrap_or(defaults.db_path);
        let bind_addr = std::env::var("SMS_RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr);

        let http_timeout = env_secs("SMS_RELAY_HTTP_TIMEOUT_SECS", defaults.http_timeout)?;
        let poll_interval = env_millis("SMS_RELAY_POLL_INTERVAL_MS", defaults.poll_interval)?;
        let retry_base = env_secs("SMS_RELAY_RETRY_BASE_SECS", defaults.retry_base)?;
        let retry_cap = env_secs("SMS_RELAY_RETRY_CAP_SECS", defaults.retry_cap)?;
        let probe_interval = env_secs("SMS_RELAY_PROBE_INTERVAL_SECS", defaults.probe_interval)?;

        let max_concurrent_jobs = match std::env::var("SMS_RELAY_MAX_CONCURRENT_JOBS") {
            Ok(raw) => parse_env("SMS_RELAY_MAX_CONCURRENT_JOBS", &raw)?,
            Err(_) => defaults.max_concurrent_jobs,
        };

        let probe_addr = std::env::var("SMS_RELAY_PROBE_ADDR")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            db_path,
            bind_addr,
            http_timeout,
            max_concurrent_jobs,
            poll_interval,
            retry_base,
            retry_cap,
            probe_addr,
            probe_interval,
        })
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => Ok(Duration::from_secs(parse_env(key, &raw)?)),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => Ok(Duration::from_millis(parse_env(key, &raw)?)),
        Err(_) => Ok(default),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse {raw:?}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = RelayConfig::default();
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert_eq!(config.retry_base, Duration::from_secs(30));
        assert_eq!(config.retry_cap, Duration::from_secs(3600));
        assert!(config.probe_addr.is_none());
        assert!(config.max_concurrent_jobs > 0);
    }

    #[test]
    fn parse_env_rejects_garbage() {
        let err = parse_env::<u64>("SMS_RELAY_RETRY_BASE_SECS", "thirty");
        assert!(err.is_err());
    }
}
