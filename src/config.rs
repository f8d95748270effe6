//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Timing and retry policy shared by the fleet manager and every worker.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    /// Delay before bootstrap reads the server registry.
    pub warmup: Duration,
    /// Delay between successive worker starts during bootstrap.
    pub stagger: Duration,
    /// Sleep when no job of any kind is pending.
    pub idle_interval: Duration,
    /// First backoff after a failed translation attempt.
    pub backoff_initial: Duration,
    /// Upper bound on the failure backoff.
    pub backoff_max: Duration,
    /// Growth factor applied after each consecutive failure.
    pub backoff_multiplier: f64,
    /// Timeout for a single call to an inference endpoint.
    pub request_timeout: Duration,
    /// Failed attempts after which a job is parked as `failed`.
    pub max_attempts: u32,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(10),
            stagger: Duration::from_secs(1),
            idle_interval: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(120),
            backoff_multiplier: 2.0,
            request_timeout: Duration::from_secs(600), // 10 minutes
            max_attempts: 3,
        }
    }
}

impl FleetConfig {
    /// Build from `SAKURA_*` environment variables, keeping the default for
    /// anything absent or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            warmup: env_secs("SAKURA_WARMUP_SECS").unwrap_or(defaults.warmup),
            stagger: env_parse::<u64>("SAKURA_STAGGER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.stagger),
            idle_interval: env_secs("SAKURA_IDLE_SECS").unwrap_or(defaults.idle_interval),
            backoff_initial: env_secs("SAKURA_BACKOFF_INITIAL_SECS")
                .unwrap_or(defaults.backoff_initial),
            backoff_max: env_secs("SAKURA_BACKOFF_MAX_SECS").unwrap_or(defaults.backoff_max),
            backoff_multiplier: defaults.backoff_multiplier,
            request_timeout: env_secs("SAKURA_REQUEST_TIMEOUT_SECS")
                .unwrap_or(defaults.request_timeout),
            max_attempts: env_parse("SAKURA_MAX_ATTEMPTS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
        }
    }
}

/// Calculate the next failure backoff from the current one.
///
/// The result is clamped to [`FleetConfig::backoff_max`].
pub fn next_backoff(current: Duration, config: &FleetConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.backoff_multiplier) as u64;
    Duration::from_millis(next_ms).min(config.backoff_max)
}

/// Process-level settings for the `sakura-fleet` binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub admin_addr: SocketAddr,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_path = std::env::var("SAKURA_DB_PATH")
            .unwrap_or_else(|_| "./data/sakura.db".to_string())
            .into();

        let port = match std::env::var("SAKURA_ADMIN_PORT") {
            Ok(raw) => raw.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                key: "SAKURA_ADMIN_PORT".to_string(),
                message: format!("{raw:?} is not a port: {e}"),
            })?,
            Err(_) => 8080,
        };

        Ok(Self {
            db_path,
            admin_addr: SocketAddr::from(([0, 0, 0, 0], port)),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
