//! Live worker configuration.
//!
//! Configuration is loaded from environment variables. The token key is
//! redacted in Debug output.

use crate::pool::PoolSettings;
use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default gateway bind address.
pub const DEFAULT_GATEWAY_BIND_ADDRESS: &str = "0.0.0.0:9001";

/// Default health, metrics and admin bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default number of idle channels kept warm beyond the active ones.
pub const DEFAULT_MAX_PARALLEL: usize = 1;

/// Default idle grace period, in sweeper ticks.
pub const DEFAULT_IDLE_GRACE_TICKS: u32 = 10;

/// Default sweeper period in milliseconds.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1000;

/// Default loopback engine readiness delay in milliseconds.
pub const DEFAULT_ENGINE_READY_DELAY_MS: u64 = 200;

/// Default worker instance ID prefix.
pub const DEFAULT_WORKER_ID_PREFIX: &str = "lw";

/// Default channel list refresh period in seconds.
pub const DEFAULT_CHANNEL_LIST_INTERVAL_SECS: u64 = 60;

/// Default address reported to the management service.
pub const DEFAULT_SERVICE_IP: &str = "0.0.0.0";

/// Default peer type reported to the management service.
pub const DEFAULT_PEER_TYPE: u8 = 1;

/// Delay before the first channel list fetch.
pub const CHANNEL_LIST_FIRST_FETCH_DELAY: Duration = Duration::from_secs(1);

/// Where each channel's engine instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Engine runs inside the service process.
    InProcess,
    /// Each channel gets a dedicated worker process.
    Process,
}

impl FromStr for IsolationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "in-process" => Ok(IsolationMode::InProcess),
            "process" => Ok(IsolationMode::Process),
            other => Err(ConfigError::InvalidValue(format!(
                "LW_ISOLATION must be 'in-process' or 'process', got '{other}'"
            ))),
        }
    }
}

/// Management channel list settings. Present only when a list URL is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelListConfig {
    /// Channel list endpoint.
    pub url: String,

    /// This instance's address, sent as the `ip` query parameter.
    pub service_ip: String,

    /// Peer type, 1 or 2, sent as the `type` query parameter.
    pub peer_type: u8,

    /// Time between fetches.
    pub refresh_interval: Duration,

    /// Time before the first fetch.
    pub first_fetch_delay: Duration,
}

impl ChannelListConfig {
    fn from_vars(vars: &HashMap<String, String>) -> Result<Option<Self>, ConfigError> {
        let Some(url) = vars
            .get("LW_CHANNEL_LIST_URL")
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
        else {
            return Ok(None);
        };

        let interval_secs = parse_var(
            vars,
            "LW_CHANNEL_LIST_INTERVAL_SECS",
            DEFAULT_CHANNEL_LIST_INTERVAL_SECS,
        )?;
        if interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "LW_CHANNEL_LIST_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        let service_ip = vars
            .get("LW_SERVICE_IP")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVICE_IP.to_string());

        // Out-of-range peer types fall back to the default
        let peer_type = parse_var(vars, "LW_PEER_TYPE", DEFAULT_PEER_TYPE)?;
        let peer_type = if (1..=2).contains(&peer_type) {
            peer_type
        } else {
            DEFAULT_PEER_TYPE
        };

        Ok(Some(Self {
            url: url.to_string(),
            service_ip,
            peer_type,
            refresh_interval: Duration::from_secs(interval_secs),
            first_fetch_delay: CHANNEL_LIST_FIRST_FETCH_DELAY,
        }))
    }
}

/// Live worker configuration.
#[derive(Clone)]
pub struct Config {
    /// Gateway bind address (default: "0.0.0.0:9001").
    pub gateway_bind_address: String,

    /// Health, metrics and admin bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Admission limit for idle live channels beyond the active ones.
    pub max_parallel: usize,

    /// Idle grace period in sweeper ticks.
    pub idle_grace_ticks: u32,

    /// Sweeper period.
    pub sweep_interval: Duration,

    /// Engine placement.
    pub isolation: IsolationMode,

    /// Worker program for process isolation. `None` means the current executable.
    pub worker_program: Option<PathBuf>,

    /// Key for token signing and verification.
    /// Protected by `SecretString` to prevent accidental logging.
    pub token_key: SecretString,

    /// Loopback engine readiness delay.
    pub engine_ready_delay: Duration,

    /// Unique identifier for this instance.
    pub worker_id: String,

    /// Channel list pinning, disabled when `None`.
    pub channel_list: Option<ChannelListConfig>,
}

/// Custom Debug implementation that redacts the token key.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("gateway_bind_address", &self.gateway_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("max_parallel", &self.max_parallel)
            .field("idle_grace_ticks", &self.idle_grace_ticks)
            .field("sweep_interval", &self.sweep_interval)
            .field("isolation", &self.isolation)
            .field("worker_program", &self.worker_program)
            .field("token_key", &"[REDACTED]")
            .field("engine_ready_delay", &self.engine_ready_delay)
            .field("worker_id", &self.worker_id)
            .field("channel_list", &self.channel_list)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional numeric variable, rejecting values that do not parse.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}='{raw}' is not a valid number"))),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let token_key = vars
            .get("LW_TOKEN_KEY")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("LW_TOKEN_KEY".to_string()))?;
        let token_key = SecretString::from(token_key.clone());

        let gateway_bind_address = vars
            .get("LW_GATEWAY_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_GATEWAY_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("LW_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let max_parallel = parse_var(vars, "LW_MAX_PARALLEL", DEFAULT_MAX_PARALLEL)?;
        let idle_grace_ticks = parse_var(vars, "LW_IDLE_GRACE_TICKS", DEFAULT_IDLE_GRACE_TICKS)?;

        let sweep_interval_ms = parse_var(vars, "LW_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL_MS)?;
        if sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "LW_SWEEP_INTERVAL_MS must be greater than 0".to_string(),
            ));
        }

        let isolation = match vars.get("LW_ISOLATION") {
            Some(raw) => raw.parse()?,
            None => IsolationMode::InProcess,
        };

        let worker_program = vars
            .get("LW_WORKER_PROGRAM")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let engine_ready_delay_ms = parse_var(
            vars,
            "LW_ENGINE_READY_DELAY_MS",
            DEFAULT_ENGINE_READY_DELAY_MS,
        )?;

        let worker_id = vars.get("LW_WORKER_ID").cloned().unwrap_or_else(|| {
            let hostname = vars
                .get("HOSTNAME")
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_WORKER_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        let channel_list = ChannelListConfig::from_vars(vars)?;

        Ok(Config {
            gateway_bind_address,
            health_bind_address,
            max_parallel,
            idle_grace_ticks,
            sweep_interval: Duration::from_millis(sweep_interval_ms),
            isolation,
            worker_program,
            token_key,
            engine_ready_delay: Duration::from_millis(engine_ready_delay_ms),
            worker_id,
            channel_list,
        })
    }

    /// Pool settings derived from this configuration.
    #[must_use]
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_parallel: self.max_parallel,
            idle_grace_ticks: self.idle_grace_ticks,
            sweep_interval: self.sweep_interval,
        }
    }
}
