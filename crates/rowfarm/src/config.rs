//! Process configuration for master and worker.
//!
//! Both configs start from `Default`, then take overrides from `ROWFARM_*`
//! environment variables. The CLI applies its flags on top. Values are passed
//! into `Dispatcher::new` and `WorkerService::bind`; nothing is global.

use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::bridge::codec::DEFAULT_MAX_FRAME_LEN;
use crate::bridge::protocol::MIN_PAYLOAD_LEN;

pub const DEFAULT_PORT: u16 = 10000;
pub const DEFAULT_MATRIX_SIZE: usize = 20;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on `WorkerConfig::max_connections`; the drain acquires all permits at once.
pub const MAX_CONNECTIONS: usize = if Semaphore::MAX_PERMITS < u32::MAX as usize {
    Semaphore::MAX_PERMITS
} else {
    u32::MAX as usize
};

pub const ENV_MATRIX_SIZE: &str = "ROWFARM_MATRIX_SIZE";
pub const ENV_PORT: &str = "ROWFARM_PORT";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "ROWFARM_CONNECT_TIMEOUT_MS";
pub const ENV_IO_TIMEOUT_MS: &str = "ROWFARM_IO_TIMEOUT_MS";
pub const ENV_MAX_FRAME_BYTES: &str = "ROWFARM_MAX_FRAME_BYTES";
pub const ENV_VERIFY_INDEX: &str = "ROWFARM_VERIFY_INDEX";
pub const ENV_MAX_CONNECTIONS: &str = "ROWFARM_MAX_CONNECTIONS";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("no worker addresses given")]
    EmptyRoster,

    #[error("invalid worker address '{0}'")]
    InvalidAddress(String),

    #[error("matrix size must be at least 1")]
    ZeroMatrixSize,

    #[error("max connections must be at least 1")]
    ZeroConnections,

    #[error("max connections {value} exceeds limit of {max}")]
    TooManyConnections { value: usize, max: usize },

    #[error("frame limit of {value} bytes is below the minimum of {min}")]
    FrameLimitTooSmall { value: usize, min: usize },
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Settings for the master side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    /// Dimension N of the square input matrices.
    pub matrix_size: usize,
    /// Port appended to roster entries given as a bare host.
    pub default_port: u16,
    pub connect_timeout: Duration,
    /// Bound on sending the task and on receiving the result, each.
    pub io_timeout: Duration,
    pub max_frame_len: usize,
    /// Fail a row when the worker echoes a different index than it was sent.
    ///
    /// When false the result is stored at whatever index the worker returned.
    pub verify_index: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            matrix_size: DEFAULT_MATRIX_SIZE,
            default_port: DEFAULT_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            verify_index: true,
        }
    }
}

impl MasterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults plus whatever `lookup` returns for the `ROWFARM_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(n) = parse_var(&lookup, ENV_MATRIX_SIZE)? {
            config.matrix_size = n;
        }
        if let Some(port) = parse_var(&lookup, ENV_PORT)? {
            config.default_port = port;
        }
        if let Some(ms) = parse_var(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var(&lookup, ENV_IO_TIMEOUT_MS)? {
            config.io_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_FRAME_BYTES)? {
            config.max_frame_len = max;
        }
        if let Some(raw) = lookup(ENV_VERIFY_INDEX) {
            config.verify_index = parse_bool(ENV_VERIFY_INDEX, &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.matrix_size == 0 {
            return Err(ConfigError::ZeroMatrixSize);
        }
        check_frame_limit(self.max_frame_len)
    }
}

/// Settings for a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub host: String,
    pub port: u16,
    /// Connections served at once. 1 serves strictly one task at a time.
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_connections: 1,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(port) = parse_var(&lookup, ENV_PORT)? {
            config.port = port;
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_CONNECTIONS)? {
            config.max_connections = max;
        }
        if let Some(ms) = parse_var(&lookup, ENV_IO_TIMEOUT_MS)? {
            config.read_timeout = Duration::from_millis(ms);
            config.write_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var(&lookup, ENV_MAX_FRAME_BYTES)? {
            config.max_frame_len = max;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::ZeroConnections);
        }
        if self.max_connections > MAX_CONNECTIONS {
            return Err(ConfigError::TooManyConnections {
                value: self.max_connections,
                max: MAX_CONNECTIONS,
            });
        }
        check_frame_limit(self.max_frame_len)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn check_frame_limit(value: usize) -> Result<(), ConfigError> {
    if value < MIN_PAYLOAD_LEN {
        return Err(ConfigError::FrameLimitTooSmall {
            value,
            min: MIN_PAYLOAD_LEN,
        });
    }
    Ok(())
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
    }
}

pub fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::invalid(key, raw, "expected true or false")),
    }
}
