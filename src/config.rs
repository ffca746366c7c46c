use std::{env, fmt, net::SocketAddr, time::Duration};

use thiserror::Error;

/// A credential passed to the child process. Redacted from Debug output so
/// it can never leak through logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub child_command: String,
    pub child_args: Vec<String>,
    pub child_token: Option<Secret>,
    pub child_token_var: String,
    pub bind_addr: String,
    pub bind_port: u16,
    /// `None` disables the pending-request expiry sweep.
    pub request_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BRIDGE_CHILD_COMMAND is required and must not be empty")]
    MissingChildCommand,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("BRIDGE_REQUEST_TIMEOUT_SECS must be a non-negative integer")]
    InvalidTimeout,
    #[error("BRIDGE_SHUTDOWN_GRACE_SECS must be a non-negative integer")]
    InvalidGrace,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let child_command = env::var("BRIDGE_CHILD_COMMAND")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingChildCommand)?;

        let child_args = env::var("BRIDGE_CHILD_ARGS")
            .map(|value| {
                value
                    .split_whitespace()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let child_token = env::var("BRIDGE_CHILD_TOKEN")
            .ok()
            .filter(|value| !value.is_empty())
            .map(Secret::new);
        let child_token_var =
            env::var("BRIDGE_CHILD_TOKEN_VAR").unwrap_or_else(|_| "BRIDGE_TOKEN".to_string());

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let bind_port = env::var("BIND_PORT")
            .ok()
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let timeout_secs = env::var("BRIDGE_REQUEST_TIMEOUT_SECS")
            .ok()
            .map(|value| {
                value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidTimeout)
            })
            .transpose()?
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        let request_timeout = (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs));

        let shutdown_grace = env::var("BRIDGE_SHUTDOWN_GRACE_SECS")
            .ok()
            .map(|value| value.parse::<u64>().map_err(|_| ConfigError::InvalidGrace))
            .transpose()?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS));

        let config = Self {
            child_command,
            child_args,
            child_token,
            child_token_var,
            bind_addr,
            bind_port,
            request_timeout,
            shutdown_grace,
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}
