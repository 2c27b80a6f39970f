//! Device endpoint type representing a host[:port] pair

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for malformed endpoints
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("host cannot be empty")]
    EmptyHost,

    #[error("invalid port '{0}' (must be an integer between 1 and 65535)")]
    InvalidPort(String),
}

/// Address a WeMo device is reached at
///
/// A port of `0` means the port is unknown and must be auto-resolved by
/// probing the device before its description can be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceEndpoint {
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl DeviceEndpoint {
    /// Create an endpoint, rejecting an empty host
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, EndpointError> {
        let host = host.into();
        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }
        Ok(Self { host, port })
    }

    /// Whether the port still has to be discovered
    pub fn needs_port(&self) -> bool {
        self.port == 0
    }

    /// Key used by the resolution cache, always `"{host}:{port}"`
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for DeviceEndpoint {
    type Err = EndpointError;

    /// Parse `"host"` or `"host:port"`.
    ///
    /// Splits at the first `:`; an empty port part is treated as "no port".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = match s.split_once(':') {
            Some((host, port)) => (host, port),
            None => (s, ""),
        };

        if host.is_empty() {
            return Err(EndpointError::EmptyHost);
        }

        let port = if port.is_empty() {
            0
        } else {
            match port.trim().parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => return Err(EndpointError::InvalidPort(port.to_string())),
            }
        };

        Self::new(host, port)
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 0 {
            write!(f, "{}", self.host)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}
