//! The `wemo:` configuration section

use serde_yaml::Value;
use tracing::debug;
use wemo_core::conf::{CONF_DISCOVERY, CONF_STATIC};
use wemo_core::{DeviceEndpoint, DOMAIN};

use crate::error::{ConfigError, ConfigResult};
use crate::loader::scalar_to_string;

/// Validated `wemo:` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WemoConfig {
    /// Statically configured devices, in configuration order
    pub static_hosts: Vec<DeviceEndpoint>,
    /// Whether SSDP discovery results should start config flows
    pub discovery: bool,
}

impl Default for WemoConfig {
    fn default() -> Self {
        Self {
            static_hosts: Vec::new(),
            discovery: true,
        }
    }
}

impl WemoConfig {
    /// Extract the `wemo:` section from the root configuration.
    ///
    /// Other top-level keys are ignored. A missing or empty section yields the
    /// defaults. Any malformed `static` entry fails the whole section.
    pub fn from_root(root: &Value) -> ConfigResult<Self> {
        match root.get(DOMAIN) {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(section) => Self::from_section(section),
        }
    }

    /// Validate the contents of the `wemo:` section
    pub fn from_section(section: &Value) -> ConfigResult<Self> {
        let map = section
            .as_mapping()
            .ok_or_else(|| invalid(DOMAIN, "expected a mapping"))?;

        let discovery = match map.get(CONF_DISCOVERY) {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(invalid(CONF_DISCOVERY, "expected a boolean")),
        };

        let static_hosts = match map.get(CONF_STATIC) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Sequence(items)) => parse_static(items)?,
            Some(_) => return Err(invalid(CONF_STATIC, "expected a list")),
        };

        debug!(
            "Parsed wemo config: {} static hosts, discovery={}",
            static_hosts.len(),
            discovery
        );
        Ok(Self {
            static_hosts,
            discovery,
        })
    }
}

fn parse_static(items: &[Value]) -> ConfigResult<Vec<DeviceEndpoint>> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let raw = scalar_to_string(item)
                .ok_or_else(|| invalid(CONF_STATIC, "entries must be strings"))?;
            raw.parse::<DeviceEndpoint>()
                .map_err(|source| ConfigError::InvalidStaticEntry {
                    index,
                    value: raw.clone(),
                    source,
                })
        })
        .collect()
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}
