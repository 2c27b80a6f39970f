//! Resolved device description

use serde::{Deserialize, Serialize};

use crate::endpoint::DeviceEndpoint;
use crate::model::{classify, FunctionalCategory, ModelName};

/// A device whose description was fetched successfully
///
/// `serial_number` is the durable identity. The host and port are only where
/// the device was last seen and may change across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Friendly name
    pub name: String,
    pub serial_number: String,
    pub model_name: ModelName,
    pub host: String,
    pub port: u16,
    /// URL the description was fetched from
    pub setup_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(
        name: impl Into<String>,
        serial_number: impl Into<String>,
        model_name: impl Into<ModelName>,
        setup_url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            serial_number: serial_number.into(),
            model_name: model_name.into(),
            host: String::new(),
            port: 0,
            setup_url: setup_url.into(),
            manufacturer: None,
            firmware_version: None,
        }
    }

    /// Set the address the device answered on
    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    /// Category derived from the model name
    pub fn category(&self) -> FunctionalCategory {
        classify(&self.model_name)
    }

    /// Endpoint the device answered on
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }
}
