//! Core types for WeMo devices
//!
//! This crate provides the fundamental types shared by every other crate in
//! the workspace: the [`DeviceEndpoint`] a device is reached at, the
//! [`DeviceDescriptor`] produced by resolving it, and the closed
//! [`ModelName`] → [`FunctionalCategory`] classification.

mod descriptor;
mod endpoint;
pub mod humidifier;
mod model;

pub use descriptor::DeviceDescriptor;
pub use endpoint::{DeviceEndpoint, EndpointError};
pub use model::{classify, classify_model_name, FunctionalCategory, ModelName};

/// Integration domain used for config entries and device identifiers
pub const DOMAIN: &str = "wemo";

/// Config entry data keys
pub mod conf {
    pub const CONF_HOST: &str = "host";
    pub const CONF_PORT: &str = "port";
    /// Stores the [`FunctionalCategory`](crate::FunctionalCategory) of the entry
    pub const CONF_DOMAIN: &str = "domain";
    pub const CONF_STATIC: &str = "static";
    pub const CONF_DISCOVERY: &str = "discovery";
}
