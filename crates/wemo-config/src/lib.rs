//! YAML configuration for the WeMo integration
//!
//! Reads `configuration.yaml` from the config directory and extracts the
//! `wemo:` section:
//!
//! ```yaml
//! wemo:
//!   discovery: true
//!   static:
//!     - 192.168.1.23
//!     - 192.168.1.24:49153
//! ```
//!
//! `!secret key` (from `secrets.yaml`) and `!env_var NAME` tags are
//! substituted before the section is validated. A single malformed static
//! entry fails the whole section.

mod error;
mod loader;
mod wemo;

pub use error::{ConfigError, ConfigResult};
pub use loader::{load_yaml, load_yaml_str, CONFIG_FILE, SECRETS_FILE};
pub use wemo::WemoConfig;

pub use serde_yaml::Value;
