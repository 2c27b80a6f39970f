//! Config Entry types
//!
//! A ConfigEntry represents one configured WeMo device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use wemo_core::conf::{CONF_DOMAIN, CONF_HOST, CONF_PORT};
use wemo_core::{DeviceEndpoint, FunctionalCategory};

use crate::state_machine::InvalidTransition;

/// Schema version written by the current config flow
///
/// Version 1 entries come from the time a single entry covered every
/// discovered device.
pub const CONFIG_ENTRY_VERSION: u32 = 2;

/// Config entry lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    /// Currently being configured (non-recoverable)
    SetupInProgress,
    /// Successfully set up (recoverable)
    Loaded,
    /// Setup failed and will not be retried (recoverable)
    SetupError,
    /// Device not ready, waiting to retry setup (recoverable)
    SetupRetry,
    /// Entry is from a schema version that cannot be set up (not recoverable)
    MigrationError,
    /// Currently unloading (non-recoverable)
    UnloadInProgress,
    /// Unload failed (not recoverable)
    FailedUnload,
}

impl ConfigEntryState {
    /// Check if the entry can be unloaded/reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConfigEntryState::Loaded
                | ConfigEntryState::SetupError
                | ConfigEntryState::SetupRetry
                | ConfigEntryState::NotLoaded
        )
    }
}

/// Source of the config entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Entered by the user
    #[default]
    User,
    /// Imported from the `static` list in YAML config
    Import,
    /// UPnP/SSDP discovery
    Ssdp,
    /// User hiding a discovery
    Ignore,
    /// User asking to see an ignored discovery again
    Unignore,
}

impl ConfigEntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigEntrySource::User => "user",
            ConfigEntrySource::Import => "import",
            ConfigEntrySource::Ssdp => "ssdp",
            ConfigEntrySource::Ignore => "ignore",
            ConfigEntrySource::Unignore => "unignore",
        }
    }
}

/// Typed view of the `data` of a WeMo entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WemoEntryData {
    pub host: String,
    /// 0 when the port is determined at setup time
    pub port: u16,
    /// Category the entry was last set up as
    pub category: Option<FunctionalCategory>,
}

impl WemoEntryData {
    pub fn new(endpoint: &DeviceEndpoint) -> Self {
        Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            category: None,
        }
    }

    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint {
            host: self.host.clone(),
            port: self.port,
        }
    }

    /// Read from raw entry data. `None` if there is no host.
    pub fn from_data(data: &HashMap<String, Value>) -> Option<Self> {
        let host = data.get(CONF_HOST)?.as_str()?.to_string();
        let port = data
            .get(CONF_PORT)
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(0);
        let category = data
            .get(CONF_DOMAIN)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        Some(Self {
            host,
            port,
            category,
        })
    }

    pub fn to_data(&self) -> HashMap<String, Value> {
        let mut data = HashMap::new();
        data.insert(CONF_HOST.to_string(), Value::from(self.host.clone()));
        data.insert(CONF_PORT.to_string(), Value::from(self.port));
        if let Some(category) = self.category {
            data.insert(CONF_DOMAIN.to_string(), Value::from(category.as_str()));
        }
        data
    }
}

/// A configuration entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain
    pub domain: String,

    /// Human-readable display name
    pub title: String,

    /// Configuration data
    #[serde(default)]
    pub data: HashMap<String, Value>,

    /// Schema version, 1 for entries written before versioning
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default = "default_minor_version")]
    pub minor_version: u32,

    /// Device serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Origin type
    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Human-readable explanation for failed states
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Per-entry setup/unload lock (not persisted)
    /// Wrapped in Arc so ConfigEntry can still be Clone
    #[serde(skip)]
    pub setup_lock: Arc<Mutex<()>>,

    /// Number of setup retry attempts (not persisted)
    #[serde(skip, default)]
    pub tries: u32,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

fn default_minor_version() -> u32 {
    1
}

impl ConfigEntry {
    /// Create a new config entry at the current schema version
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: HashMap::new(),
            version: CONFIG_ENTRY_VERSION,
            minor_version: 1,
            unique_id: None,
            source: ConfigEntrySource::User,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            setup_lock: Arc::new(Mutex::new(())),
            tries: 0,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_wemo_data(self, data: &WemoEntryData) -> Self {
        self.with_data(data.to_data())
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = version;
        self.minor_version = minor_version;
        self
    }

    /// Typed view of `data`
    pub fn wemo_data(&self) -> Option<WemoEntryData> {
        WemoEntryData::from_data(&self.data)
    }

    /// Ignored entries only reserve their unique id and are never set up
    pub fn is_ignored(&self) -> bool {
        self.source == ConfigEntrySource::Ignore
    }

    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    pub fn supports_unload(&self) -> bool {
        self.state.is_recoverable()
    }

    /// Attempt to transition to a new state with validation.
    ///
    /// On success, updates the state and reason fields.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state.try_transition(new_state)?;

        self.state = new_state;
        self.reason = reason;

        // Reset tries counter on non-retry states
        if !matches!(
            new_state,
            ConfigEntryState::SetupRetry | ConfigEntryState::SetupInProgress
        ) {
            self.tries = 0;
        }

        Ok(())
    }

    /// Increment the retry counter and return the new count
    pub fn increment_tries(&mut self) -> u32 {
        self.tries += 1;
        self.tries
    }
}

/// Update data for a config entry
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<HashMap<String, Value>>,
    pub unique_id: Option<Option<String>>,
    pub version: Option<u32>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: HashMap<String, Value>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn wemo_data(self, data: &WemoEntryData) -> Self {
        self.data(data.to_data())
    }

    pub fn unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(Some(unique_id.into()));
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }
}
