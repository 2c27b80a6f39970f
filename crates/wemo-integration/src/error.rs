use std::time::Duration;
use thiserror::Error;
use wemo_config_entries::{ConfigEntriesError, MigrationError, MigrationOutcome};
use wemo_core::EndpointError;
use wemo_discovery::ResolveError;
use wemo_event_bus::SubscriptionError;
use wemo_registries::StorageError;

/// Errors from driving a config flow
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Required field missing: {0}")]
    MissingRequiredField(&'static str),

    #[error("Invalid flow input: {0}")]
    InvalidInput(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidEndpoint(#[from] EndpointError),

    #[error("Invalid SSDP location {location}: {reason}")]
    InvalidLocation { location: String, reason: String },

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),
}

/// Errors from setting up or unloading an entry
#[derive(Debug, Error)]
pub enum SetupError {
    /// The device could not be reached, setup is retried later
    #[error("Device for entry {entry_id} not ready, retrying in {retry_in:?}")]
    NotReady {
        entry_id: String,
        retry_in: Duration,
        #[source]
        source: ResolveError,
    },

    #[error("Entry {entry_id} needs migration ({outcome:?}), not set up")]
    NotMigrated {
        entry_id: String,
        outcome: MigrationOutcome,
    },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error("Entry {0} has no host configured")]
    MissingHost(String),

    #[error("Device for entry {entry_id} cannot be set up")]
    Device {
        entry_id: String,
        #[source]
        source: ResolveError,
    },

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("Device registry error: {0}")]
    Storage(#[from] StorageError),
}

impl SetupError {
    pub fn is_not_ready(&self) -> bool {
        matches!(self, SetupError::NotReady { .. })
    }
}

pub type SetupResult<T> = Result<T, SetupError>;
