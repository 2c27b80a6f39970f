//! Config Entries
//!
//! One config entry per WeMo device, keyed by the device serial number.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single configured device
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntries`] - Store for all config entries
//! - [`Reconciler`] - Folds resolved devices into the store
//! - [`migrate`] - Decides what happens to entries from older schema versions
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/core.config_entries`.

pub mod entry;
pub mod manager;
pub mod migrate;
pub mod reconcile;
pub mod state_machine;

pub use entry::{
    ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate, WemoEntryData,
    CONFIG_ENTRY_VERSION,
};

pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, STORAGE_KEY,
    STORAGE_MINOR_VERSION, STORAGE_VERSION,
};

pub use migrate::{migrate, MigrationError, MigrationOutcome};
pub use reconcile::{plan, EntryChanges, ReconcileOutcome, ReconcilePlan, Reconciler};
pub use state_machine::{calculate_retry_delay, InvalidTransition};
