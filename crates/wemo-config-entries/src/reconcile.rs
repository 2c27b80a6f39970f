//! Entry reconciliation
//!
//! Folds a resolved device into the config entries so that each serial
//! number ends up with exactly one entry carrying the latest address and
//! category.

use std::sync::Arc;
use tracing::{debug, info};
use wemo_core::{DeviceDescriptor, DeviceEndpoint, FunctionalCategory, DOMAIN};

use crate::entry::{ConfigEntry, ConfigEntrySource, ConfigEntryUpdate, WemoEntryData};
use crate::manager::{ConfigEntries, ConfigEntriesError, ConfigEntriesResult};

/// Fields of an existing entry that need rewriting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryChanges {
    pub endpoint: Option<DeviceEndpoint>,
    pub category: Option<FunctionalCategory>,
}

impl EntryChanges {
    pub fn is_empty(&self) -> bool {
        self.endpoint.is_none() && self.category.is_none()
    }
}

/// What reconciling a device against the existing entry would do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcilePlan {
    /// No entry for the serial number yet
    Create(WemoEntryData),
    Update {
        entry_id: String,
        changes: EntryChanges,
    },
    Unchanged {
        entry_id: String,
    },
}

/// Result of [`Reconciler::reconcile`]
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    Created(ConfigEntry),
    Updated(ConfigEntry),
    Unchanged(ConfigEntry),
    /// Another create for the same serial number won the race
    Duplicate(ConfigEntry),
}

impl ReconcileOutcome {
    pub fn entry(&self) -> &ConfigEntry {
        match self {
            ReconcileOutcome::Created(e)
            | ReconcileOutcome::Updated(e)
            | ReconcileOutcome::Unchanged(e)
            | ReconcileOutcome::Duplicate(e) => e,
        }
    }

    pub fn into_entry(self) -> ConfigEntry {
        match self {
            ReconcileOutcome::Created(e)
            | ReconcileOutcome::Updated(e)
            | ReconcileOutcome::Unchanged(e)
            | ReconcileOutcome::Duplicate(e) => e,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, ReconcileOutcome::Created(_))
    }

    /// Whether an existing entry was rewritten
    pub fn is_updated(&self) -> bool {
        matches!(self, ReconcileOutcome::Updated(_))
    }
}

/// Decide how `descriptor`, reached at `endpoint`, maps onto `existing`.
///
/// The stored address is the one the device was configured with, so a
/// static `host` without port stays port 0 rather than taking the port the
/// device answered on. Ignored entries are never rewritten.
pub fn plan(
    descriptor: &DeviceDescriptor,
    endpoint: &DeviceEndpoint,
    existing: Option<&ConfigEntry>,
) -> ReconcilePlan {
    let category = descriptor.category();

    let Some(entry) = existing else {
        let mut data = WemoEntryData::new(endpoint);
        data.category = Some(category);
        return ReconcilePlan::Create(data);
    };

    let entry_id = entry.entry_id.clone();
    if entry.is_ignored() {
        return ReconcilePlan::Unchanged { entry_id };
    }

    let current = entry.wemo_data();
    let mut changes = EntryChanges::default();
    if current.as_ref().map(WemoEntryData::endpoint).as_ref() != Some(endpoint) {
        changes.endpoint = Some(endpoint.clone());
    }
    if current.and_then(|d| d.category) != Some(category) {
        changes.category = Some(category);
    }

    if changes.is_empty() {
        ReconcilePlan::Unchanged { entry_id }
    } else {
        ReconcilePlan::Update { entry_id, changes }
    }
}

/// Applies reconciliation plans to a [`ConfigEntries`] store
pub struct Reconciler {
    entries: Arc<ConfigEntries>,
}

impl Reconciler {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        &self.entries
    }

    /// Create or update the entry for `descriptor`
    pub async fn reconcile(
        &self,
        descriptor: &DeviceDescriptor,
        endpoint: &DeviceEndpoint,
        source: ConfigEntrySource,
    ) -> ConfigEntriesResult<ReconcileOutcome> {
        let existing = self
            .entries
            .get_by_unique_id(DOMAIN, &descriptor.serial_number);

        match plan(descriptor, endpoint, existing.as_ref()) {
            ReconcilePlan::Create(data) => {
                let entry = ConfigEntry::new(DOMAIN, descriptor.name.clone())
                    .with_wemo_data(&data)
                    .with_unique_id(descriptor.serial_number.clone())
                    .with_source(source);

                match self.entries.add(entry).await {
                    Ok(entry) => Ok(ReconcileOutcome::Created(entry)),
                    Err(ConfigEntriesError::AlreadyExists { .. }) => {
                        debug!(
                            "Entry for {} created concurrently",
                            descriptor.serial_number
                        );
                        self.reconcile_existing(descriptor, endpoint).await
                    }
                    Err(e) => Err(e),
                }
            }
            ReconcilePlan::Update { entry_id, changes } => self
                .apply(&entry_id, changes)
                .await
                .map(ReconcileOutcome::Updated),
            ReconcilePlan::Unchanged { entry_id } => {
                debug!(
                    "Entry {} already up to date for {}",
                    entry_id, descriptor.serial_number
                );
                self.entries
                    .get(&entry_id)
                    .map(ReconcileOutcome::Unchanged)
                    .ok_or(ConfigEntriesError::NotFound(entry_id))
            }
        }
    }

    /// Second pass after losing a create race: fold into the winner
    async fn reconcile_existing(
        &self,
        descriptor: &DeviceDescriptor,
        endpoint: &DeviceEndpoint,
    ) -> ConfigEntriesResult<ReconcileOutcome> {
        let existing = self
            .entries
            .get_by_unique_id(DOMAIN, &descriptor.serial_number)
            .ok_or_else(|| ConfigEntriesError::NotFound(descriptor.serial_number.clone()))?;

        match plan(descriptor, endpoint, Some(&existing)) {
            ReconcilePlan::Update { entry_id, changes } => self
                .apply(&entry_id, changes)
                .await
                .map(ReconcileOutcome::Updated),
            _ => Ok(ReconcileOutcome::Duplicate(existing)),
        }
    }

    async fn apply(
        &self,
        entry_id: &str,
        changes: EntryChanges,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        let mut data = entry.wemo_data().unwrap_or_else(|| WemoEntryData {
            host: String::new(),
            port: 0,
            category: None,
        });

        if let Some(endpoint) = changes.endpoint {
            info!(
                "Updating address of {} from {} to {}",
                entry.title,
                data.endpoint(),
                endpoint
            );
            data.host = endpoint.host;
            data.port = endpoint.port;
        }
        if let Some(category) = changes.category {
            data.category = Some(category);
        }

        self.entries
            .update(entry_id, ConfigEntryUpdate::new().wemo_data(&data))
            .await
    }

    /// Point an existing entry at a new address.
    ///
    /// Used when a device is rediscovered before its description is fetched.
    /// Ignored entries are left alone. Returns `Updated` only if the stored
    /// address changed.
    pub async fn update_address(
        &self,
        entry_id: &str,
        endpoint: &DeviceEndpoint,
    ) -> ConfigEntriesResult<ReconcileOutcome> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        let current = entry.wemo_data().map(|d| d.endpoint());
        if entry.is_ignored() || current.as_ref() == Some(endpoint) {
            return Ok(ReconcileOutcome::Unchanged(entry));
        }

        self.apply(
            entry_id,
            EntryChanges {
                endpoint: Some(endpoint.clone()),
                category: None,
            },
        )
        .await
        .map(ReconcileOutcome::Updated)
    }

    /// Rewrite the stored category of an entry
    pub async fn update_category(
        &self,
        entry_id: &str,
        category: FunctionalCategory,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        if entry.wemo_data().and_then(|d| d.category) == Some(category) {
            return Ok(entry);
        }

        info!("Setting category of {} to {}", entry.title, category);
        self.apply(
            entry_id,
            EntryChanges {
                endpoint: None,
                category: Some(category),
            },
        )
        .await
    }
}
