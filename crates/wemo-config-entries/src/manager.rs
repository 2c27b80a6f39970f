//! Config Entries store
//!
//! Holds every config entry in memory, indexed by id, domain and unique id,
//! and writes the whole set to storage after each change.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use wemo_registries::{Storable, Storage, StorageResult};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate};
use crate::state_machine::InvalidTransition;

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Config entries errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Storage error: {0}")]
    Storage(#[from] wemo_registries::StorageError),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Config entries data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Config Entries store
///
/// At most one entry exists per `(domain, unique_id)`. Creating a second one
/// fails with [`ConfigEntriesError::AlreadyExists`], also when two creates
/// race.
pub struct ConfigEntries {
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    by_unique_id: DashMap<(String, String), String>,

    /// Serializes writes of the storage file
    save_lock: Mutex<()>,
}

impl ConfigEntries {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<ConfigEntriesData>().await? {
            info!(
                "Loading {} config entries from storage (v{}.{})",
                storage_file.data.entries.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.entries {
                if let Some(ref unique_id) = entry.unique_id {
                    self.by_unique_id.insert(
                        (entry.domain.clone(), unique_id.clone()),
                        entry.entry_id.clone(),
                    );
                }
                self.index_entry(entry);
            }
        }
        Ok(())
    }

    /// Save entries to storage
    pub async fn save(&self) -> StorageResult<()> {
        let _guard = self.save_lock.lock().await;
        let mut entries: Vec<ConfigEntry> = self.iter().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let count = entries.len();
        self.storage.save(&ConfigEntriesData { entries }).await?;
        debug!("Saved {} config entries to storage", count);
        Ok(())
    }

    /// Add to the primary and domain indexes
    fn index_entry(&self, entry: ConfigEntry) {
        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry.entry_id.clone());
        self.entries.insert(entry.entry_id.clone(), entry);
    }

    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }
        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .remove_if(&(entry.domain.clone(), unique_id.clone()), |_, id| {
                    id == &entry.entry_id
                });
        }
        self.entries.remove(&entry.entry_id);
    }

    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        let ids: Vec<String> = self
            .by_domain
            .get(domain)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut entries: Vec<_> = ids.iter().filter_map(|id| self.get(id)).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        let entry_id = self
            .by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .map(|r| r.value().clone())?;
        self.get(&entry_id)
    }

    /// Add a new config entry
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            match self
                .by_unique_id
                .entry((entry.domain.clone(), unique_id.clone()))
            {
                Entry::Occupied(_) => {
                    return Err(ConfigEntriesError::AlreadyExists {
                        domain: entry.domain.clone(),
                        unique_id: unique_id.clone(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry.entry_id.clone());
                }
            }
        }

        self.index_entry(entry.clone());
        if let Err(e) = self.save().await {
            warn!("Failed to save new config entry {}: {}", entry.entry_id, e);
            self.unindex_entry(&entry);
            return Err(e.into());
        }

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );

        Ok(entry)
    }

    /// Update an existing entry in place
    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let updated = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

            if let Some(unique_id) = update.unique_id {
                if unique_id != entry.unique_id {
                    if let Some(ref new_id) = unique_id {
                        match self
                            .by_unique_id
                            .entry((entry.domain.clone(), new_id.clone()))
                        {
                            Entry::Occupied(_) => {
                                return Err(ConfigEntriesError::AlreadyExists {
                                    domain: entry.domain.clone(),
                                    unique_id: new_id.clone(),
                                });
                            }
                            Entry::Vacant(slot) => {
                                slot.insert(entry_id.to_string());
                            }
                        }
                    }
                    if let Some(ref old_id) = entry.unique_id {
                        self.by_unique_id
                            .remove(&(entry.domain.clone(), old_id.clone()));
                    }
                    entry.unique_id = unique_id;
                }
            }
            if let Some(title) = update.title {
                entry.title = title;
            }
            if let Some(data) = update.data {
                entry.data = data;
            }
            if let Some(version) = update.version {
                entry.version = version;
            }
            entry.modified_at = Utc::now();
            entry.clone()
        };

        self.save().await?;
        debug!("Updated config entry: {}", entry_id);
        Ok(updated)
    }

    /// Remove an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);
        self.save().await?;

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );

        Ok(entry)
    }

    /// Move an entry to a new lifecycle state
    pub fn try_set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        let from = entry.state;
        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed {:?} -> {:?}", entry_id, from, state);
        Ok(entry.clone())
    }

    /// Count a failed setup attempt, returning the number of tries so far
    pub fn increment_tries(&self, entry_id: &str) -> Option<u32> {
        self.entries
            .get_mut(entry_id)
            .map(|mut entry| entry.increment_tries())
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ConfigEntry> + '_ {
        self.entries.iter().map(|r| r.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{ConfigEntrySource, WemoEntryData, CONFIG_ENTRY_VERSION};
    use tempfile::TempDir;
    use wemo_core::{DeviceEndpoint, DOMAIN};

    fn create_test_manager() -> (TempDir, ConfigEntries) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));
        let manager = ConfigEntries::new(storage);
        (temp_dir, manager)
    }

    fn device_entry(serial: &str, host: &str, port: u16) -> ConfigEntry {
        let data = WemoEntryData::new(&DeviceEndpoint::new(host, port).unwrap());
        ConfigEntry::new(DOMAIN, serial)
            .with_wemo_data(&data)
            .with_unique_id(serial)
    }

    #[tokio::test]
    async fn test_add_rolled_back_when_save_fails() {
        let (dir, manager) = create_test_manager();
        // A file where the storage directory should be
        std::fs::write(dir.path().join(".storage"), "").unwrap();

        let result = manager.add(device_entry("SERIAL1", "10.0.0.1", 49153)).await;
        assert!(matches!(result, Err(ConfigEntriesError::Storage(_))));
        assert!(manager.is_empty());
        assert!(manager.get_by_unique_id(DOMAIN, "SERIAL1").is_none());
        assert!(manager.get_by_domain(DOMAIN).is_empty());

        // The unique id is free again
        std::fs::remove_file(dir.path().join(".storage")).unwrap();
        manager
            .add(device_entry("SERIAL1", "10.0.0.1", 49153))
            .await
            .unwrap();
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_add_entry() {
        let (_dir, manager) = create_test_manager();

        let added = manager
            .add(device_entry("SERIAL1", "10.0.0.1", 49153).with_source(ConfigEntrySource::Ssdp))
            .await
            .unwrap();
        assert_eq!(added.domain, "wemo");
        assert_eq!(manager.len(), 1);
        assert_eq!(
            manager.get_by_unique_id(DOMAIN, "SERIAL1").unwrap().entry_id,
            added.entry_id
        );
    }

    #[tokio::test]
    async fn test_duplicate_unique_id_rejected() {
        let (_dir, manager) = create_test_manager();

        manager
            .add(device_entry("SERIAL1", "10.0.0.1", 0))
            .await
            .unwrap();
        let result = manager.add(device_entry("SERIAL1", "10.0.0.2", 0)).await;

        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_create_one_entry() {
        let (_dir, manager) = create_test_manager();
        let manager = Arc::new(manager);

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.add(device_entry("SERIAL1", "h", 1)).await })
            })
            .collect();
        let created = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(_))))
            .count();

        assert_eq!(created, 1);
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_update_entry() {
        let (_dir, manager) = create_test_manager();
        let entry = manager
            .add(device_entry("SERIAL1", "10.0.0.1", 49153))
            .await
            .unwrap();

        let data = WemoEntryData::new(&DeviceEndpoint::new("10.0.0.9", 49154).unwrap());
        let updated = manager
            .update(
                &entry.entry_id,
                ConfigEntryUpdate::new().title("Desk").wemo_data(&data),
            )
            .await
            .unwrap();

        assert_eq!(updated.title, "Desk");
        assert_eq!(updated.wemo_data().unwrap().host, "10.0.0.9");
        assert_eq!(manager.get(&entry.entry_id).unwrap().wemo_data(), Some(data));
    }

    #[tokio::test]
    async fn test_update_keeps_state() {
        let (_dir, manager) = create_test_manager();
        let entry = manager
            .add(device_entry("SERIAL1", "10.0.0.1", 49153))
            .await
            .unwrap();
        manager
            .try_set_state(&entry.entry_id, ConfigEntryState::SetupInProgress, None)
            .unwrap();

        let updated = manager
            .update(&entry.entry_id, ConfigEntryUpdate::new().title("Desk"))
            .await
            .unwrap();
        assert_eq!(updated.state, ConfigEntryState::SetupInProgress);
    }

    #[tokio::test]
    async fn test_update_unique_id_conflict() {
        let (_dir, manager) = create_test_manager();
        manager.add(device_entry("A", "h", 1)).await.unwrap();
        let b = manager.add(device_entry("B", "h", 2)).await.unwrap();

        let result = manager
            .update(&b.entry_id, ConfigEntryUpdate::new().unique_id("A"))
            .await;
        assert!(matches!(
            result,
            Err(ConfigEntriesError::AlreadyExists { .. })
        ));

        manager
            .update(&b.entry_id, ConfigEntryUpdate::new().unique_id("C"))
            .await
            .unwrap();
        assert!(manager.get_by_unique_id(DOMAIN, "B").is_none());
        assert_eq!(
            manager.get_by_unique_id(DOMAIN, "C").unwrap().entry_id,
            b.entry_id
        );
    }

    #[tokio::test]
    async fn test_remove_entry_frees_unique_id() {
        let (_dir, manager) = create_test_manager();

        let entry = manager.add(device_entry("SERIAL1", "h", 1)).await.unwrap();
        manager.remove(&entry.entry_id).await.unwrap();
        assert!(manager.is_empty());
        assert!(manager.get_by_domain(DOMAIN).is_empty());

        manager.add(device_entry("SERIAL1", "h", 1)).await.unwrap();
        assert_eq!(manager.len(), 1);

        assert!(matches!(
            manager.remove("missing").await,
            Err(ConfigEntriesError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_state_change_rejected() {
        let (_dir, manager) = create_test_manager();
        let entry = manager.add(device_entry("SERIAL1", "h", 1)).await.unwrap();

        let result = manager.try_set_state(&entry.entry_id, ConfigEntryState::Loaded, None);
        assert!(matches!(
            result,
            Err(ConfigEntriesError::InvalidTransition(_))
        ));
        assert_eq!(
            manager.get(&entry.entry_id).unwrap().state,
            ConfigEntryState::NotLoaded
        );
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::new(temp_dir.path()));

        {
            let manager = ConfigEntries::new(storage.clone());
            let entry = manager
                .add(device_entry("SERIAL1", "10.0.0.1", 49153).with_source(ConfigEntrySource::Import))
                .await
                .unwrap();
            manager
                .add(ConfigEntry::new(DOMAIN, "WeMo").with_version(1, 1))
                .await
                .unwrap();
            manager
                .try_set_state(&entry.entry_id, ConfigEntryState::SetupInProgress, None)
                .unwrap();
        }

        let manager = ConfigEntries::new(storage);
        manager.load().await.unwrap();

        assert_eq!(manager.len(), 2);
        let entry = manager.get_by_unique_id(DOMAIN, "SERIAL1").unwrap();
        assert_eq!(entry.source, ConfigEntrySource::Import);
        assert_eq!(entry.version, CONFIG_ENTRY_VERSION);
        assert_eq!(entry.state, ConfigEntryState::NotLoaded);
        assert_eq!(entry.wemo_data().unwrap().port, 49153);

        let mut versions: Vec<u32> = manager
            .get_by_domain(DOMAIN)
            .iter()
            .map(|e| e.version)
            .collect();
        versions.sort();
        assert_eq!(versions, vec![1, 2]);
    }
}
