//! Device Registry
//!
//! Tracks registered devices, their identifiers and the config entries they
//! are linked to, with indexes for identifier and config entry lookups.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::storage::{Storable, Storage, StorageResult};

/// Storage key for device registry
pub const STORAGE_KEY: &str = "core.device_registry";
pub const STORAGE_VERSION: u32 = 1;
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// A device identifier (domain, id) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentifier(pub String, pub String);

impl DeviceIdentifier {
    pub fn new(domain: impl Into<String>, id: impl Into<String>) -> Self {
        Self(domain.into(), id.into())
    }

    pub fn domain(&self) -> &str {
        &self.0
    }

    pub fn id(&self) -> &str {
        &self.1
    }

    /// Create a key for indexing
    pub fn key(&self) -> String {
        format!("{}:{}", self.0, self.1)
    }
}

/// A registered device entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Internal UUID
    pub id: String,

    /// Unique identifiers by domain (e.g., [["wemo", "221517K0101769"]])
    #[serde(default)]
    pub identifiers: Vec<DeviceIdentifier>,

    /// Associated config entries
    #[serde(default)]
    pub config_entries: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_config_entry: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Firmware version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,

    /// URL of the device description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_url: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

impl DeviceEntry {
    pub fn new(name: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identifiers: Vec::new(),
            config_entries: Vec::new(),
            primary_config_entry: None,
            name: name.map(|s| s.to_string()),
            manufacturer: None,
            model: None,
            sw_version: None,
            serial_number: None,
            configuration_url: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Add a config entry link, keeping the first one as primary
    pub fn link_config_entry(&mut self, config_entry_id: &str) -> bool {
        if self.config_entries.iter().any(|id| id == config_entry_id) {
            return false;
        }
        if self.primary_config_entry.is_none() {
            self.primary_config_entry = Some(config_entry_id.to_string());
        }
        self.config_entries.push(config_entry_id.to_string());
        true
    }

    /// Whether this device is linked to more than one config entry
    pub fn is_shared(&self) -> bool {
        self.config_entries.len() > 1
    }
}

/// Device registry data for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRegistryData {
    pub devices: Vec<DeviceEntry>,
}

impl Storable for DeviceRegistryData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Device Registry
///
/// Entries are stored as `Arc<DeviceEntry>` to avoid cloning on reads.
pub struct DeviceRegistry {
    storage: Arc<Storage>,

    /// Primary index: device_id -> DeviceEntry
    by_id: DashMap<String, Arc<DeviceEntry>>,

    /// Index: identifier key -> device_id
    by_identifier: DashMap<String, String>,

    /// Index: config_entry_id -> set of device_ids
    by_config_entry_id: DashMap<String, HashSet<String>>,
}

impl DeviceRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            by_id: DashMap::new(),
            by_identifier: DashMap::new(),
            by_config_entry_id: DashMap::new(),
        }
    }

    /// Load from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<DeviceRegistryData>().await? {
            info!(
                "Loading {} devices from storage (v{}.{})",
                storage_file.data.devices.len(),
                storage_file.version,
                storage_file.minor_version
            );
            for entry in storage_file.data.devices {
                self.index_entry(Arc::new(entry));
            }
        }
        Ok(())
    }

    /// Save to storage
    pub async fn save(&self) -> StorageResult<()> {
        let mut devices: Vec<DeviceEntry> =
            self.by_id.iter().map(|r| (**r.value()).clone()).collect();
        devices.sort_by_key(|d| d.created_at);

        self.storage.save(&DeviceRegistryData { devices }).await?;
        debug!("Saved {} devices to storage", self.by_id.len());
        Ok(())
    }

    fn index_entry(&self, entry: Arc<DeviceEntry>) {
        let device_id = entry.id.clone();

        for identifier in &entry.identifiers {
            self.by_identifier
                .insert(identifier.key(), device_id.clone());
        }

        for config_entry_id in &entry.config_entries {
            self.by_config_entry_id
                .entry(config_entry_id.clone())
                .or_default()
                .insert(device_id.clone());
        }

        self.by_id.insert(device_id, entry);
    }

    fn unindex_entry(&self, entry: &DeviceEntry) {
        for identifier in &entry.identifiers {
            self.by_identifier.remove(&identifier.key());
        }
        for config_entry_id in &entry.config_entries {
            if let Some(mut ids) = self.by_config_entry_id.get_mut(config_entry_id) {
                ids.remove(&entry.id);
            }
        }
        self.by_id.remove(&entry.id);
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        self.by_id.get(device_id).map(|r| Arc::clone(r.value()))
    }

    pub fn get_by_identifier(&self, domain: &str, id: &str) -> Option<Arc<DeviceEntry>> {
        let key = format!("{}:{}", domain, id);
        self.by_identifier
            .get(&key)
            .map(|r| r.value().clone())
            .and_then(|device_id| self.get(&device_id))
    }

    /// Get all devices linked to a config entry
    pub fn get_by_config_entry_id(&self, config_entry_id: &str) -> Vec<Arc<DeviceEntry>> {
        let ids: Vec<String> = self
            .by_config_entry_id
            .get(config_entry_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Get or create a device
    ///
    /// Looks the device up by any of its identifiers. An existing device gets
    /// the config entry link and any new identifiers merged in.
    pub fn get_or_create(
        &self,
        identifiers: &[DeviceIdentifier],
        config_entry_id: Option<&str>,
        name: Option<&str>,
    ) -> Arc<DeviceEntry> {
        let existing = identifiers
            .iter()
            .find_map(|ident| self.get_by_identifier(ident.domain(), ident.id()));

        if let Some(existing) = existing {
            debug!("Found existing device by identifier: {}", existing.id);
            let needs_link = config_entry_id
                .map(|ce| !existing.config_entries.iter().any(|id| id == ce))
                .unwrap_or(false);
            let new_idents: Vec<_> = identifiers
                .iter()
                .filter(|i| !existing.identifiers.contains(i))
                .cloned()
                .collect();

            if !needs_link && new_idents.is_empty() {
                return existing;
            }
            return self
                .update(&existing.id, |e| {
                    if let Some(ce) = config_entry_id {
                        e.link_config_entry(ce);
                    }
                    e.identifiers.extend(new_idents);
                })
                .unwrap_or(existing);
        }

        let mut entry = DeviceEntry::new(name);
        entry.identifiers = identifiers.to_vec();
        if let Some(ce) = config_entry_id {
            entry.link_config_entry(ce);
        }

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));

        info!("Registered new device: {:?} ({})", name, entry.id);
        entry
    }

    /// Update a device entry, returning the new version
    pub fn update<F>(&self, device_id: &str, f: F) -> Option<Arc<DeviceEntry>>
    where
        F: FnOnce(&mut DeviceEntry),
    {
        let current = self.get(device_id)?;
        self.unindex_entry(&current);

        let mut entry = (*current).clone();
        f(&mut entry);
        entry.modified_at = Utc::now();

        let entry = Arc::new(entry);
        self.index_entry(Arc::clone(&entry));
        Some(entry)
    }

    pub fn remove(&self, device_id: &str) -> Option<Arc<DeviceEntry>> {
        let entry = self.get(device_id)?;
        self.unindex_entry(&entry);
        info!("Removed device: {}", device_id);
        Some(entry)
    }

    /// Unlink a config entry from all devices.
    ///
    /// Devices left without any config entry are removed.
    pub fn clear_config_entry(&self, config_entry_id: &str) {
        for device in self.get_by_config_entry_id(config_entry_id) {
            if device.config_entries.len() <= 1 {
                self.remove(&device.id);
                continue;
            }
            self.update(&device.id, |entry| {
                entry.config_entries.retain(|id| id != config_entry_id);
                if entry.primary_config_entry.as_deref() == Some(config_entry_id) {
                    entry.primary_config_entry = entry.config_entries.first().cloned();
                }
            });
        }
        self.by_config_entry_id.remove(config_entry_id);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
