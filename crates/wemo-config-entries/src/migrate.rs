//! Config entry schema migration
//!
//! Version 1 entries each covered every device found by discovery. Version 2
//! has one entry per device. A version 1 entry becomes redundant once each
//! of its devices has been linked to a version 2 entry as well.

use thiserror::Error;
use tracing::{debug, error};
use wemo_registries::DeviceRegistry;

use crate::entry::{ConfigEntry, CONFIG_ENTRY_VERSION};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// Current schema, set up as usual
    Current,
    /// Every device has moved to its own entry, the old entry can be removed
    Superseded,
    /// Some device still depends on the old entry
    Retain,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    #[error("Config entry {entry_id} has unsupported version {version}")]
    UnsupportedVersion { entry_id: String, version: u32 },
}

/// Decide what to do with `entry` given the devices linked to it.
///
/// Reads the registry only; removing a superseded entry is up to the caller.
pub fn migrate(
    entry: &ConfigEntry,
    devices: &DeviceRegistry,
) -> Result<MigrationOutcome, MigrationError> {
    match entry.version {
        version if version >= CONFIG_ENTRY_VERSION => Ok(MigrationOutcome::Current),
        1 => {
            let linked = devices.get_by_config_entry_id(&entry.entry_id);
            let superseded = linked.iter().all(|device| device.is_shared());
            debug!(
                "Version 1 entry {} has {} devices, superseded={}",
                entry.entry_id,
                linked.len(),
                superseded
            );
            Ok(if superseded {
                MigrationOutcome::Superseded
            } else {
                MigrationOutcome::Retain
            })
        }
        version => {
            error!(
                "Cannot migrate config entry {} from version {}",
                entry.entry_id, version
            );
            Err(MigrationError::UnsupportedVersion {
                entry_id: entry.entry_id.clone(),
                version,
            })
        }
    }
}
