//! WeMo registries
//!
//! Persistent state shared by the integration:
//! - [`Storage`] - versioned JSON files in the `.storage/` directory
//! - [`DeviceRegistry`] - devices and the config entries they belong to
//!
//! The device registry is what the schema migrator inspects: a device that
//! has been moved from the old shared entry to its own entry is linked to
//! both.

pub mod device_registry;
pub mod storage;

pub use device_registry::{DeviceEntry, DeviceIdentifier, DeviceRegistry, DeviceRegistryData};
pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
