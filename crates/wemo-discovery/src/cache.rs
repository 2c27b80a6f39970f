//! Resolution cache
//!
//! Holds devices resolved during a config flow so that setting up the entry
//! right after does not probe the device a second time. The owner of a
//! device takes it out of the cache with [`ResolutionCache::take`].

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;
use wemo_core::DeviceDescriptor;

/// Resolved devices keyed by `"{host}:{port}"`
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: DashMap<String, Arc<DeviceDescriptor>>,
    /// Per-key locks serializing resolution of the same endpoint
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a device without removing it
    pub fn get(&self, key: &str) -> Option<Arc<DeviceDescriptor>> {
        self.entries.get(key).map(|r| Arc::clone(r.value()))
    }

    pub fn insert(&self, key: impl Into<String>, device: Arc<DeviceDescriptor>) {
        let key = key.into();
        trace!("Caching device {} under {}", device.serial_number, key);
        self.entries.insert(key, device);
    }

    /// Remove and return a device.
    ///
    /// Of several concurrent callers for the same key at most one gets it.
    pub fn take(&self, key: &str) -> Option<Arc<DeviceDescriptor>> {
        self.entries.remove(key).map(|(_, device)| device)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Lock guarding resolution of `key`
    pub(crate) fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock for `key` once no caller holds it any more
    pub(crate) fn release_key_lock(&self, key: &str) {
        self.in_flight
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    #[cfg(test)]
    pub(crate) fn key_lock_count(&self) -> usize {
        self.in_flight.len()
    }
}
