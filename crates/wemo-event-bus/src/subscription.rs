//! Subscription registry seam
//!
//! The transport delivering push notifications lives outside this crate.
//! Setup registers a device with it and unload unregisters it again.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use wemo_core::DeviceDescriptor;

use crate::bus::EventBus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("Subscription registry is not running")]
    NotRunning,

    #[error("Device {0} is not registered")]
    NotRegistered(String),

    #[error("Subscription failed: {0}")]
    Failed(String),
}

/// Registers devices for push notifications
#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn start(&self) -> Result<(), SubscriptionError>;

    async fn stop(&self);

    async fn register(&self, device: Arc<DeviceDescriptor>) -> Result<(), SubscriptionError>;

    async fn unregister(&self, device_id: &str) -> Result<(), SubscriptionError>;
}

/// Registry keeping track of devices in process
///
/// Notifications are expected to be fed into the shared [`EventBus`] by
/// whatever receives them. Registering a device starts its sequence numbers
/// afresh.
pub struct LocalSubscriptionRegistry {
    bus: Arc<EventBus>,
    running: AtomicBool,
    devices: DashMap<String, Arc<DeviceDescriptor>>,
}

impl LocalSubscriptionRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            running: AtomicBool::new(false),
            devices: DashMap::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

#[async_trait]
impl SubscriptionRegistry for LocalSubscriptionRegistry {
    async fn start(&self) -> Result<(), SubscriptionError> {
        if !self.running.swap(true, Ordering::SeqCst) {
            info!("Started WeMo subscription registry");
        }
        Ok(())
    }

    async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            debug!("Shutting down WeMo event subscriptions");
            for device in self.devices.iter() {
                self.bus.reset(device.key());
            }
            self.devices.clear();
        }
    }

    async fn register(&self, device: Arc<DeviceDescriptor>) -> Result<(), SubscriptionError> {
        if !self.is_running() {
            return Err(SubscriptionError::NotRunning);
        }
        let device_id = device.serial_number.clone();
        self.bus.reset(&device_id);
        debug!("Subscribed to events of {} ({})", device.name, device_id);
        self.devices.insert(device_id, device);
        Ok(())
    }

    async fn unregister(&self, device_id: &str) -> Result<(), SubscriptionError> {
        self.devices
            .remove(device_id)
            .ok_or_else(|| SubscriptionError::NotRegistered(device_id.to_string()))?;
        self.bus.reset(device_id);
        debug!("Unsubscribed from events of {}", device_id);
        Ok(())
    }
}
