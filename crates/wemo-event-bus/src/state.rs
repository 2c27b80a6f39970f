//! Latest known state of each device

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::StateChange;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub device_id: String,
    /// Last reported value per property
    pub properties: HashMap<String, String>,
    /// Sequence number of the last applied change
    pub sequence: Option<u64>,
    pub available: bool,
    pub updated_at: DateTime<Utc>,
}

impl DeviceState {
    fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            properties: HashMap::new(),
            sequence: None,
            available: true,
            updated_at: Utc::now(),
        }
    }
}

/// Tracks state and availability per device
#[derive(Debug, Default)]
pub struct DeviceStateTracker {
    states: DashMap<String, DeviceState>,
}

impl DeviceStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<DeviceState> {
        self.states.get(device_id).map(|s| s.value().clone())
    }

    pub fn value(&self, device_id: &str, property: &str) -> Option<String> {
        self.states
            .get(device_id)
            .and_then(|s| s.properties.get(property).cloned())
    }

    pub fn is_available(&self, device_id: &str) -> bool {
        self.states
            .get(device_id)
            .map(|s| s.available)
            .unwrap_or(false)
    }

    /// Apply a change unless an equal or newer one was applied already
    pub fn apply(&self, change: &StateChange) -> bool {
        let mut state = self
            .states
            .entry(change.device_id.clone())
            .or_insert_with(|| DeviceState::new(&change.device_id));

        if state
            .sequence
            .is_some_and(|seq| change.payload.sequence <= seq)
        {
            debug!(
                "Ignoring stale change {} for {}",
                change.payload.sequence, change.device_id
            );
            return false;
        }

        state.sequence = Some(change.payload.sequence);
        state
            .properties
            .insert(change.payload.property.clone(), change.payload.value.clone());
        state.updated_at = change.received_at;
        if !state.available {
            state.available = true;
            info!("Reconnected to {}", change.device_id);
        }
        true
    }

    /// A poll or command succeeded
    pub fn record_success(&self, device_id: &str) {
        let mut state = self
            .states
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceState::new(device_id));
        if !state.available {
            state.available = true;
            info!("Reconnected to {}", device_id);
        }
    }

    /// A poll or command failed, mark the device unavailable
    pub fn record_failure(&self, device_id: &str, reason: &str) {
        let mut state = self
            .states
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceState::new(device_id));
        if state.available {
            state.available = false;
            warn!("Lost connection to {}: {}", device_id, reason);
        }
    }

    pub fn remove(&self, device_id: &str) -> Option<DeviceState> {
        self.states.remove(device_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Apply every change received on `rx` until the bus goes away
    pub fn spawn(self: Arc<Self>, mut rx: broadcast::Receiver<StateChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        self.apply(&change);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("State tracker lagged, skipped {} changes", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("State tracker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::event::EventPayload;
    use std::time::Duration;

    fn change(device_id: &str, sequence: u64, value: &str) -> StateChange {
        StateChange {
            device_id: device_id.to_string(),
            payload: EventPayload::new(sequence, "BinaryState", value),
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_apply_latest_only() {
        let tracker = DeviceStateTracker::new();
        assert!(tracker.apply(&change("A", 2, "1")));
        assert!(!tracker.apply(&change("A", 2, "1")));
        assert!(!tracker.apply(&change("A", 1, "0")));

        assert_eq!(tracker.value("A", "BinaryState").as_deref(), Some("1"));
        assert_eq!(tracker.get("A").unwrap().sequence, Some(2));
    }

    #[test]
    fn test_availability() {
        let tracker = DeviceStateTracker::new();
        assert!(!tracker.is_available("A"));

        tracker.record_success("A");
        assert!(tracker.is_available("A"));

        tracker.record_failure("A", "timed out");
        tracker.record_failure("A", "timed out");
        assert!(!tracker.is_available("A"));

        // A push event means the device is back
        tracker.apply(&change("A", 1, "0"));
        assert!(tracker.is_available("A"));
    }

    #[tokio::test]
    async fn test_spawned_tracker_follows_bus() {
        let bus = EventBus::new();
        let tracker = Arc::new(DeviceStateTracker::new());
        let handle = Arc::clone(&tracker).spawn(bus.subscribe_all());

        bus.on_state_change("A", EventPayload::new(1, "BinaryState", "1"));
        bus.on_state_change("A", EventPayload::new(2, "BinaryState", "0"));

        tokio::time::timeout(Duration::from_secs(1), async {
            while tracker.get("A").and_then(|s| s.sequence) != Some(2) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(tracker.value("A", "BinaryState").as_deref(), Some("0"));

        drop(bus);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
