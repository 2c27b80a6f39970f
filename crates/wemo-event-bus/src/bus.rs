use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::event::{EventPayload, StateChange};

/// Default channel capacity for event subscriptions
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// What happened to an event handed to [`EventBus::on_state_change`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Same sequence number as the last accepted event
    Duplicate,
    /// Older than the last accepted event
    OutOfOrder,
}

/// Fans device state changes out to subscribers
///
/// Publishing never waits on subscribers: a subscriber that falls more than
/// the channel capacity behind loses the oldest events.
pub struct EventBus {
    /// Per-device broadcast senders
    devices: DashMap<String, broadcast::Sender<StateChange>>,
    /// Sender for subscribers of every device
    all_sender: broadcast::Sender<StateChange>,
    /// Last accepted sequence number per device
    last_sequence: DashMap<String, u64>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (all_sender, _) = broadcast::channel(capacity);
        Self {
            devices: DashMap::new(),
            all_sender,
            last_sequence: DashMap::new(),
            capacity,
        }
    }

    /// Subscribe to changes of one device
    pub fn subscribe(&self, device_id: &str) -> broadcast::Receiver<StateChange> {
        trace!(device_id, "Subscribing to device");
        self.devices
            .entry(device_id.to_string())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(self.capacity);
                tx
            })
            .subscribe()
    }

    /// Subscribe to changes of every device
    pub fn subscribe_all(&self) -> broadcast::Receiver<StateChange> {
        self.all_sender.subscribe()
    }

    /// Entry point for the subscription service.
    ///
    /// Events are accepted only if their sequence number is newer than the
    /// last accepted one for the device. The device's sequence slot stays
    /// locked until the event is sent, so subscribers see accepted events in
    /// sequence order even with concurrent publishers.
    pub fn on_state_change(&self, device_id: &str, payload: EventPayload) -> Delivery {
        match self.last_sequence.entry(device_id.to_string()) {
            Entry::Occupied(mut last) => {
                let last_seq = *last.get();
                if payload.sequence <= last_seq {
                    let delivery = if payload.sequence == last_seq {
                        Delivery::Duplicate
                    } else {
                        Delivery::OutOfOrder
                    };
                    debug!(
                        device_id,
                        sequence = payload.sequence,
                        ?delivery,
                        "Dropping state change"
                    );
                    return delivery;
                }
                last.insert(payload.sequence);
                self.deliver(device_id, payload);
            }
            Entry::Vacant(slot) => {
                let _last = slot.insert(payload.sequence);
                self.deliver(device_id, payload);
            }
        }
        Delivery::Delivered
    }

    fn deliver(&self, device_id: &str, payload: EventPayload) {
        let change = StateChange {
            device_id: device_id.to_string(),
            payload,
            received_at: Utc::now(),
        };
        trace!(device_id, property = %change.payload.property, "Delivering state change");

        if let Some(sender) = self.devices.get(device_id) {
            // Send errors only mean nobody is listening
            let _ = sender.send(change.clone());
        }
        let _ = self.all_sender.send(change);
    }

    /// Forget the sequence number of a device, e.g. after it rebooted
    pub fn reset(&self, device_id: &str) {
        self.last_sequence.remove(device_id);
    }

    /// Number of devices with a dedicated channel
    pub fn listener_count(&self) -> usize {
        self.devices.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for EventBus
pub type SharedEventBus = Arc<EventBus>;
