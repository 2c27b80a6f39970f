use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Payload of a push notification as handed over by the subscription service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Per-device sequence number, increasing with every notification
    pub sequence: u64,
    /// Property that changed, e.g. `BinaryState`
    pub property: String,
    pub value: String,
}

impl EventPayload {
    pub fn new(sequence: u64, property: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            sequence,
            property: property.into(),
            value: value.into(),
        }
    }
}

/// An accepted state change, as seen by subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    /// Serial number of the device
    pub device_id: String,
    #[serde(flatten)]
    pub payload: EventPayload,
    pub received_at: DateTime<Utc>,
}
