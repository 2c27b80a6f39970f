//! Push-event delivery for WeMo devices
//!
//! The subscription service calls [`EventBus::on_state_change`] whenever a
//! device reports a change. The bus drops duplicate and out-of-order events
//! and fans the rest out to subscribers without blocking the caller.
//! [`DeviceStateTracker`] is one such subscriber, keeping the latest state
//! and availability of each device.

mod bus;
mod event;
mod state;
mod subscription;

pub use bus::{Delivery, EventBus, SharedEventBus};
pub use event::{EventPayload, StateChange};
pub use state::{DeviceState, DeviceStateTracker};
pub use subscription::{LocalSubscriptionRegistry, SubscriptionError, SubscriptionRegistry};
