//! WeMo integration
//!
//! Ties the resolver, the config entry store and the event bus together:
//!
//! - [`FlowManager`] runs the config flows (user, import, SSDP, ignore)
//! - [`WemoIntegration`] sets entries up and tears them down
//!
//! ```text
//! wemo: section ─→ import flows ─┐
//! SSDP ─────────→ ssdp flows ────┼─→ Reconciler ─→ ConfigEntries
//! user ─────────→ user flows ────┘                      │
//!                                          setup_entry ←┘
//!                                 resolve → device registry → subscribe
//! ```

mod error;
pub mod flow;
mod setup;

pub use error::{FlowError, SetupError, SetupResult};
pub use flow::{FlowManager, FlowResult, FormField, SsdpDiscovery, UserInput};
pub use setup::WemoIntegration;
