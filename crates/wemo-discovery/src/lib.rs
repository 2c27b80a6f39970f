//! WeMo endpoint resolution
//!
//! Turns a [`DeviceEndpoint`](wemo_core::DeviceEndpoint) into a
//! [`DeviceDescriptor`](wemo_core::DeviceDescriptor):
//!
//! 1. if the port is unknown, a [`PortProbe`] looks for the setup URL
//! 2. a [`DescriptionFetcher`] downloads and parses the device description
//! 3. the result is stored in the [`ResolutionCache`]
//!
//! The network side is behind the two traits so the resolver can be driven by
//! the HTTP implementations in [`http`] or by test doubles.

mod cache;
mod error;
pub mod http;
mod resolver;

pub use cache::ResolutionCache;
pub use error::{BoxError, FetchError, ResolveError};
pub use resolver::{setup_url_for_address, DescriptionFetcher, EndpointResolver, PortProbe};
