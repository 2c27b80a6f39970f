//! Resolution errors

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a [`DescriptionFetcher`](crate::DescriptionFetcher)
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connection refused, reset or otherwise not established
    #[error("connection failed: {0}")]
    Connect(#[source] BoxError),

    #[error("request timed out")]
    Timeout,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// Description downloaded but unusable
    #[error("invalid device description: {0}")]
    InvalidDescription(String),
}

impl FetchError {
    /// Transport-level failure: the device may simply be offline
    pub fn is_transport(&self) -> bool {
        matches!(self, FetchError::Connect(_) | FetchError::Timeout)
    }
}

/// Failure to resolve an endpoint to a device
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No port was given and probing found no setup URL
    #[error("Unable to get description url for WeMo at: {endpoint}")]
    PortUndetermined { endpoint: String },

    /// The description could not be fetched (offline, refused, timed out)
    #[error("Unable to access WeMo at {url} ({source})")]
    Connection {
        url: String,
        #[source]
        source: FetchError,
    },

    /// The device answered but its description was unusable
    #[error("Bad description from WeMo at {url} ({source})")]
    Description {
        url: String,
        #[source]
        source: FetchError,
    },
}

impl ResolveError {
    /// Whether the caller should retry later rather than give up
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            ResolveError::PortUndetermined { .. } | ResolveError::Connection { .. }
        )
    }
}
