//! Endpoint resolver

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};
use wemo_core::{DeviceDescriptor, DeviceEndpoint};

use crate::cache::ResolutionCache;
use crate::error::{FetchError, ResolveError};

/// Downloads and parses a device description
#[async_trait]
pub trait DescriptionFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<DeviceDescriptor, FetchError>;
}

/// Finds the setup URL of a device whose port is unknown
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Returns `None` when no port answered
    async fn probe(&self, host: &str) -> Option<String>;
}

/// Setup URL of a device at a known address
pub fn setup_url_for_address(host: &str, port: u16) -> String {
    format!("http://{}:{}/setup.xml", host, port)
}

/// Resolves endpoints to devices, caching the results
///
/// No retries happen here: failures are returned immediately and the caller
/// decides whether to try again later.
pub struct EndpointResolver {
    fetcher: Arc<dyn DescriptionFetcher>,
    probe: Arc<dyn PortProbe>,
    cache: Arc<ResolutionCache>,
}

impl EndpointResolver {
    pub fn new(
        fetcher: Arc<dyn DescriptionFetcher>,
        probe: Arc<dyn PortProbe>,
        cache: Arc<ResolutionCache>,
    ) -> Self {
        Self {
            fetcher,
            probe,
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    /// Resolve an endpoint over the network and cache the result
    pub async fn resolve(
        &self,
        endpoint: &DeviceEndpoint,
    ) -> Result<Arc<DeviceDescriptor>, ResolveError> {
        let url = if endpoint.needs_port() {
            self.probe.probe(&endpoint.host).await.ok_or_else(|| {
                ResolveError::PortUndetermined {
                    endpoint: endpoint.to_string(),
                }
            })?
        } else {
            setup_url_for_address(&endpoint.host, endpoint.port)
        };

        debug!("Fetching WeMo description from {}", url);
        let mut device = self.fetcher.fetch(&url).await.map_err(|source| {
            warn!("Failed to fetch description from {}: {}", url, source);
            if source.is_transport() {
                ResolveError::Connection {
                    url: url.clone(),
                    source,
                }
            } else {
                ResolveError::Description {
                    url: url.clone(),
                    source,
                }
            }
        })?;

        if device.host.is_empty() {
            device.host = endpoint.host.clone();
        }
        if device.port == 0 {
            device.port = url::Url::parse(&url)
                .ok()
                .and_then(|u| u.port())
                .unwrap_or(endpoint.port);
        }
        device.setup_url = url;

        let device = Arc::new(device);
        self.cache.insert(endpoint.cache_key(), Arc::clone(&device));
        debug!(
            "Resolved {} to {} ({}, {})",
            endpoint, device.name, device.model_name, device.serial_number
        );
        Ok(device)
    }

    /// Get a device from the cache or resolve it.
    ///
    /// With `take`, the device is handed over to the caller and not left in
    /// the cache. Concurrent calls for the same endpoint are serialized so
    /// only one of them touches the network.
    pub async fn get_device(
        &self,
        endpoint: &DeviceEndpoint,
        take: bool,
    ) -> Result<Arc<DeviceDescriptor>, ResolveError> {
        let key = endpoint.cache_key();
        let lock = self.cache.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.get_device_locked(endpoint, &key, take).await
        };
        drop(lock);
        self.cache.release_key_lock(&key);
        result
    }

    async fn get_device_locked(
        &self,
        endpoint: &DeviceEndpoint,
        key: &str,
        take: bool,
    ) -> Result<Arc<DeviceDescriptor>, ResolveError> {
        let cached = if take {
            self.cache.take(key)
        } else {
            self.cache.get(key)
        };
        if let Some(device) = cached {
            debug!("Using cached device for {}", key);
            return Ok(device);
        }

        let device = self.resolve(endpoint).await?;
        if take {
            self.cache.take(key);
        }
        Ok(device)
    }
}
