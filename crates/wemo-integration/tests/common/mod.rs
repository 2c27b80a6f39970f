//! Test harness for the WeMo integration
//!
//! Devices live in a [`MockFetcher`] keyed by setup URL, so tests can move
//! them between addresses or take them offline.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wemo_config_entries::{ConfigEntries, ConfigEntry, ConfigEntryState};
use wemo_core::{DeviceDescriptor, DeviceEndpoint};
use wemo_discovery::{
    setup_url_for_address, DescriptionFetcher, EndpointResolver, FetchError, PortProbe,
    ResolutionCache,
};
use wemo_event_bus::{
    DeviceStateTracker, EventBus, LocalSubscriptionRegistry, SubscriptionError,
    SubscriptionRegistry,
};
use wemo_integration::WemoIntegration;
use wemo_registries::{DeviceRegistry, Storage};

pub const HOST: &str = "127.0.0.1";
pub const PORT: u16 = 50000;
pub const SERIAL: &str = "WemoSerialNumber";
pub const NAME: &str = "WemoDeviceName";

#[derive(Debug, Clone)]
enum Reply {
    Device {
        name: String,
        serial: String,
        model: String,
    },
    Invalid,
}

/// Description fetcher answering from an in-memory table
#[derive(Default)]
pub struct MockFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    /// Connection failures to report before answering normally
    failures: Mutex<HashMap<String, u32>>,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn add_device(&self, host: &str, port: u16, name: &str, serial: &str, model: &str) {
        self.replies.lock().unwrap().insert(
            setup_url_for_address(host, port),
            Reply::Device {
                name: name.to_string(),
                serial: serial.to_string(),
                model: model.to_string(),
            },
        );
    }

    /// Socket `WemoSerialNumber` at `host:port`
    pub fn add_socket(&self, host: &str, port: u16) {
        self.add_device(host, port, NAME, SERIAL, "Socket");
    }

    pub fn add_invalid(&self, host: &str, port: u16) {
        self.replies
            .lock()
            .unwrap()
            .insert(setup_url_for_address(host, port), Reply::Invalid);
    }

    pub fn remove(&self, host: &str, port: u16) {
        self.replies
            .lock()
            .unwrap()
            .remove(&setup_url_for_address(host, port));
    }

    pub fn fail_times(&self, host: &str, port: u16, times: u32) {
        self.failures
            .lock()
            .unwrap()
            .insert(setup_url_for_address(host, port), times);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DescriptionFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> Result<DeviceDescriptor, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(FetchError::Connect("connection refused".into()));
                }
            }
        }

        let reply = self.replies.lock().unwrap().get(url).cloned();
        match reply {
            Some(Reply::Device {
                name,
                serial,
                model,
            }) => Ok(DeviceDescriptor::new(name, serial, model.as_str(), url)),
            Some(Reply::Invalid) => Err(FetchError::InvalidDescription(
                "missing <device> element".to_string(),
            )),
            None => Err(FetchError::Connect("connection refused".into())),
        }
    }
}

/// Port probe answering from an in-memory table
#[derive(Default)]
pub struct MockProbe {
    ports: Mutex<HashMap<String, u16>>,
}

impl MockProbe {
    pub fn set_port(&self, host: &str, port: u16) {
        self.ports.lock().unwrap().insert(host.to_string(), port);
    }
}

#[async_trait]
impl PortProbe for MockProbe {
    async fn probe(&self, host: &str) -> Option<String> {
        let port = self.ports.lock().unwrap().get(host).copied()?;
        Some(setup_url_for_address(host, port))
    }
}

/// Local registry that can be told to fail unregistering
pub struct MockSubscriptions {
    inner: LocalSubscriptionRegistry,
    fail_unregister: AtomicBool,
}

impl MockSubscriptions {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            inner: LocalSubscriptionRegistry::new(bus),
            fail_unregister: AtomicBool::new(false),
        }
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        self.inner.is_registered(device_id)
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn set_fail_unregister(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SubscriptionRegistry for MockSubscriptions {
    async fn start(&self) -> Result<(), SubscriptionError> {
        self.inner.start().await
    }

    async fn stop(&self) {
        self.inner.stop().await
    }

    async fn register(&self, device: Arc<DeviceDescriptor>) -> Result<(), SubscriptionError> {
        self.inner.register(device).await
    }

    async fn unregister(&self, device_id: &str) -> Result<(), SubscriptionError> {
        if self.fail_unregister.load(Ordering::SeqCst) {
            return Err(SubscriptionError::Failed("unsubscribe timed out".to_string()));
        }
        self.inner.unregister(device_id).await
    }
}

/// An integration wired to mocks and a temporary config dir
pub struct TestWemo {
    pub dir: TempDir,
    pub fetcher: Arc<MockFetcher>,
    pub probe: Arc<MockProbe>,
    pub bus: Arc<EventBus>,
    pub subscriptions: Arc<MockSubscriptions>,
    pub integration: Arc<WemoIntegration>,
}

impl TestWemo {
    /// Must be called from within a tokio runtime
    pub fn new() -> Self {
        Self::with_dir(TempDir::new().unwrap())
    }

    pub fn with_dir(dir: TempDir) -> Self {
        let fetcher = Arc::new(MockFetcher::default());
        let probe = Arc::new(MockProbe::default());
        let bus = Arc::new(EventBus::new());
        let subscriptions = Arc::new(MockSubscriptions::new(Arc::clone(&bus)));
        let integration = build(dir.path(), &fetcher, &probe, &subscriptions);
        Self {
            dir,
            fetcher,
            probe,
            bus,
            subscriptions,
            integration,
        }
    }

    /// A second integration over the same storage, as after a restart
    pub async fn restart(&self) -> Arc<WemoIntegration> {
        let integration = build(
            self.dir.path(),
            &self.fetcher,
            &self.probe,
            &self.subscriptions,
        );
        integration.entries().load().await.unwrap();
        integration.devices().load().await.unwrap();
        integration
    }

    pub async fn start_subscriptions(&self) {
        self.subscriptions.start().await.unwrap();
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        self.integration.entries()
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        self.integration.devices()
    }

    pub fn wemo_entries(&self) -> Vec<ConfigEntry> {
        self.entries().get_by_domain(wemo_core::DOMAIN)
    }

    pub fn entry(&self, entry_id: &str) -> ConfigEntry {
        self.entries().get(entry_id).unwrap()
    }

    pub fn entry_for(&self, serial: &str) -> Option<ConfigEntry> {
        self.entries().get_by_unique_id(wemo_core::DOMAIN, serial)
    }

    pub fn assert_state(&self, entry_id: &str, expected: ConfigEntryState) {
        let state = self.entry(entry_id).state;
        assert_eq!(
            state, expected,
            "Expected entry {} to be {:?}, but was {:?}",
            entry_id, expected, state
        );
    }

    pub fn stored_endpoint(&self, entry_id: &str) -> DeviceEndpoint {
        self.entry(entry_id).wemo_data().unwrap().endpoint()
    }

    /// Wait until the entry reaches `state`, time permitting
    pub async fn wait_for_state(&self, entry_id: &str, state: ConfigEntryState) {
        tokio::time::timeout(Duration::from_secs(600), async {
            while self.entry(entry_id).state != state {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("entry {} never reached {:?}", entry_id, state));
    }
}

fn build(
    dir: &Path,
    fetcher: &Arc<MockFetcher>,
    probe: &Arc<MockProbe>,
    subscriptions: &Arc<MockSubscriptions>,
) -> Arc<WemoIntegration> {
    let storage = Arc::new(Storage::new(dir));
    let resolver = EndpointResolver::new(
        Arc::clone(fetcher) as Arc<dyn DescriptionFetcher>,
        Arc::clone(probe) as Arc<dyn PortProbe>,
        Arc::new(ResolutionCache::new()),
    );
    WemoIntegration::new(
        Arc::new(ConfigEntries::new(Arc::clone(&storage))),
        Arc::new(DeviceRegistry::new(storage)),
        Arc::new(resolver),
        Arc::clone(subscriptions) as Arc<dyn SubscriptionRegistry>,
        Arc::new(DeviceStateTracker::new()),
    )
}

pub fn endpoint(host: &str, port: u16) -> DeviceEndpoint {
    DeviceEndpoint::new(host, port).unwrap()
}
