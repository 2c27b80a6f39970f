//! Entry lifecycle
//!
//! [`WemoIntegration`] owns the stores and collaborators and moves config
//! entries through their states:
//!
//! - `setup_entry` migrates, resolves the device, registers it and
//!   subscribes to its events
//! - a device that cannot be reached leaves the entry in `SetupRetry`;
//!   setup runs again after [`calculate_retry_delay`]
//! - `unload_entry` unsubscribes and returns the entry to `NotLoaded`
//! - an entry whose address a flow rewrote is reloaded so the device it
//!   holds points at the new address

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use wemo_config::WemoConfig;
use wemo_config_entries::{
    calculate_retry_delay, migrate, ConfigEntries, ConfigEntriesError, ConfigEntry,
    ConfigEntrySource, ConfigEntryState, MigrationOutcome, Reconciler,
};
use wemo_core::{DeviceDescriptor, DOMAIN};
use wemo_discovery::EndpointResolver;
use wemo_event_bus::{DeviceStateTracker, SubscriptionRegistry};
use wemo_registries::{DeviceIdentifier, DeviceRegistry};

use crate::error::{FlowError, SetupError, SetupResult};
use crate::flow::{FlowManager, FlowResult};

const DEFAULT_MANUFACTURER: &str = "Belkin International Inc.";

/// The WeMo integration
pub struct WemoIntegration {
    entries: Arc<ConfigEntries>,
    devices: Arc<DeviceRegistry>,
    resolver: Arc<EndpointResolver>,
    reconciler: Arc<Reconciler>,
    subscriptions: Arc<dyn SubscriptionRegistry>,
    tracker: Arc<DeviceStateTracker>,
    flows: FlowManager,
    /// entry_id -> device set up for it
    loaded: DashMap<String, Arc<DeviceDescriptor>>,
    /// entry_id -> pending retry timer
    retries: DashMap<String, JoinHandle<()>>,
    retry_tx: mpsc::UnboundedSender<String>,
    retry_worker: Mutex<Option<JoinHandle<()>>>,
    auto_retry: AtomicBool,
}

impl WemoIntegration {
    pub fn new(
        entries: Arc<ConfigEntries>,
        devices: Arc<DeviceRegistry>,
        resolver: Arc<EndpointResolver>,
        subscriptions: Arc<dyn SubscriptionRegistry>,
        tracker: Arc<DeviceStateTracker>,
    ) -> Arc<Self> {
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&entries)));
        let flows = FlowManager::new(
            Arc::clone(&resolver),
            Arc::clone(&reconciler),
            Arc::clone(&devices),
        );
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let integration = Arc::new(Self {
            entries,
            devices,
            resolver,
            reconciler,
            subscriptions,
            tracker,
            flows,
            loaded: DashMap::new(),
            retries: DashMap::new(),
            retry_tx,
            retry_worker: Mutex::new(None),
            auto_retry: AtomicBool::new(true),
        });

        let worker = Self::spawn_retry_worker(Arc::downgrade(&integration), retry_rx);
        if let Ok(mut slot) = integration.retry_worker.try_lock() {
            *slot = Some(worker);
        }
        integration
    }

    pub fn entries(&self) -> &Arc<ConfigEntries> {
        &self.entries
    }

    pub fn devices(&self) -> &Arc<DeviceRegistry> {
        &self.devices
    }

    pub fn resolver(&self) -> &Arc<EndpointResolver> {
        &self.resolver
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn flows(&self) -> &FlowManager {
        &self.flows
    }

    pub fn tracker(&self) -> &Arc<DeviceStateTracker> {
        &self.tracker
    }

    /// Whether entries in `SetupRetry` are set up again automatically
    pub fn set_auto_retry(&self, enabled: bool) {
        self.auto_retry.store(enabled, Ordering::SeqCst);
    }

    /// Device set up for an entry
    pub fn loaded_device(&self, entry_id: &str) -> Option<Arc<DeviceDescriptor>> {
        self.loaded.get(entry_id).map(|d| Arc::clone(d.value()))
    }

    pub fn has_pending_retry(&self, entry_id: &str) -> bool {
        self.retries.contains_key(entry_id)
    }

    /// Apply the `wemo:` section: start subscriptions and import static
    /// devices.
    ///
    /// Static devices that cannot be reached are logged and skipped.
    pub async fn async_setup(&self, config: &WemoConfig) -> SetupResult<()> {
        self.flows.set_discovery_enabled(config.discovery);
        self.subscriptions.start().await?;

        let imports = config.static_hosts.iter().map(|endpoint| {
            let data = serde_json::json!({
                "host": endpoint.host,
                "port": endpoint.port,
            });
            async move {
                match self.start_flow(ConfigEntrySource::Import, data).await {
                    Ok(FlowResult::Form { flow_id, errors, .. }) => {
                        error!("Unable to add static WeMo {}: {:?}", endpoint, errors);
                        self.flows.abort(&flow_id);
                    }
                    Ok(result) => {
                        debug!("Import of {} finished: {:?}", endpoint, result.reason());
                    }
                    Err(e) => error!("Unable to add static WeMo {}: {}", endpoint, e),
                }
            }
        });
        join_all(imports).await;
        Ok(())
    }

    /// Start a config flow, setting up the entry it creates
    pub async fn start_flow(
        &self,
        source: ConfigEntrySource,
        data: Value,
    ) -> Result<FlowResult, FlowError> {
        let result = self.flows.start(source, data).await?;
        self.setup_created(&result).await;
        self.reload_changed().await;
        Ok(result)
    }

    /// Continue a config flow, setting up the entry it creates
    pub async fn configure_flow(
        &self,
        flow_id: &str,
        input: Option<Value>,
    ) -> Result<FlowResult, FlowError> {
        let result = self.flows.configure(flow_id, input).await?;
        self.setup_created(&result).await;
        self.reload_changed().await;
        Ok(result)
    }

    async fn reload_changed(&self) {
        for entry_id in self.flows.take_changed_entries() {
            if let Err(e) = self.reload_entry(&entry_id).await {
                if e.is_not_ready() {
                    debug!("{}", e);
                } else {
                    error!("Error reloading entry {}: {}", entry_id, e);
                }
            }
        }
    }

    /// Set up an entry again with its current data.
    ///
    /// Only `Loaded` and `SetupRetry` entries are touched.
    pub async fn reload_entry(&self, entry_id: &str) -> SetupResult<()> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;
        match entry.state {
            ConfigEntryState::Loaded => {
                info!("Reloading {} after address change", entry.title);
                self.unload_entry(entry_id).await?;
                self.setup_entry(entry_id).await
            }
            ConfigEntryState::SetupRetry => {
                debug!("Retrying {} now at its new address", entry.title);
                self.cancel_retry(entry_id);
                self.setup_entry(entry_id).await
            }
            state => {
                debug!("Not reloading entry {} in state {:?}", entry_id, state);
                Ok(())
            }
        }
    }

    async fn setup_created(&self, result: &FlowResult) {
        let Some(entry_id) = result.entry_id() else {
            return;
        };
        if let Err(e) = self.setup_entry(entry_id).await {
            if e.is_not_ready() {
                debug!("{}", e);
            } else {
                error!("Error setting up entry {}: {}", entry_id, e);
            }
        }
    }

    /// Set up every stored entry that is not loaded yet
    pub async fn setup_all(&self) -> usize {
        let pending: Vec<String> = self
            .entries
            .get_by_domain(DOMAIN)
            .into_iter()
            .filter(|e| !e.is_ignored() && e.state == ConfigEntryState::NotLoaded)
            .map(|e| e.entry_id)
            .collect();

        let results = join_all(pending.iter().map(|id| self.setup_entry(id))).await;
        let mut loaded = 0;
        for (entry_id, result) in pending.iter().zip(results) {
            match result {
                Ok(()) => loaded += 1,
                Err(e) if e.is_not_ready() => debug!("{}", e),
                Err(e) => warn!("Entry {} not set up: {}", entry_id, e),
            }
        }
        info!("Set up {} of {} WeMo entries", loaded, pending.len());
        loaded
    }

    fn setup_lock(&self, entry_id: &str) -> SetupResult<Arc<Mutex<()>>> {
        self.entries
            .get(entry_id)
            .map(|e| Arc::clone(&e.setup_lock))
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()).into())
    }

    /// Set up a single entry
    pub async fn setup_entry(&self, entry_id: &str) -> SetupResult<()> {
        let lock = self.setup_lock(entry_id)?;
        let _guard = lock.lock().await;

        // Re-read under the lock, another setup may have finished meanwhile
        let Some(entry) = self.entries.get(entry_id) else {
            return Err(ConfigEntriesError::NotFound(entry_id.to_string()).into());
        };
        if entry.is_ignored() {
            debug!("Not setting up ignored entry {}", entry_id);
            return Ok(());
        }
        if entry.state == ConfigEntryState::Loaded {
            return Ok(());
        }
        self.cancel_retry(entry_id);

        let entry = self
            .entries
            .try_set_state(entry_id, ConfigEntryState::SetupInProgress, None)?;
        debug!("Setting up {} ({})", entry.title, entry_id);

        match self.setup_device(&entry).await {
            Ok(device) => {
                self.entries
                    .try_set_state(entry_id, ConfigEntryState::Loaded, None)?;
                info!("Set up {} ({})", device.name, device.serial_number);
                Ok(())
            }
            Err(e) => Err(self.setup_failed(&entry, e).await),
        }
    }

    async fn setup_device(&self, entry: &ConfigEntry) -> SetupResult<Arc<DeviceDescriptor>> {
        match migrate(entry, &self.devices)? {
            MigrationOutcome::Current => {}
            outcome => {
                return Err(SetupError::NotMigrated {
                    entry_id: entry.entry_id.clone(),
                    outcome,
                })
            }
        }

        let data = entry
            .wemo_data()
            .ok_or_else(|| SetupError::MissingHost(entry.entry_id.clone()))?;
        let endpoint = data.endpoint();

        let device = self
            .resolver
            .get_device(&endpoint, true)
            .await
            .map_err(|source| {
                if source.is_not_ready() {
                    SetupError::NotReady {
                        entry_id: entry.entry_id.clone(),
                        retry_in: calculate_retry_delay(entry.tries),
                        source,
                    }
                } else {
                    SetupError::Device {
                        entry_id: entry.entry_id.clone(),
                        source,
                    }
                }
            })?;

        let category = device.category();
        if data.category != Some(category) {
            self.reconciler
                .update_category(&entry.entry_id, category)
                .await?;
        }

        self.register_device(&entry.entry_id, &device).await?;
        self.subscriptions.register(Arc::clone(&device)).await?;
        self.tracker.record_success(&device.serial_number);
        self.loaded
            .insert(entry.entry_id.clone(), Arc::clone(&device));
        Ok(device)
    }

    async fn register_device(
        &self,
        entry_id: &str,
        device: &DeviceDescriptor,
    ) -> SetupResult<()> {
        let identifiers = [DeviceIdentifier::new(DOMAIN, &device.serial_number)];
        let registered =
            self.devices
                .get_or_create(&identifiers, Some(entry_id), Some(device.name.as_str()));
        self.devices.update(&registered.id, |d| {
            d.name = Some(device.name.clone());
            d.manufacturer = Some(
                device
                    .manufacturer
                    .clone()
                    .unwrap_or_else(|| DEFAULT_MANUFACTURER.to_string()),
            );
            d.model = Some(device.model_name.to_string());
            d.sw_version = device.firmware_version.clone();
            d.serial_number = Some(device.serial_number.clone());
            d.configuration_url = Some(device.setup_url.clone());
        });
        self.devices.save().await?;
        Ok(())
    }

    /// Record a failed setup on the entry and hand the error back
    async fn setup_failed(&self, entry: &ConfigEntry, err: SetupError) -> SetupError {
        let entry_id = entry.entry_id.as_str();
        let state_result = match err {
            SetupError::NotReady {
                ref source,
                retry_in,
                ..
            } => {
                self.entries.increment_tries(entry_id);
                warn!(
                    "Config entry '{}' for wemo integration not ready yet: {}; Retrying in background",
                    entry.title, source
                );
                self.tracker.record_failure(
                    entry.unique_id.as_deref().unwrap_or(entry_id),
                    &source.to_string(),
                );
                let result = self.entries.try_set_state(
                    entry_id,
                    ConfigEntryState::SetupRetry,
                    Some(source.to_string()),
                );
                if result.is_ok() && self.auto_retry.load(Ordering::SeqCst) {
                    self.schedule_retry(entry_id, retry_in);
                }
                result
            }
            SetupError::NotMigrated {
                outcome: MigrationOutcome::Superseded,
                ..
            } => {
                let result = self.entries.try_set_state(
                    entry_id,
                    ConfigEntryState::MigrationError,
                    Some("superseded".to_string()),
                );
                info!(
                    "Removing superseded version {} entry {}",
                    entry.version, entry.title
                );
                if let Err(e) = self.remove_entry_unlocked(entry_id).await {
                    error!("Failed to remove superseded entry {}: {}", entry_id, e);
                }
                result
            }
            SetupError::NotMigrated { .. } | SetupError::Migration(_) => self.entries.try_set_state(
                entry_id,
                ConfigEntryState::MigrationError,
                Some(err.to_string()),
            ),
            _ => {
                error!("Error setting up entry {}: {}", entry.title, err);
                self.entries.try_set_state(
                    entry_id,
                    ConfigEntryState::SetupError,
                    Some(err.to_string()),
                )
            }
        };
        if let Err(e) = state_result {
            debug!("Entry {} state not updated: {}", entry_id, e);
        }
        err
    }

    fn schedule_retry(&self, entry_id: &str, delay: Duration) {
        debug!("Retrying setup of {} in {:?}", entry_id, delay);
        let tx = self.retry_tx.clone();
        let id = entry_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        });
        if let Some(previous) = self.retries.insert(entry_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn cancel_retry(&self, entry_id: &str) {
        if let Some((_, handle)) = self.retries.remove(entry_id) {
            handle.abort();
        }
    }

    fn spawn_retry_worker(
        integration: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(entry_id) = rx.recv().await {
                let Some(integration) = integration.upgrade() else {
                    break;
                };
                integration.retries.remove(&entry_id);
                let still_waiting = integration
                    .entries
                    .get(&entry_id)
                    .is_some_and(|e| e.state == ConfigEntryState::SetupRetry);
                if !still_waiting {
                    continue;
                }
                if let Err(e) = integration.setup_entry(&entry_id).await {
                    debug!("Retry of {} failed: {}", entry_id, e);
                }
            }
        })
    }

    /// Unload a set up entry
    pub async fn unload_entry(&self, entry_id: &str) -> SetupResult<()> {
        let lock = self.setup_lock(entry_id)?;
        let _guard = lock.lock().await;
        self.unload_entry_unlocked(entry_id).await
    }

    async fn unload_entry_unlocked(&self, entry_id: &str) -> SetupResult<()> {
        self.cancel_retry(entry_id);
        let Some(entry) = self.entries.get(entry_id) else {
            return Ok(());
        };
        if entry.state == ConfigEntryState::NotLoaded || !entry.supports_unload() {
            debug!("Entry {} is {:?}, nothing to unload", entry_id, entry.state);
            return Ok(());
        }

        self.entries
            .try_set_state(entry_id, ConfigEntryState::UnloadInProgress, None)?;
        if let Some((_, device)) = self.loaded.remove(entry_id) {
            if let Err(e) = self.subscriptions.unregister(&device.serial_number).await {
                error!("Error unloading entry {}: {}", entry.title, e);
                self.entries.try_set_state(
                    entry_id,
                    ConfigEntryState::FailedUnload,
                    Some(e.to_string()),
                )?;
                return Err(e.into());
            }
            self.tracker.remove(&device.serial_number);
        }
        self.entries
            .try_set_state(entry_id, ConfigEntryState::NotLoaded, None)?;
        debug!("Unloaded {}", entry.title);
        Ok(())
    }

    /// Unload and delete an entry along with its devices
    pub async fn remove_entry(&self, entry_id: &str) -> SetupResult<ConfigEntry> {
        let lock = self.setup_lock(entry_id)?;
        let _guard = lock.lock().await;
        self.unload_entry_unlocked(entry_id).await?;
        self.remove_entry_unlocked(entry_id).await
    }

    async fn remove_entry_unlocked(&self, entry_id: &str) -> SetupResult<ConfigEntry> {
        let entry = self.entries.remove(entry_id).await?;
        self.devices.clear_config_entry(entry_id);
        self.devices.save().await?;
        Ok(entry)
    }

    /// Stop retries and subscriptions
    pub async fn shutdown(&self) {
        for retry in self.retries.iter() {
            retry.value().abort();
        }
        self.retries.clear();
        if let Some(worker) = self.retry_worker.lock().await.take() {
            worker.abort();
        }
        self.subscriptions.stop().await;
        info!("WeMo integration stopped");
    }
}
