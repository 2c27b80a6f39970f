//! Config flow
//!
//! A flow turns user input, a static config line or an SSDP discovery into
//! a config entry. Flows that need more input stop at a form and are resumed
//! with [`FlowManager::configure`].
//!
//! ```text
//! ssdp ──→ confirm ──→ user ──→ create_entry
//!   │         │          ↑ │
//!   │         └──────────┘ └──→ form (cannot_connect / cannot_determine_port)
//!   └──→ abort (already_configured / already_in_progress)
//! import ─→ user
//! unignore ─→ ssdp | abort (no_devices_found)
//! ignore ──→ create_entry (source ignore)
//! ```

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use wemo_config_entries::{
    ConfigEntriesError, ConfigEntry, ConfigEntrySource, ReconcileOutcome, Reconciler,
};
use wemo_core::conf::{CONF_HOST, CONF_PORT};
use wemo_core::{DeviceEndpoint, DOMAIN};
use wemo_discovery::{EndpointResolver, ResolveError};
use wemo_registries::DeviceRegistry;

use crate::error::FlowError;

pub const ERROR_CANNOT_CONNECT: &str = "cannot_connect";
pub const ERROR_CANNOT_DETERMINE_PORT: &str = "cannot_determine_port";

pub const REASON_ALREADY_CONFIGURED: &str = "already_configured";
pub const REASON_ALREADY_IN_PROGRESS: &str = "already_in_progress";
pub const REASON_NO_DEVICES_FOUND: &str = "no_devices_found";
pub const REASON_DISCOVERY_DISABLED: &str = "discovery_disabled";

pub const STEP_ID_USER: &str = "user";
pub const STEP_ID_CONFIRM: &str = "confirm";

/// Form field schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Result of a flow step
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    /// More input is needed
    Form {
        flow_id: String,
        step_id: String,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
        description_placeholders: HashMap<String, String>,
    },
    CreateEntry {
        flow_id: String,
        entry_id: String,
        title: String,
        version: u32,
        data: HashMap<String, Value>,
    },
    Abort {
        flow_id: String,
        reason: String,
    },
}

impl FlowResult {
    pub fn flow_id(&self) -> &str {
        match self {
            FlowResult::Form { flow_id, .. }
            | FlowResult::CreateEntry { flow_id, .. }
            | FlowResult::Abort { flow_id, .. } => flow_id,
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            FlowResult::Form { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// The `base` error of a form
    pub fn error(&self) -> Option<&str> {
        match self {
            FlowResult::Form { errors, .. } => errors.get("base").map(String::as_str),
            _ => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            FlowResult::Abort { reason, .. } => Some(reason),
            _ => None,
        }
    }

    pub fn entry_id(&self) -> Option<&str> {
        match self {
            FlowResult::CreateEntry { entry_id, .. } => Some(entry_id),
            _ => None,
        }
    }

    pub fn is_form(&self) -> bool {
        matches!(self, FlowResult::Form { .. })
    }
}

/// Input of the `user` and `import` steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInput {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl UserInput {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: Some(host.into()),
            port,
        }
    }

    fn from_value(data: Value) -> Result<Option<Self>, FlowError> {
        match data {
            Value::Null => Ok(None),
            Value::Object(ref map) if map.is_empty() => Ok(None),
            data => Ok(Some(serde_json::from_value(data)?)),
        }
    }
}

impl From<&DeviceEndpoint> for UserInput {
    fn from(endpoint: &DeviceEndpoint) -> Self {
        Self::new(endpoint.host.clone(), Some(endpoint.port))
    }
}

/// SSDP discovery info for a WeMo device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsdpDiscovery {
    pub ssdp_location: String,
    /// UPnP serial number
    pub serial: String,
    pub friendly_name: String,
}

impl SsdpDiscovery {
    /// Address taken from the location URL
    pub fn endpoint(&self) -> Result<DeviceEndpoint, FlowError> {
        let invalid = |reason: &str| FlowError::InvalidLocation {
            location: self.ssdp_location.clone(),
            reason: reason.to_string(),
        };
        let url = url::Url::parse(&self.ssdp_location).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("no host"))?;
        let port = url.port().unwrap_or(0);
        Ok(DeviceEndpoint::new(host, port)?)
    }
}

#[derive(Debug, Deserialize)]
struct IgnoreInput {
    unique_id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UnignoreInput {
    unique_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    User,
    Confirm,
}

struct WemoFlow {
    flow_id: String,
    source: ConfigEntrySource,
    step: Step,
    unique_id: Option<String>,
    /// Address from discovery, replayed into the user step
    discovered: Option<UserInput>,
    title_placeholders: HashMap<String, String>,
    /// Set once the port could not be found automatically
    port_required: bool,
}

impl WemoFlow {
    fn new(flow_id: &str, source: ConfigEntrySource) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            source,
            step: Step::User,
            unique_id: None,
            discovered: None,
            title_placeholders: HashMap::new(),
            port_required: false,
        }
    }

    fn abort(&self, reason: &str) -> FlowResult {
        FlowResult::Abort {
            flow_id: self.flow_id.clone(),
            reason: reason.to_string(),
        }
    }

    fn create_entry(&self, entry: &ConfigEntry) -> FlowResult {
        FlowResult::CreateEntry {
            flow_id: self.flow_id.clone(),
            entry_id: entry.entry_id.clone(),
            title: entry.title.clone(),
            version: entry.version,
            data: entry.data.clone(),
        }
    }

    fn user_form(&mut self, input: Option<&UserInput>, error: Option<&str>) -> FlowResult {
        self.step = Step::User;
        let input = input.cloned().unwrap_or_default();
        let data_schema = vec![
            FormField {
                name: CONF_HOST.to_string(),
                field_type: "string".to_string(),
                required: true,
                default: input.host.map(Value::from),
            },
            FormField {
                name: CONF_PORT.to_string(),
                field_type: "integer".to_string(),
                required: self.port_required,
                default: input.port.map(Value::from),
            },
        ];
        let errors = error
            .map(|e| HashMap::from([("base".to_string(), e.to_string())]))
            .unwrap_or_default();
        FlowResult::Form {
            flow_id: self.flow_id.clone(),
            step_id: STEP_ID_USER.to_string(),
            data_schema,
            errors,
            description_placeholders: HashMap::new(),
        }
    }

    fn confirm_form(&mut self) -> FlowResult {
        self.step = Step::Confirm;
        FlowResult::Form {
            flow_id: self.flow_id.clone(),
            step_id: STEP_ID_CONFIRM.to_string(),
            data_schema: Vec::new(),
            errors: HashMap::new(),
            description_placeholders: self.title_placeholders.clone(),
        }
    }
}

/// Runs config flows for the `wemo` domain
pub struct FlowManager {
    resolver: Arc<EndpointResolver>,
    reconciler: Arc<Reconciler>,
    devices: Arc<DeviceRegistry>,
    flows: DashMap<String, Arc<Mutex<WemoFlow>>>,
    /// unique_id -> flow currently owning it
    in_progress: DashMap<String, String>,
    /// Last SSDP discovery per serial, kept for unignore
    discovery_info: DashMap<String, SsdpDiscovery>,
    /// Existing entries whose stored data a flow rewrote
    changed: DashSet<String>,
    discovery_enabled: AtomicBool,
}

impl FlowManager {
    pub fn new(
        resolver: Arc<EndpointResolver>,
        reconciler: Arc<Reconciler>,
        devices: Arc<DeviceRegistry>,
    ) -> Self {
        Self {
            resolver,
            reconciler,
            devices,
            flows: DashMap::new(),
            in_progress: DashMap::new(),
            discovery_info: DashMap::new(),
            changed: DashSet::new(),
            discovery_enabled: AtomicBool::new(true),
        }
    }

    /// Whether SSDP discoveries may start flows
    pub fn set_discovery_enabled(&self, enabled: bool) {
        self.discovery_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Number of flows waiting for input
    pub fn in_progress_count(&self) -> usize {
        self.flows.len()
    }

    /// Entries rewritten by flows since the last call.
    ///
    /// A loaded entry still holds a device at its old address until it is
    /// reloaded.
    pub fn take_changed_entries(&self) -> Vec<String> {
        let ids: Vec<String> = self.changed.iter().map(|id| id.key().clone()).collect();
        for id in &ids {
            self.changed.remove(id);
        }
        ids
    }

    /// Drop a flow waiting for input
    pub fn abort(&self, flow_id: &str) -> bool {
        let Some((_, flow)) = self.flows.remove(flow_id) else {
            return false;
        };
        self.in_progress.retain(|_, owner| owner != flow_id);
        drop(flow);
        debug!("Aborted flow {}", flow_id);
        true
    }

    /// Start a flow from `source` with its initial data
    pub async fn start(
        &self,
        source: ConfigEntrySource,
        data: Value,
    ) -> Result<FlowResult, FlowError> {
        let flow_id = ulid::Ulid::new().to_string();
        let flow = Arc::new(Mutex::new(WemoFlow::new(&flow_id, source)));
        self.flows.insert(flow_id.clone(), Arc::clone(&flow));
        debug!("Starting {} flow {}", source.as_str(), flow_id);

        let mut flow = flow.lock().await;
        let result = self.run_start(&mut flow, source, data).await;
        self.after_step(&flow, result, false)
    }

    /// Continue a flow stopped at a form
    pub async fn configure(
        &self,
        flow_id: &str,
        input: Option<Value>,
    ) -> Result<FlowResult, FlowError> {
        let flow = self
            .flows
            .get(flow_id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;
        let mut flow = flow.lock().await;
        if !self.flows.contains_key(flow_id) {
            // Finished or aborted while we waited for the lock
            return Err(FlowError::UnknownFlow(flow_id.to_string()));
        }

        let result = match flow.step {
            Step::User => {
                let input = match input {
                    Some(data) => UserInput::from_value(data)?,
                    None => None,
                };
                self.step_user(&mut flow, input).await
            }
            Step::Confirm => self.step_confirm(&mut flow, input.is_some()).await,
        };
        self.after_step(&flow, result, true)
    }

    async fn run_start(
        &self,
        flow: &mut WemoFlow,
        source: ConfigEntrySource,
        data: Value,
    ) -> Result<FlowResult, FlowError> {
        match source {
            ConfigEntrySource::User => {
                let input = UserInput::from_value(data)?;
                self.step_user(flow, input).await
            }
            ConfigEntrySource::Import => {
                let input = UserInput::from_value(data)?
                    .ok_or(FlowError::MissingRequiredField(CONF_HOST))?;
                self.step_user(flow, Some(input)).await
            }
            ConfigEntrySource::Ssdp => {
                if !self.discovery_enabled.load(Ordering::SeqCst) {
                    debug!("Discovery disabled, ignoring SSDP flow");
                    return Ok(flow.abort(REASON_DISCOVERY_DISABLED));
                }
                let discovery: SsdpDiscovery = serde_json::from_value(data)?;
                self.step_ssdp(flow, discovery).await
            }
            ConfigEntrySource::Ignore => {
                let input: IgnoreInput = serde_json::from_value(data)?;
                self.step_ignore(flow, input).await
            }
            ConfigEntrySource::Unignore => {
                let input: UnignoreInput = serde_json::from_value(data)?;
                self.step_unignore(flow, input).await
            }
        }
    }

    /// Drop finished flows and the unique ids they hold
    fn after_step(
        &self,
        flow: &WemoFlow,
        result: Result<FlowResult, FlowError>,
        keep_on_error: bool,
    ) -> Result<FlowResult, FlowError> {
        let finished = match &result {
            Ok(FlowResult::Form { .. }) => false,
            Ok(_) => true,
            Err(_) => !keep_on_error,
        };
        if !finished {
            return result;
        }

        self.flows.remove(&flow.flow_id);
        if let Some(ref unique_id) = flow.unique_id {
            if matches!(result, Ok(FlowResult::CreateEntry { .. })) {
                // The entry exists now, other flows for the device are moot
                if let Some((_, other)) = self.in_progress.remove(unique_id) {
                    if other != flow.flow_id && self.flows.remove(&other).is_some() {
                        debug!("Aborted flow {} for configured {}", other, unique_id);
                    }
                }
            } else {
                self.in_progress
                    .remove_if(unique_id, |_, owner| owner == &flow.flow_id);
            }
        }
        result
    }

    /// Claim `unique_id` for the flow.
    ///
    /// Returns an abort if another flow holds it and `raise_on_progress` is set.
    fn set_unique_id(
        &self,
        flow: &mut WemoFlow,
        unique_id: &str,
        raise_on_progress: bool,
    ) -> Option<FlowResult> {
        flow.unique_id = Some(unique_id.to_string());
        match self.in_progress.entry(unique_id.to_string()) {
            Entry::Occupied(owner) if owner.get() != &flow.flow_id => {
                if raise_on_progress {
                    debug!("Flow for {} already in progress", unique_id);
                    return Some(flow.abort(REASON_ALREADY_IN_PROGRESS));
                }
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(flow.flow_id.clone());
            }
        }
        None
    }

    /// Abort if an entry exists for the flow's unique id, moving it to
    /// `address` first
    async fn abort_if_configured(
        &self,
        flow: &WemoFlow,
        address: Option<&DeviceEndpoint>,
    ) -> Result<Option<FlowResult>, FlowError> {
        let Some(ref unique_id) = flow.unique_id else {
            return Ok(None);
        };
        let Some(entry) = self.reconciler.entries().get_by_unique_id(DOMAIN, unique_id) else {
            return Ok(None);
        };
        if let Some(address) = address {
            let outcome = self
                .reconciler
                .update_address(&entry.entry_id, address)
                .await?;
            if outcome.is_updated() {
                self.changed.insert(entry.entry_id.clone());
            }
        }
        Ok(Some(flow.abort(REASON_ALREADY_CONFIGURED)))
    }

    async fn step_user(
        &self,
        flow: &mut WemoFlow,
        input: Option<UserInput>,
    ) -> Result<FlowResult, FlowError> {
        debug!("Flow {} user step: {:?}", flow.flow_id, input);
        let Some(input) = input else {
            return Ok(flow.user_form(None, None));
        };

        let host = input
            .host
            .clone()
            .ok_or(FlowError::MissingRequiredField(CONF_HOST))?;
        if flow.port_required && input.port.is_none() {
            return Err(FlowError::MissingRequiredField(CONF_PORT));
        }
        let endpoint = DeviceEndpoint::new(host, input.port.unwrap_or(0))?;

        let device = match self.resolver.get_device(&endpoint, false).await {
            Ok(device) => device,
            Err(ResolveError::PortUndetermined { .. }) => {
                flow.port_required = true;
                return Ok(flow.user_form(Some(&input), Some(ERROR_CANNOT_DETERMINE_PORT)));
            }
            Err(e) => {
                error!("Failed to connect: {}", e);
                return Ok(flow.user_form(Some(&input), Some(ERROR_CANNOT_CONNECT)));
            }
        };

        if flow.unique_id.is_none() {
            if let Some(abort) = self.set_unique_id(flow, &device.serial_number, true) {
                return Ok(abort);
            }
        }

        match self
            .reconciler
            .reconcile(&device, &endpoint, flow.source)
            .await?
        {
            ReconcileOutcome::Created(entry) => {
                info!("Configured {} ({})", entry.title, device.serial_number);
                Ok(flow.create_entry(&entry))
            }
            outcome => {
                debug!(
                    "Entry for {} exists: {:?}",
                    device.serial_number,
                    outcome.entry().entry_id
                );
                if outcome.is_updated() {
                    self.changed.insert(outcome.entry().entry_id.clone());
                }
                Ok(flow.abort(REASON_ALREADY_CONFIGURED))
            }
        }
    }

    async fn step_confirm(
        &self,
        flow: &mut WemoFlow,
        confirmed: bool,
    ) -> Result<FlowResult, FlowError> {
        if confirmed {
            let input = flow.discovered.clone();
            return self.step_user(flow, input).await;
        }

        // Devices known from a version 1 entry need no confirmation
        let known = flow
            .unique_id
            .as_deref()
            .and_then(|id| self.devices.get_by_identifier(DOMAIN, id))
            .is_some();
        if known {
            let input = flow.discovered.clone();
            return self.step_user(flow, input).await;
        }

        Ok(flow.confirm_form())
    }

    async fn step_ssdp(
        &self,
        flow: &mut WemoFlow,
        discovery: SsdpDiscovery,
    ) -> Result<FlowResult, FlowError> {
        let endpoint = discovery.endpoint()?;
        debug!(
            "Discovered {} ({}) at {}",
            discovery.friendly_name, discovery.serial, endpoint
        );

        // SSDP info is delivered once, keep it so the device can be unignored
        self.discovery_info
            .insert(discovery.serial.clone(), discovery.clone());

        flow.discovered = Some(UserInput::from(&endpoint));
        flow.title_placeholders
            .insert("name".to_string(), discovery.friendly_name.clone());

        if let Some(abort) = self.set_unique_id(flow, &discovery.serial, true) {
            return Ok(abort);
        }
        if let Some(abort) = self.abort_if_configured(flow, Some(&endpoint)).await? {
            return Ok(abort);
        }
        self.step_confirm(flow, false).await
    }

    async fn step_ignore(
        &self,
        flow: &mut WemoFlow,
        input: IgnoreInput,
    ) -> Result<FlowResult, FlowError> {
        self.set_unique_id(flow, &input.unique_id, false);
        if let Some(abort) = self.abort_if_configured(flow, None).await? {
            return Ok(abort);
        }

        let title = input.title.unwrap_or_else(|| input.unique_id.clone());
        let entry = ConfigEntry::new(DOMAIN, title)
            .with_unique_id(input.unique_id)
            .with_source(ConfigEntrySource::Ignore);
        match self.reconciler.entries().add(entry).await {
            Ok(entry) => {
                info!("Ignoring device {}", flow.unique_id.as_deref().unwrap_or_default());
                Ok(flow.create_entry(&entry))
            }
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                Ok(flow.abort(REASON_ALREADY_CONFIGURED))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn step_unignore(
        &self,
        flow: &mut WemoFlow,
        input: UnignoreInput,
    ) -> Result<FlowResult, FlowError> {
        let entries = self.reconciler.entries();
        if let Some(entry) = entries.get_by_unique_id(DOMAIN, &input.unique_id) {
            if entry.is_ignored() {
                entries.remove(&entry.entry_id).await?;
            }
        }

        let discovery = self
            .discovery_info
            .get(&input.unique_id)
            .map(|d| d.value().clone());
        match discovery {
            Some(discovery) => self.step_ssdp(flow, discovery).await,
            None => {
                warn!("No discovery_info for device: {}", input.unique_id);
                Ok(flow.abort(REASON_NO_DEVICES_FOUND))
            }
        }
    }
}
