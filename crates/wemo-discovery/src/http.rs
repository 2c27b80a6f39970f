//! HTTP implementations of the resolver collaborators
//!
//! WeMo devices serve a UPnP device description at `/setup.xml` on one of a
//! handful of ports. Only the fields needed for identification are read from
//! it.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, trace};
use wemo_core::DeviceDescriptor;

use crate::error::FetchError;
use crate::resolver::{setup_url_for_address, DescriptionFetcher, PortProbe};

/// Ports WeMo devices are known to listen on, in probing order
pub const PROBE_PORTS: [u16; 5] = [49153, 49152, 49154, 49151, 49155];

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder().timeout(timeout).build()
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if let Some(status) = err.status() {
        FetchError::Status(status.as_u16())
    } else if err.is_connect() || err.is_request() {
        FetchError::Connect(Box::new(err))
    } else {
        FetchError::InvalidDescription(err.to_string())
    }
}

/// Fetches `setup.xml` over HTTP
#[derive(Debug, Clone)]
pub struct HttpDescriptionFetcher {
    client: reqwest::Client,
}

impl HttpDescriptionFetcher {
    pub fn new() -> reqwest::Result<Self> {
        Self::with_timeout(FETCH_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
        })
    }
}

#[async_trait]
impl DescriptionFetcher for HttpDescriptionFetcher {
    async fn fetch(&self, url: &str) -> Result<DeviceDescriptor, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(map_reqwest_error)?;
        trace!("Description from {}: {} bytes", url, body.len());
        parse_description(&body, url)
    }
}

/// Probes the known WeMo ports for a setup URL
#[derive(Debug, Clone)]
pub struct HttpPortProbe {
    client: reqwest::Client,
    ports: Vec<u16>,
}

impl HttpPortProbe {
    pub fn new() -> reqwest::Result<Self> {
        Self::with_ports(PROBE_PORTS.to_vec(), PROBE_TIMEOUT)
    }

    pub fn with_ports(ports: Vec<u16>, timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            ports,
        })
    }
}

#[async_trait]
impl PortProbe for HttpPortProbe {
    async fn probe(&self, host: &str) -> Option<String> {
        for port in &self.ports {
            let url = setup_url_for_address(host, *port);
            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!("Found WeMo setup URL {}", url);
                    return Some(url);
                }
                Ok(response) => trace!("{} answered {}", url, response.status()),
                Err(e) => trace!("{} unreachable: {}", url, e),
            }
        }
        debug!("No WeMo setup URL found for {}", host);
        None
    }
}

/// Description fields read from `<device>`
const FIELDS: [&str; 5] = [
    "friendlyName",
    "serialNumber",
    "modelName",
    "manufacturer",
    "firmwareVersion",
];

fn field_pattern(name: &str) -> Regex {
    let pattern = format!(r"<{0}>\s*([^<]*?)\s*</{0}>", regex::escape(name));
    Regex::new(&pattern).expect("valid regex")
}

fn element(xml: &str, name: &str) -> Option<String> {
    static PATTERNS: OnceLock<HashMap<&'static str, Regex>> = OnceLock::new();
    let patterns =
        PATTERNS.get_or_init(|| FIELDS.iter().map(|f| (*f, field_pattern(f))).collect());
    patterns
        .get(name)?
        .captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()))
        .filter(|s| !s.is_empty())
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn device_section(xml: &str) -> &str {
    static DEVICE: OnceLock<Regex> = OnceLock::new();
    let re = DEVICE.get_or_init(|| {
        Regex::new(r"(?s)<device>(.*)</device>").expect("valid regex")
    });
    re.captures(xml)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(xml)
}

/// Extract the identifying fields from a UPnP device description
pub fn parse_description(xml: &str, url: &str) -> Result<DeviceDescriptor, FetchError> {
    let device = device_section(xml);

    let serial_number = element(device, "serialNumber")
        .ok_or_else(|| FetchError::InvalidDescription("missing serialNumber".to_string()))?;
    let model_name = element(device, "modelName")
        .ok_or_else(|| FetchError::InvalidDescription("missing modelName".to_string()))?;
    let name = element(device, "friendlyName").unwrap_or_else(|| serial_number.clone());

    let mut descriptor = DeviceDescriptor::new(name, serial_number, model_name, url);
    if let Ok(parsed) = url::Url::parse(url) {
        if let Some(host) = parsed.host_str() {
            descriptor.host = host.to_string();
        }
        descriptor.port = parsed.port_or_known_default().unwrap_or(0);
    }
    descriptor.manufacturer = element(device, "manufacturer");
    descriptor.firmware_version = element(device, "firmwareVersion");
    Ok(descriptor)
}
