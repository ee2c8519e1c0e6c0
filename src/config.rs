//! # Configuration Document
//!
//! The middleware engine reads one JSON document when an application is
//! created. This module provides the typed form of that document, the
//! template it starts from, and the persistence step.
//!
//! ## Quick Start
//!
//! Callers start from a snapshot of the active document, add their own
//! entries and hand it back as overrides:
//!
//! ```no_run
//! use someip_adapter::prelude::*;
//!
//! # fn example(adapter: &Adapter) -> Result<()> {
//! let configuration = adapter
//!     .configuration()
//!     .with_application("service_example", 0x1111)
//!     .with_service(0x1234, 0x5678, 30509);
//!
//! let service = adapter
//!     .application("service_example", 0x1234, 0x5678)
//!     .configuration(configuration)
//!     .build()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Document Layout
//!
//! | Key | Type | Default |
//! |-----|------|---------|
//! | `applications` | `[{name, id}]` | `[]` |
//! | `services` | `[{service, instance, unreliable?, reliable?}]` | `[]` |
//! | `clients` | `[{service, instance, unreliable?}]` | `[]` |
//! | `unicast` | IPv4 literal | `127.0.0.1` (host address on Windows) |
//! | `netmask` | IPv4 literal | `255.255.255.0` |
//! | `routing` | application name | absent until a router is elected |
//! | `service-discovery` | `{enable, multicast, port, protocol, ...}` | `true`, `224.224.224.245`, `30490`, `udp` |
//!
//! Overrides replace the active document wholesale. Nothing is merged key
//! by key.
//!
//! ## Persistence
//!
//! [`ConfigurationDocument::persist`] writes the document with sorted keys
//! and two-space indentation, then flushes and syncs the file. The engine
//! reads it synchronously at creation time, so the write must be complete
//! before `create` is issued.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConfigError, Result};

/// File name the engine reads its configuration from, relative to the
/// working directory.
pub const CONFIGURATION_FILE: &str = "vsomeip.json";

/// Default SD multicast group of the shipped template.
pub const DEFAULT_SD_MULTICAST: Ipv4Addr = Ipv4Addr::new(224, 224, 224, 245);

/// Default SD port of the shipped template.
pub const DEFAULT_SD_PORT: u16 = 30490;

/// Default netmask of the shipped template.
pub const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

const EMBEDDED_TEMPLATE: &str = include_str!("../templates/vsomeip_template.json");

/// One co-located application and its numeric (client) id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationEntry {
    pub name: String,
    pub id: u16,
}

/// TCP endpoint of an offered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliableEndpoint {
    pub port: u16,
    #[serde(rename = "enable-magic-cookies", default)]
    pub enable_magic_cookies: bool,
}

/// A service instance offered on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service: u16,
    pub instance: u16,
    /// UDP port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unreliable: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reliable: Option<ReliableEndpoint>,
}

/// A service instance consumed on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub service: u16,
    pub instance: u16,
    /// UDP ports subscribed to. A single port may be written as a bare
    /// number.
    #[serde(
        default,
        deserialize_with = "port_list",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub unreliable: Vec<u16>,
}

fn port_list<'de, D>(deserializer: D) -> std::result::Result<Vec<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Ports {
        One(u16),
        Many(Vec<u16>),
    }

    Ok(match Ports::deserialize(deserializer)? {
        Ports::One(port) => vec![port],
        Ports::Many(ports) => ports,
    })
}

/// Service discovery parameters.
///
/// Only the addressing fields are typed. Timing parameters
/// (`initial_delay_min`, `cyclic_offer_delay`, ...) are carried through
/// untouched in [`timing`](Self::timing).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDiscovery {
    #[serde(default = "default_sd_enable")]
    pub enable: bool,
    #[serde(default = "default_sd_multicast")]
    pub multicast: Ipv4Addr,
    #[serde(default = "default_sd_port")]
    pub port: u16,
    #[serde(default = "default_sd_protocol")]
    pub protocol: String,
    #[serde(flatten)]
    pub timing: Map<String, Value>,
}

fn default_sd_enable() -> bool {
    true
}

fn default_sd_multicast() -> Ipv4Addr {
    DEFAULT_SD_MULTICAST
}

fn default_sd_port() -> u16 {
    DEFAULT_SD_PORT
}

fn default_sd_protocol() -> String {
    "udp".to_string()
}

fn default_netmask() -> Ipv4Addr {
    DEFAULT_NETMASK
}

impl Default for ServiceDiscovery {
    fn default() -> Self {
        Self {
            enable: default_sd_enable(),
            multicast: DEFAULT_SD_MULTICAST,
            port: DEFAULT_SD_PORT,
            protocol: default_sd_protocol(),
            timing: Map::new(),
        }
    }
}

/// The configuration document shared by every application on the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct ConfigurationDocument {
    #[serde(default)]
    pub applications: Vec<ApplicationEntry>,
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
    #[serde(default = "default_unicast")]
    pub unicast: Ipv4Addr,
    #[serde(default = "default_netmask")]
    pub netmask: Ipv4Addr,
    /// Name of the application acting as routing manager.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<String>,
    #[serde(rename = "service-discovery", default)]
    pub service_discovery: ServiceDiscovery,
}

impl ConfigurationDocument {
    /// Parse a document from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a previously persisted document.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Render the document as pretty JSON with sorted keys.
    pub fn to_json(&self) -> Result<String> {
        let value = sort_keys(serde_json::to_value(self)?);
        Ok(serde_json::to_string_pretty(&value)?)
    }

    /// Write the document to `path` and sync it to storage.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        file.sync_all()?;
        tracing::debug!("Persisted configuration to {}", path.display());
        Ok(())
    }

    /// Whether any service is configured. Without one no router is needed.
    pub fn has_services(&self) -> bool {
        !self.services.is_empty()
    }

    /// Look up an application entry by name.
    pub fn application(&self, name: &str) -> Option<&ApplicationEntry> {
        self.applications.iter().find(|app| app.name == name)
    }

    pub fn with_application(mut self, name: impl Into<String>, id: u16) -> Self {
        self.applications.push(ApplicationEntry {
            name: name.into(),
            id,
        });
        self
    }

    /// Add a service reachable over UDP on `port`.
    pub fn with_service(mut self, service: u16, instance: u16, port: u16) -> Self {
        self.services.push(ServiceEntry {
            service,
            instance,
            unreliable: Some(port),
            reliable: None,
        });
        self
    }

    /// Add a service reachable over TCP on `port`.
    pub fn with_reliable_service(
        mut self,
        service: u16,
        instance: u16,
        port: u16,
        magic_cookies: bool,
    ) -> Self {
        self.services.push(ServiceEntry {
            service,
            instance,
            unreliable: None,
            reliable: Some(ReliableEndpoint {
                port,
                enable_magic_cookies: magic_cookies,
            }),
        });
        self
    }

    pub fn with_client(mut self, service: u16, instance: u16, ports: &[u16]) -> Self {
        self.clients.push(ClientEntry {
            service,
            instance,
            unreliable: ports.to_vec(),
        });
        self
    }

    pub fn with_unicast(mut self, unicast: Ipv4Addr) -> Self {
        self.unicast = unicast;
        self
    }

    pub fn with_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.netmask = netmask;
        self
    }

    pub fn with_service_discovery(mut self, multicast: Ipv4Addr, port: u16, enable: bool) -> Self {
        self.service_discovery.multicast = multicast;
        self.service_discovery.port = port;
        self.service_discovery.enable = enable;
        self
    }
}

/// Template every fresh document is instantiated from.
#[derive(Debug, Clone)]
pub struct Template {
    document: ConfigurationDocument,
}

impl Template {
    /// The template shipped with the adapter.
    pub fn embedded() -> Result<Self> {
        Self::from_json(EMBEDDED_TEMPLATE)
    }

    /// Parse a template from JSON text.
    ///
    /// # Errors
    ///
    /// [`Error::Config`](crate::Error::Config) when the text is not a valid
    /// configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let document = serde_json::from_str(json)
            .map_err(|e| ConfigError::new(format!("malformed template: {e}")))?;
        Ok(Self { document })
    }

    /// Read a template from disk.
    ///
    /// # Errors
    ///
    /// [`Error::Config`](crate::Error::Config) when the file is missing,
    /// unreadable or malformed.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| {
            ConfigError::new(format!("cannot read template {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    /// The template exactly as parsed.
    pub fn document(&self) -> &ConfigurationDocument {
        &self.document
    }

    /// A fresh document with `unicast` set to the local host address.
    pub fn instantiate(&self) -> ConfigurationDocument {
        let mut document = self.document.clone();
        document.unicast = default_unicast();
        document
    }
}

/// Produce the document to install: the overrides as given, or a fresh
/// instance of the template.
pub fn build_configuration(
    overrides: Option<ConfigurationDocument>,
    template: &Template,
) -> ConfigurationDocument {
    overrides.unwrap_or_else(|| template.instantiate())
}

/// Best-effort local address for `unicast`.
///
/// Rebuild every object with its keys in order. `Map` keeps insertion
/// order when serde_json's `preserve_order` feature is on anywhere in the
/// build.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(key, value)| (key, sort_keys(value)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Loopback everywhere except Windows, where the host name is resolved.
pub fn default_unicast() -> Ipv4Addr {
    #[cfg(windows)]
    {
        if let Some(address) = resolve_host_ipv4() {
            return address;
        }
    }
    Ipv4Addr::LOCALHOST
}

#[cfg(windows)]
fn resolve_host_ipv4() -> Option<Ipv4Addr> {
    use std::net::{IpAddr, ToSocketAddrs};

    let host = std::env::var("COMPUTERNAME").ok()?;
    (host.as_str(), 0)
        .to_socket_addrs()
        .ok()?
        .find_map(|address| match address.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
}
