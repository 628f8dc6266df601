//! Configuration file support for vportsyncd
//!
//! Loads and validates vportsyncd configuration from TOML files.
//! Default location: /etc/sonic/vportsyncd.toml

use crate::error::{Result, VportsyncError};
use crate::metrics_server::DEFAULT_METRICS_PORT;
use crate::multicast::{DEFAULT_QUEUE_DEPTH, MulticastGroup, VPORT_GROUP_NAME};
use crate::notification::DEFAULT_MAX_MESSAGE_SIZE;
use crate::types::{OVSP_LOCAL, PortNo, VportKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/vportsyncd.toml";

/// One configured datapath port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    /// Datapath port number
    pub port_no: PortNo,

    /// Kernel interface name the port binds to
    pub interface: String,

    /// Port backend
    #[serde(default = "default_port_kind")]
    pub kind: VportKind,

    /// Netlink port id receiving upcalls
    #[serde(default)]
    pub upcall_pid: u32,
}

/// Datapath configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatapathConfig {
    /// Datapath name, also the name of its local internal device
    #[serde(default = "default_datapath_name")]
    pub name: String,

    /// Interface index of the datapath's local device
    #[serde(default)]
    pub ifindex: u32,

    /// Ports bound when their interface appears
    #[serde(default)]
    pub ports: Vec<PortEntry>,
}

/// Notification channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Multicast group name
    #[serde(default = "default_group_name")]
    pub group_name: String,

    /// Multicast group id
    #[serde(default = "default_group_id")]
    pub group_id: u32,

    /// Per-listener queue depth
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Largest notification that may be built, in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Sysfs mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SysfsConfig {
    /// Root directory for per-port entries
    #[serde(default = "default_sysfs_root")]
    pub root: PathBuf,
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Serve the Prometheus endpoint
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Listen address
    #[serde(default = "default_metrics_listen")]
    pub listen_addr: SocketAddr,
}

/// Complete vportsyncd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VportsyncConfig {
    #[serde(default)]
    pub datapath: DatapathConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub sysfs: SysfsConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

// Default functions
fn default_port_kind() -> VportKind {
    VportKind::Netdev
}

fn default_datapath_name() -> String {
    "ovs-system".to_string()
}

fn default_group_name() -> String {
    VPORT_GROUP_NAME.to_string()
}

fn default_group_id() -> u32 {
    1
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/run/sonic/vportsyncd")
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0u16, 0, 0, 0, 0, 0, 0, 1], DEFAULT_METRICS_PORT))
}

// Default implementations
impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            name: default_datapath_name(),
            ifindex: 0,
            ports: Vec::new(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            group_name: default_group_name(),
            group_id: default_group_id(),
            queue_depth: default_queue_depth(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for SysfsConfig {
    fn default() -> Self {
        Self {
            root: default_sysfs_root(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen_addr: default_metrics_listen(),
        }
    }
}

impl VportsyncConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                VportsyncError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(VportsyncError::Io(e)),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            VportsyncError::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Multicast group notifications go to
    pub fn group(&self) -> MulticastGroup {
        MulticastGroup::new(self.notify.group_id, self.notify.group_name.clone())
    }

    /// Configured port bound to `interface`
    pub fn port_for(&self, interface: &str) -> Option<&PortEntry> {
        self.datapath.ports.iter().find(|p| p.interface == interface)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.datapath.name.is_empty() {
            return Err(VportsyncError::Configuration(
                "datapath name cannot be empty".to_string(),
            ));
        }

        if self.notify.group_id == 0 {
            return Err(VportsyncError::Configuration(
                "group_id must be > 0".to_string(),
            ));
        }

        if self.notify.queue_depth == 0 {
            return Err(VportsyncError::Configuration(
                "queue_depth must be > 0".to_string(),
            ));
        }

        let mut port_numbers = HashSet::new();
        let mut interfaces = HashSet::new();
        for port in &self.datapath.ports {
            if port.port_no == OVSP_LOCAL {
                return Err(VportsyncError::Configuration(format!(
                    "port {} is reserved for the local port",
                    OVSP_LOCAL
                )));
            }
            if !port_numbers.insert(port.port_no) {
                return Err(VportsyncError::Configuration(format!(
                    "duplicate port number {}",
                    port.port_no
                )));
            }
            if port.interface.is_empty() || port.interface == self.datapath.name {
                return Err(VportsyncError::Configuration(format!(
                    "invalid interface for port {}",
                    port.port_no
                )));
            }
            if !interfaces.insert(port.interface.as_str()) {
                return Err(VportsyncError::Configuration(format!(
                    "interface {} configured twice",
                    port.interface
                )));
            }
        }

        Ok(())
    }
}
