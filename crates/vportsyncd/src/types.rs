//! Core types for datapath vport tracking
//!
//! A vport is one switch-managed port bound to a network device. Devices are
//! shared between the event source and the port table as `Arc<NetDevice>`;
//! vports are shared as `Arc<Vport>` and leave the table on detach.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Datapath port number
pub type PortNo = u32;

/// Reserved port number of the datapath's own local port
pub const OVSP_LOCAL: PortNo = 0;

/// Kernel network device as seen by the switch
#[derive(Debug)]
pub struct NetDevice {
    ifindex: u32,
    name: RwLock<String>,
    stats: VportStats,
}

impl NetDevice {
    /// Create a device handle
    pub fn new(ifindex: u32, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            ifindex,
            name: RwLock::new(name.into()),
            stats: VportStats::default(),
        })
    }

    /// Kernel interface index
    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Current interface name
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Apply a kernel rename. Returns the previous name.
    pub fn set_name(&self, name: impl Into<String>) -> String {
        std::mem::replace(&mut *self.name.write(), name.into())
    }

    /// Traffic counters last reported by the kernel
    pub fn stats(&self) -> &VportStats {
        &self.stats
    }
}

/// Backend of a vport
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VportKind {
    /// Device created and owned by the switch
    Internal,
    /// Existing device attached to the switch
    Netdev,
}

impl VportKind {
    /// Type name used in notifications
    pub fn as_str(&self) -> &'static str {
        match self {
            VportKind::Internal => "internal",
            VportKind::Netdev => "netdev",
        }
    }
}

/// Classification of a device relative to the switch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterfaceClass {
    /// Switch-created internal device
    Internal,
    /// Externally backed device attached to the switch
    Attached,
}

impl From<VportKind> for InterfaceClass {
    fn from(kind: VportKind) -> Self {
        match kind {
            VportKind::Internal => InterfaceClass::Internal,
            VportKind::Netdev => InterfaceClass::Attached,
        }
    }
}

/// Traffic counters of a port's backing device
#[derive(Debug, Default)]
pub struct VportStats {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

/// Point-in-time copy of [`VportStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VportStatsSnapshot {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

impl VportStats {
    /// Replace the counters with the kernel's current totals
    pub fn update(&self, totals: VportStatsSnapshot) {
        self.rx_packets.store(totals.rx_packets, Ordering::Relaxed);
        self.tx_packets.store(totals.tx_packets, Ordering::Relaxed);
        self.rx_bytes.store(totals.rx_bytes, Ordering::Relaxed);
        self.tx_bytes.store(totals.tx_bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> VportStatsSnapshot {
        VportStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A switch-managed port
#[derive(Debug)]
pub struct Vport {
    port_no: PortNo,
    kind: VportKind,
    dp_ifindex: u32,
    upcall_pid: u32,
    dev: Arc<NetDevice>,
}

impl Vport {
    pub fn new(
        port_no: PortNo,
        kind: VportKind,
        dp_ifindex: u32,
        upcall_pid: u32,
        dev: Arc<NetDevice>,
    ) -> Self {
        Self {
            port_no,
            kind,
            dp_ifindex,
            upcall_pid,
            dev,
        }
    }

    pub fn port_no(&self) -> PortNo {
        self.port_no
    }

    pub fn kind(&self) -> VportKind {
        self.kind
    }

    /// Interface index of the owning datapath
    pub fn dp_ifindex(&self) -> u32 {
        self.dp_ifindex
    }

    /// Netlink port id that receives upcalls for this port
    pub fn upcall_pid(&self) -> u32 {
        self.upcall_pid
    }

    /// Backing device
    pub fn dev(&self) -> &Arc<NetDevice> {
        &self.dev
    }

    /// Current name of the backing device
    pub fn name(&self) -> String {
        self.dev.name()
    }

    /// Counters of the backing device
    pub fn stats(&self) -> &VportStats {
        self.dev.stats()
    }

    /// Check if this is the datapath's local port
    pub fn is_local(&self) -> bool {
        self.port_no == OVSP_LOCAL
    }
}

impl fmt::Display for Vport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {} ({})", self.port_no, self.dev.name())
    }
}

/// Kernel device lifecycle event kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceEventKind {
    Register,
    Unregister,
    Up,
    Down,
    ChangeName,
    ChangeMtu,
    ChangeAddr,
    /// Any event the notifier does not name
    Other(u32),
}

impl DeviceEventKind {
    /// Label used for logging and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceEventKind::Register => "register",
            DeviceEventKind::Unregister => "unregister",
            DeviceEventKind::Up => "up",
            DeviceEventKind::Down => "down",
            DeviceEventKind::ChangeName => "changename",
            DeviceEventKind::ChangeMtu => "changemtu",
            DeviceEventKind::ChangeAddr => "changeaddr",
            DeviceEventKind::Other(_) => "other",
        }
    }
}

/// One device lifecycle event
#[derive(Clone, Debug)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub dev: Arc<NetDevice>,
}

impl DeviceEvent {
    pub fn new(kind: DeviceEventKind, dev: Arc<NetDevice>) -> Self {
        Self { kind, dev }
    }
}

/// Acknowledgement returned to the event source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifyAck {
    /// Event consumed; the source continues with other listeners
    Done,
}

/// Vport command carried in notifications
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VportCommand {
    New,
    Del,
    Get,
    Set,
}

impl VportCommand {
    /// Generic netlink command number
    pub fn number(&self) -> u8 {
        match self {
            VportCommand::New => 1,
            VportCommand::Del => 2,
            VportCommand::Get => 3,
            VportCommand::Set => 4,
        }
    }
}
