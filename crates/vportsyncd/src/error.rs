//! Error types for vportsyncd

use crate::types::PortNo;
use thiserror::Error;

/// Datapath vport notifier errors
#[derive(Error, Debug)]
pub enum VportsyncError {
    /// Netlink error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A port number is already in use on the datapath
    #[error("Port {0} already attached")]
    PortExists(PortNo),

    /// An interface is already bound to another vport
    #[error("Interface index {0} already bound to a vport")]
    InterfaceBound(u32),

    /// Filesystem representation could not be updated
    #[error("Sysfs error for port {port_no}: {message}")]
    Sysfs { port_no: PortNo, message: String },

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for vportsyncd operations
pub type Result<T> = std::result::Result<T, VportsyncError>;
