//! Datapath Vport Synchronization Daemon
//!
//! Keeps datapath ports consistent with the kernel network devices they are
//! bound to. Link events from netlink are classified against the vport
//! table; when a device backing an attached port disappears the port is
//! detached and a `DEL` notification goes out on the vport multicast group,
//! and when a device is renamed its per-port sysfs entry is re-created under
//! the new name.

pub mod config_file;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod metrics_server;
pub mod multicast;
pub mod netlink_socket;
pub mod notification;
pub mod port_binder;
pub mod production_features;
pub mod registry;
pub mod sysfs;
pub mod types;

pub use config_file::{PortEntry, VportsyncConfig};
pub use dispatcher::DeviceEventDispatcher;
pub use error::*;
pub use metrics::MetricsCollector;
pub use metrics_server::{MetricsServer, MetricsServerConfig, spawn_metrics_server};
pub use multicast::{
    Delivery, MulticastGroup, MulticastHub, MulticastPublisher, Subscription, TransportError,
};
#[cfg(target_os = "linux")]
pub use netlink_socket::LinkMonitor;
pub use netlink_socket::{LinkChange, LinkTracker};
pub use notification::{BuildError, Notification, NotificationBuilder, VportInfoBuilder};
pub use port_binder::PortBinder;
pub use production_features::{ShutdownCoordinator, SystemdNotifier};
pub use registry::{VportRegistry, VportTable};
pub use sysfs::{DirSysfs, PortSysfs};
pub use types::*;
