//! Datapath port table
//!
//! [`VportRegistry`] is the capability the device-event dispatcher needs from
//! the port table: classify a device, resolve it to its vport, and detach a
//! vport whose device is gone. [`VportTable`] is the in-memory table owned by
//! one datapath. When built [`VportTable::with_sysfs`], detaching a port also
//! releases its filesystem entry, so the name can be claimed again.

use crate::error::{Result, VportsyncError};
use crate::sysfs::PortSysfs;
use crate::types::{InterfaceClass, NetDevice, PortNo, Vport, VportKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Port table operations used by the device-event dispatcher
///
/// Implementations must allow concurrent `detach` calls for distinct vports.
pub trait VportRegistry: Send + Sync {
    /// Classify a device as switch-internal or attached
    fn classify(&self, dev: &NetDevice) -> InterfaceClass;

    /// Find the vport bound to `dev`, looked up the way `class` dictates.
    /// `None` means the device is not managed by the switch.
    fn resolve(&self, dev: &NetDevice, class: InterfaceClass) -> Option<Arc<Vport>>;

    /// Remove a vport from the table. Ownership of the caller's reference
    /// ends here.
    fn detach(&self, vport: Arc<Vport>);
}

#[derive(Debug, Default)]
struct Ports {
    by_port: HashMap<PortNo, Arc<Vport>>,
    by_ifindex: HashMap<u32, PortNo>,
}

/// Port table of a single datapath
pub struct VportTable {
    dp_name: String,
    dp_ifindex: u32,
    ports: RwLock<Ports>,
    sysfs: Option<Arc<dyn PortSysfs>>,
}

impl fmt::Debug for VportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VportTable")
            .field("dp_name", &self.dp_name)
            .field("dp_ifindex", &self.dp_ifindex)
            .field("ports", &self.ports)
            .field("sysfs", &self.sysfs.is_some())
            .finish()
    }
}

impl VportTable {
    /// Create an empty table for the datapath `dp_name`
    pub fn new(dp_name: impl Into<String>, dp_ifindex: u32) -> Self {
        Self {
            dp_name: dp_name.into(),
            dp_ifindex,
            ports: RwLock::new(Ports::default()),
            sysfs: None,
        }
    }

    /// Release each detached port's sysfs entry through `sysfs`
    pub fn with_sysfs(mut self, sysfs: Arc<dyn PortSysfs>) -> Self {
        self.sysfs = Some(sysfs);
        self
    }

    pub fn dp_name(&self) -> &str {
        &self.dp_name
    }

    pub fn dp_ifindex(&self) -> u32 {
        self.dp_ifindex
    }

    /// Bind `dev` to a new vport numbered `port_no`
    pub fn attach(
        &self,
        port_no: PortNo,
        kind: VportKind,
        dev: Arc<NetDevice>,
        upcall_pid: u32,
    ) -> Result<Arc<Vport>> {
        let mut ports = self.ports.write();

        if ports.by_port.contains_key(&port_no) {
            return Err(VportsyncError::PortExists(port_no));
        }
        if ports.by_ifindex.contains_key(&dev.ifindex()) {
            return Err(VportsyncError::InterfaceBound(dev.ifindex()));
        }

        let vport = Arc::new(Vport::new(port_no, kind, self.dp_ifindex, upcall_pid, dev));
        ports.by_ifindex.insert(vport.dev().ifindex(), port_no);
        ports.by_port.insert(port_no, vport.clone());

        info!(
            datapath = %self.dp_name,
            port_no,
            kind = kind.as_str(),
            name = %vport.name(),
            "Attached vport"
        );
        Ok(vport)
    }

    /// Look up a vport by port number
    pub fn get(&self, port_no: PortNo) -> Option<Arc<Vport>> {
        self.ports.read().by_port.get(&port_no).cloned()
    }

    /// Look up a vport by backing interface index
    pub fn get_by_ifindex(&self, ifindex: u32) -> Option<Arc<Vport>> {
        let ports = self.ports.read();
        ports
            .by_ifindex
            .get(&ifindex)
            .and_then(|port_no| ports.by_port.get(port_no))
            .cloned()
    }

    /// Number of attached vports
    pub fn len(&self) -> usize {
        self.ports.read().by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Attached port numbers in ascending order
    pub fn port_numbers(&self) -> Vec<PortNo> {
        let mut numbers: Vec<_> = self.ports.read().by_port.keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }
}

impl VportRegistry for VportTable {
    /// Devices with no vport classify as attached; `resolve` then finds nothing.
    fn classify(&self, dev: &NetDevice) -> InterfaceClass {
        match self.get_by_ifindex(dev.ifindex()) {
            Some(vport) => vport.kind().into(),
            None => InterfaceClass::Attached,
        }
    }

    fn resolve(&self, dev: &NetDevice, class: InterfaceClass) -> Option<Arc<Vport>> {
        let vport = self.get_by_ifindex(dev.ifindex())?;
        (InterfaceClass::from(vport.kind()) == class).then_some(vport)
    }

    fn detach(&self, vport: Arc<Vport>) {
        let port_no = vport.port_no();
        {
            let mut ports = self.ports.write();
            match ports.by_port.get(&port_no) {
                Some(current) if Arc::ptr_eq(current, &vport) => {
                    ports.by_port.remove(&port_no);
                    ports.by_ifindex.remove(&vport.dev().ifindex());
                    debug!(datapath = %self.dp_name, port_no, remaining = ports.by_port.len(), "Detached vport");
                }
                _ => {
                    warn!(datapath = %self.dp_name, port_no, "Detach of vport not in table");
                    return;
                }
            }
        }

        // The port number is free again, but the entry still holds the name
        if let Some(sysfs) = &self.sysfs
            && !vport.is_local()
        {
            sysfs.remove_entry(&vport);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sysfs::DirSysfs;
    use tempfile::TempDir;

    fn table() -> VportTable {
        VportTable::new("ovs-system", 2)
    }

    #[test]
    fn test_attach_and_lookup() {
        let table = table();
        let dev = NetDevice::new(10, "eth0");
        let vport = table.attach(1, VportKind::Netdev, dev, 100).unwrap();

        assert_eq!(vport.dp_ifindex(), 2);
        assert_eq!(vport.upcall_pid(), 100);
        assert_eq!(table.len(), 1);
        assert!(table.get(1).is_some());
        assert!(table.get_by_ifindex(10).is_some());
    }

    #[test]
    fn test_attach_duplicate_port() {
        let table = table();
        table.attach(1, VportKind::Netdev, NetDevice::new(10, "eth0"), 0).unwrap();
        let err = table
            .attach(1, VportKind::Netdev, NetDevice::new(11, "eth1"), 0)
            .unwrap_err();
        assert!(matches!(err, VportsyncError::PortExists(1)));
    }

    #[test]
    fn test_attach_duplicate_interface() {
        let table = table();
        let dev = NetDevice::new(10, "eth0");
        table.attach(1, VportKind::Netdev, dev.clone(), 0).unwrap();
        let err = table.attach(2, VportKind::Netdev, dev, 0).unwrap_err();
        assert!(matches!(err, VportsyncError::InterfaceBound(10)));
    }

    #[test]
    fn test_classify() {
        let table = table();
        let internal = NetDevice::new(2, "ovs-system");
        let external = NetDevice::new(10, "eth0");
        table.attach(0, VportKind::Internal, internal.clone(), 0).unwrap();
        table.attach(1, VportKind::Netdev, external.clone(), 0).unwrap();

        assert_eq!(table.classify(&internal), InterfaceClass::Internal);
        assert_eq!(table.classify(&external), InterfaceClass::Attached);
        assert_eq!(table.classify(&NetDevice::new(99, "lo")), InterfaceClass::Attached);
    }

    #[test]
    fn test_resolve_respects_class() {
        let table = table();
        let dev = NetDevice::new(10, "eth0");
        table.attach(1, VportKind::Netdev, dev.clone(), 0).unwrap();

        assert!(table.resolve(&dev, InterfaceClass::Attached).is_some());
        assert!(table.resolve(&dev, InterfaceClass::Internal).is_none());
    }

    #[test]
    fn test_resolve_unmanaged() {
        let table = table();
        let dev = NetDevice::new(42, "docker0");
        assert!(table.resolve(&dev, InterfaceClass::Attached).is_none());
    }

    #[test]
    fn test_detach_removes_both_indexes() {
        let table = table();
        let vport = table.attach(3, VportKind::Netdev, NetDevice::new(10, "eth0"), 0).unwrap();

        table.detach(vport);
        assert!(table.is_empty());
        assert!(table.get(3).is_none());
        assert!(table.get_by_ifindex(10).is_none());
    }

    #[test]
    fn test_detach_releases_sysfs_entry() {
        let dir = TempDir::new().unwrap();
        let sysfs = Arc::new(DirSysfs::new(dir.path(), "ovs-system").unwrap());
        let table = table().with_sysfs(sysfs.clone());
        let vport = table.attach(3, VportKind::Netdev, NetDevice::new(10, "eth0"), 0).unwrap();
        sysfs.add_entry(&vport).unwrap();

        table.detach(vport);
        assert!(sysfs.entry_name(3).is_none());
        assert!(!sysfs.brif_dir().join("eth0").exists());

        // The freed name can be claimed by another port
        let next = table.attach(4, VportKind::Netdev, NetDevice::new(11, "eth0"), 0).unwrap();
        sysfs.add_entry(&next).unwrap();
        assert_eq!(sysfs.entry_name(4).as_deref(), Some("eth0"));
    }

    #[test]
    fn test_stale_detach_keeps_sysfs_entry() {
        let dir = TempDir::new().unwrap();
        let sysfs = Arc::new(DirSysfs::new(dir.path(), "ovs-system").unwrap());
        let table = table().with_sysfs(sysfs.clone());
        let old = table.attach(3, VportKind::Netdev, NetDevice::new(10, "eth0"), 0).unwrap();
        table.detach(old.clone());

        let current = table.attach(3, VportKind::Netdev, NetDevice::new(11, "eth1"), 0).unwrap();
        sysfs.add_entry(&current).unwrap();

        table.detach(old);
        assert_eq!(sysfs.entry_name(3).as_deref(), Some("eth1"));
    }

    #[test]
    fn test_detach_stale_reference_keeps_new_port() {
        let table = table();
        let old = table.attach(3, VportKind::Netdev, NetDevice::new(10, "eth0"), 0).unwrap();
        table.detach(old.clone());
        table.attach(3, VportKind::Netdev, NetDevice::new(11, "eth1"), 0).unwrap();

        table.detach(old);
        assert_eq!(table.port_numbers(), vec![3]);
        assert!(table.get_by_ifindex(11).is_some());
    }

    #[test]
    fn test_concurrent_detach_distinct_ports() {
        let table = Arc::new(table());
        let vports: Vec<_> = (1..=32)
            .map(|n| {
                table
                    .attach(n, VportKind::Netdev, NetDevice::new(100 + n, format!("eth{}", n)), 0)
                    .unwrap()
            })
            .collect();

        let handles: Vec<_> = vports
            .into_iter()
            .map(|vport| {
                let table = table.clone();
                std::thread::spawn(move || table.detach(vport))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(table.is_empty());
    }
}
