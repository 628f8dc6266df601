//! Binding configured ports to devices as they register
//!
//! The dispatcher only ever tears ports down. [`PortBinder`] is the
//! configuration path that puts them in the table: the datapath's own device
//! becomes the local port, and each configured interface becomes its
//! configured port when the kernel registers it.

use crate::config_file::VportsyncConfig;
use crate::error::Result;
use crate::registry::VportTable;
use crate::sysfs::PortSysfs;
use crate::types::{DeviceEvent, DeviceEventKind, OVSP_LOCAL, Vport, VportKind};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PortBinder {
    table: Arc<VportTable>,
    sysfs: Arc<dyn PortSysfs>,
    config: VportsyncConfig,
}

impl PortBinder {
    pub fn new(table: Arc<VportTable>, sysfs: Arc<dyn PortSysfs>, config: VportsyncConfig) -> Self {
        Self {
            table,
            sysfs,
            config,
        }
    }

    /// Attach the port configured for a newly registered device.
    ///
    /// Returns the new vport, or `None` when the event is not a register or
    /// the device is not configured.
    pub fn on_event(&self, event: &DeviceEvent) -> Result<Option<Arc<Vport>>> {
        if event.kind != DeviceEventKind::Register {
            return Ok(None);
        }

        let name = event.dev.name();
        if name == self.table.dp_name() {
            let vport = self
                .table
                .attach(OVSP_LOCAL, VportKind::Internal, event.dev.clone(), 0)?;
            return Ok(Some(vport));
        }

        let Some(entry) = self.config.port_for(&name) else {
            debug!(name = %name, "Device not configured as a port");
            return Ok(None);
        };

        let vport = self.table.attach(
            entry.port_no,
            entry.kind,
            event.dev.clone(),
            entry.upcall_pid,
        )?;

        if let Err(e) = self.sysfs.add_entry(&vport) {
            warn!(port_no = vport.port_no(), error = %e, "Failed to add sysfs entry");
        }
        Ok(Some(vport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::PortEntry;
    use crate::error::VportsyncError;
    use crate::registry::VportRegistry;
    use crate::sysfs::DirSysfs;
    use crate::types::NetDevice;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Arc<VportTable>, Arc<DirSysfs>, PortBinder) {
        let sysfs = Arc::new(DirSysfs::new(dir.path(), "ovs-system").unwrap());
        let table = Arc::new(VportTable::new("ovs-system", 3).with_sysfs(sysfs.clone()));
        let mut config = VportsyncConfig::default();
        config.datapath.ports.push(PortEntry {
            port_no: 4,
            interface: "Ethernet0".to_string(),
            kind: VportKind::Netdev,
            upcall_pid: 99,
        });
        let binder = PortBinder::new(table.clone(), sysfs.clone(), config);
        (table, sysfs, binder)
    }

    fn register(ifindex: u32, name: &str) -> DeviceEvent {
        DeviceEvent::new(DeviceEventKind::Register, NetDevice::new(ifindex, name))
    }

    #[test]
    fn test_datapath_device_becomes_local_port() {
        let dir = TempDir::new().unwrap();
        let (table, sysfs, binder) = setup(&dir);

        let vport = binder.on_event(&register(3, "ovs-system")).unwrap().unwrap();
        assert!(vport.is_local());
        assert_eq!(vport.kind(), VportKind::Internal);
        assert_eq!(table.port_numbers(), vec![OVSP_LOCAL]);
        assert!(sysfs.entry_name(OVSP_LOCAL).is_none());
    }

    #[test]
    fn test_configured_interface_is_attached() {
        let dir = TempDir::new().unwrap();
        let (table, sysfs, binder) = setup(&dir);

        let vport = binder.on_event(&register(10, "Ethernet0")).unwrap().unwrap();
        assert_eq!(vport.port_no(), 4);
        assert_eq!(vport.upcall_pid(), 99);
        assert!(table.get(4).is_some());
        assert_eq!(sysfs.entry_name(4).as_deref(), Some("Ethernet0"));
        assert!(sysfs.brif_dir().join("Ethernet0").join("port_no").exists());
    }

    #[test]
    fn test_unconfigured_and_non_register_events_ignored() {
        let dir = TempDir::new().unwrap();
        let (table, _sysfs, binder) = setup(&dir);

        assert!(binder.on_event(&register(11, "Ethernet4")).unwrap().is_none());
        let up = DeviceEvent::new(DeviceEventKind::Up, NetDevice::new(10, "Ethernet0"));
        assert!(binder.on_event(&up).unwrap().is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_second_register_of_bound_port_fails() {
        let dir = TempDir::new().unwrap();
        let (_table, _sysfs, binder) = setup(&dir);

        binder.on_event(&register(10, "Ethernet0")).unwrap();
        let err = binder.on_event(&register(12, "Ethernet0")).unwrap_err();
        assert!(matches!(err, VportsyncError::PortExists(4)));
    }

    #[test]
    fn test_port_rebinds_after_unregister() {
        let dir = TempDir::new().unwrap();
        let (table, sysfs, binder) = setup(&dir);

        let vport = binder.on_event(&register(10, "Ethernet0")).unwrap().unwrap();
        table.detach(vport);
        assert!(sysfs.entry_name(4).is_none());

        let vport = binder.on_event(&register(12, "Ethernet0")).unwrap().unwrap();
        assert_eq!(vport.dev().ifindex(), 12);
        assert_eq!(sysfs.entry_name(4).as_deref(), Some("Ethernet0"));
    }
}
