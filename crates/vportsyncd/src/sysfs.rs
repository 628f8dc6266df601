//! Filesystem representation of datapath ports
//!
//! Each non-local port appears as `<root>/<datapath>/brif/<ifname>/` holding a
//! `port_no` file. The entry is keyed by the interface name, so a rename
//! requires removing the old entry before the new one can be created.

use crate::error::{Result, VportsyncError};
use crate::types::{PortNo, Vport};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Synchronizes the per-port filesystem entries
pub trait PortSysfs: Send + Sync {
    /// Drop the entry created for `vport`, releasing its name
    fn remove_entry(&self, vport: &Vport);

    /// Create an entry for `vport` under its current name
    fn add_entry(&self, vport: &Vport) -> Result<()>;
}

/// Directory-tree implementation of [`PortSysfs`]
#[derive(Debug)]
pub struct DirSysfs {
    brif_dir: PathBuf,
    entries: Mutex<HashMap<PortNo, String>>,
}

impl DirSysfs {
    /// Create the `brif` directory for `dp_name` under `root`
    pub fn new(root: impl AsRef<Path>, dp_name: &str) -> Result<Self> {
        let brif_dir = root.as_ref().join(dp_name).join("brif");
        fs::create_dir_all(&brif_dir)?;
        Ok(Self {
            brif_dir,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn brif_dir(&self) -> &Path {
        &self.brif_dir
    }

    /// Name currently claimed by `port_no`
    pub fn entry_name(&self, port_no: PortNo) -> Option<String> {
        self.entries.lock().get(&port_no).cloned()
    }
}

impl PortSysfs for DirSysfs {
    fn remove_entry(&self, vport: &Vport) {
        let mut entries = self.entries.lock();
        let Some(name) = entries.remove(&vport.port_no()) else {
            return;
        };

        match fs::remove_dir_all(self.brif_dir.join(&name)) {
            Ok(()) => debug!(port_no = vport.port_no(), name = %name, "Removed sysfs entry"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(port_no = vport.port_no(), name = %name, error = %e, "Failed to remove sysfs entry"),
        }
    }

    fn add_entry(&self, vport: &Vport) -> Result<()> {
        if vport.is_local() {
            return Ok(());
        }

        let port_no = vport.port_no();
        let name = vport.name();
        let mut entries = self.entries.lock();

        if entries.contains_key(&port_no) {
            return Err(VportsyncError::Sysfs {
                port_no,
                message: "entry already present".to_string(),
            });
        }

        let dir = self.brif_dir.join(&name);
        if let Err(e) = fs::create_dir(&dir) {
            let message = if e.kind() == ErrorKind::AlreadyExists {
                format!("name {} in use", name)
            } else {
                e.to_string()
            };
            return Err(VportsyncError::Sysfs { port_no, message });
        }
        if let Err(e) = write_port_no(&dir, port_no) {
            return Err(VportsyncError::Sysfs {
                port_no,
                message: e.to_string(),
            });
        }

        debug!(port_no, name = %name, "Added sysfs entry");
        entries.insert(port_no, name);
        Ok(())
    }
}

/// Write `port_no` into a freshly created entry, discarding the entry on failure
fn write_port_no(dir: &Path, port_no: PortNo) -> std::io::Result<()> {
    if let Err(e) = fs::write(dir.join("port_no"), format!("{}\n", port_no)) {
        let _ = fs::remove_dir_all(dir);
        return Err(e);
    }
    Ok(())
}
