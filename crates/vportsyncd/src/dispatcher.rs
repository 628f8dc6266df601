//! Device event dispatcher
//!
//! Entry point for kernel device lifecycle events. Each event is resolved to
//! the vport bound to the device, if any, and turned into a port table
//! mutation plus a multicast notification:
//!
//! - unregister of an attached device: build a delete notification, detach
//!   the vport, then broadcast the notification or signal the build error.
//!   The detach happens whatever the notification outcome.
//! - rename: recreate the port's sysfs entry under the new name (never for
//!   the local port).
//!
//! The dispatcher never fails back to the event source.

use crate::metrics::MetricsCollector;
use crate::multicast::{MulticastGroup, MulticastPublisher};
use crate::notification::NotificationBuilder;
use crate::registry::VportRegistry;
use crate::sysfs::PortSysfs;
use crate::types::{DeviceEvent, DeviceEventKind, InterfaceClass, NotifyAck, Vport, VportCommand};
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// Port id of the kernel on the multicast channel
const KERNEL_PORTID: u32 = 0;

/// Translates device events into port table changes and notifications
pub struct DeviceEventDispatcher {
    registry: Arc<dyn VportRegistry>,
    builder: Arc<dyn NotificationBuilder>,
    publisher: Arc<dyn MulticastPublisher>,
    sysfs: Arc<dyn PortSysfs>,
    group: MulticastGroup,
    metrics: Option<Arc<MetricsCollector>>,
}

impl DeviceEventDispatcher {
    pub fn new(
        registry: Arc<dyn VportRegistry>,
        builder: Arc<dyn NotificationBuilder>,
        publisher: Arc<dyn MulticastPublisher>,
        sysfs: Arc<dyn PortSysfs>,
        group: MulticastGroup,
    ) -> Self {
        Self {
            registry,
            builder,
            publisher,
            sysfs,
            group,
            metrics: None,
        }
    }

    /// Attach a metrics collector
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Multicast group notifications are sent to
    pub fn group(&self) -> &MulticastGroup {
        &self.group
    }

    /// Handle one device event
    #[instrument(skip_all, fields(event = event.kind.as_str(), ifindex = event.dev.ifindex()))]
    pub fn handle(&self, event: &DeviceEvent) -> NotifyAck {
        let _timer = self.metrics.as_ref().map(|m| m.start_event_latency());
        if let Some(metrics) = &self.metrics {
            metrics.record_event(event.kind.as_str());
        }

        let class = self.registry.classify(&event.dev);
        let Some(vport) = self.registry.resolve(&event.dev, class) else {
            trace!("Device is not a datapath port");
            if let Some(metrics) = &self.metrics {
                metrics.record_unmanaged();
            }
            return NotifyAck::Done;
        };

        match event.kind {
            DeviceEventKind::Unregister => match class {
                InterfaceClass::Attached => self.unregister(vport),
                // Internal devices go away through their vport's own deletion.
                InterfaceClass::Internal => {}
            },
            DeviceEventKind::ChangeName => self.rename(&vport),
            _ => {}
        }

        NotifyAck::Done
    }

    fn unregister(&self, vport: Arc<Vport>) {
        let port_no = vport.port_no();
        let notify = self.builder.build(&vport, 0, 0, VportCommand::Del);

        self.registry.detach(vport);
        if let Some(metrics) = &self.metrics {
            metrics.record_detach();
        }

        let msg = match notify {
            Ok(msg) => msg,
            Err(e) => {
                warn!(port_no, errno = e.errno(), error = %e, "Failed to build vport delete notification");
                if let Some(metrics) = &self.metrics {
                    metrics.record_build_failure();
                }
                self.publisher
                    .notify_error(KERNEL_PORTID, self.group.id, e.errno());
                return;
            }
        };

        match self.publisher.broadcast(msg, self.group.id) {
            Ok(listeners) => {
                debug!(port_no, listeners, group = %self.group.name, "Sent vport delete notification");
                if let Some(metrics) = &self.metrics {
                    metrics.record_notification_sent();
                }
            }
            Err(e) => {
                debug!(port_no, error = %e, "Vport delete notification dropped");
                if let Some(metrics) = &self.metrics {
                    metrics.record_notification_dropped();
                }
            }
        }
    }

    fn rename(&self, vport: &Vport) {
        if vport.is_local() {
            return;
        }

        self.sysfs.remove_entry(vport);
        match self.sysfs.add_entry(vport) {
            Ok(()) => {
                debug!(port_no = vport.port_no(), name = %vport.name(), "Resynced sysfs entry");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sysfs_resync();
                }
            }
            Err(e) => {
                warn!(port_no = vport.port_no(), error = %e, "Failed to re-add sysfs entry");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sysfs_failure();
                }
            }
        }
    }
}
