//! Kernel link events as device events
//!
//! [`LinkTracker`] keeps an ifindex -> device cache and turns RTM_NEWLINK /
//! RTM_DELLINK notifications into [`DeviceEvent`]s:
//!
//! - RTM_DELLINK of a known device: `Unregister`
//! - RTM_NEWLINK with a new name for a known ifindex: `ChangeName`, after the
//!   cached device has been renamed
//! - RTM_NEWLINK for an unknown ifindex: `Register`
//! - anything else: `Other(RTM_NEWLINK)`
//!
//! Counters carried in RTM_NEWLINK (IFLA_STATS64) are copied onto the cached
//! device, so notifications report the kernel's totals.
//!
//! On Linux, [`LinkMonitor`] feeds the tracker from an rtnetlink socket bound
//! to the link multicast group.

use crate::types::{DeviceEvent, DeviceEventKind, NetDevice, VportStatsSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// RTM_NEWLINK message type
pub const RTM_NEWLINK: u32 = 16;

/// Link notification decoded from rtnetlink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkChange {
    New {
        ifindex: u32,
        name: String,
        stats: Option<VportStatsSnapshot>,
    },
    Del {
        ifindex: u32,
    },
}

/// Translates link notifications into device events
#[derive(Debug, Default)]
pub struct LinkTracker {
    devices: HashMap<u32, Arc<NetDevice>>,
}

impl LinkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached device for `ifindex`
    pub fn device(&self, ifindex: u32) -> Option<Arc<NetDevice>> {
        self.devices.get(&ifindex).cloned()
    }

    /// Number of known devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Apply one link notification
    pub fn apply(&mut self, change: LinkChange) -> Option<DeviceEvent> {
        match change {
            LinkChange::New {
                ifindex,
                name,
                stats,
            } => {
                let (kind, dev) = match self.devices.get(&ifindex) {
                    Some(dev) if dev.name() != name => {
                        let old = dev.set_name(name);
                        debug!(ifindex, old = %old, new = %dev.name(), "Interface renamed");
                        (DeviceEventKind::ChangeName, dev.clone())
                    }
                    Some(dev) => (DeviceEventKind::Other(RTM_NEWLINK), dev.clone()),
                    None => {
                        let dev = NetDevice::new(ifindex, name);
                        self.devices.insert(ifindex, dev.clone());
                        (DeviceEventKind::Register, dev)
                    }
                };
                if let Some(stats) = stats {
                    dev.stats().update(stats);
                }
                Some(DeviceEvent::new(kind, dev))
            }
            LinkChange::Del { ifindex } => {
                let dev = self.devices.remove(&ifindex)?;
                debug!(ifindex, name = %dev.name(), "Interface unregistered");
                Some(DeviceEvent::new(DeviceEventKind::Unregister, dev))
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{LinkChange, LinkTracker};
    use crate::error::{Result, VportsyncError};
    use crate::types::{DeviceEvent, VportStatsSnapshot};
    use netlink_packet_core::{
        NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload,
    };
    use netlink_packet_route::RouteNetlinkMessage;
    use netlink_packet_route::link::{LinkAttribute, LinkMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::io::ErrorKind;
    use std::os::fd::AsRawFd;
    use tracing::{debug, instrument, trace};

    /// Legacy multicast group mask for link notifications
    const RTMGRP_LINK: u32 = 1;

    /// Receive buffer capacity
    const RECV_BUFFER_SIZE: usize = 65536;

    /// Decode every link message in a netlink datagram
    pub fn parse_link_messages(buffer: &[u8]) -> Result<Vec<LinkChange>> {
        let mut changes = Vec::new();
        let mut offset = 0;

        while offset < buffer.len() {
            let msg = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buffer[offset..])
                .map_err(|e| VportsyncError::Netlink(format!("Failed to parse message: {}", e)))?;

            let length = msg.header.length as usize;
            if length == 0 {
                break;
            }
            // Netlink messages are 4-byte aligned
            offset = (offset + length + 3) & !3;

            match msg.payload {
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                    if let Some(name) = link_name(&link) {
                        changes.push(LinkChange::New {
                            ifindex: link.header.index,
                            name,
                            stats: link_stats(&link),
                        });
                    }
                }
                NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                    changes.push(LinkChange::Del {
                        ifindex: link.header.index,
                    });
                }
                _ => {}
            }
        }

        Ok(changes)
    }

    fn link_name(link: &LinkMessage) -> Option<String> {
        link.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::IfName(name) => Some(name.clone()),
            _ => None,
        })
    }

    fn link_stats(link: &LinkMessage) -> Option<VportStatsSnapshot> {
        link.attributes.iter().find_map(|attr| match attr {
            LinkAttribute::Stats64(stats) => Some(VportStatsSnapshot {
                rx_packets: stats.rx_packets,
                tx_packets: stats.tx_packets,
                rx_bytes: stats.rx_bytes,
                tx_bytes: stats.tx_bytes,
            }),
            _ => None,
        })
    }

    /// Rtnetlink socket subscribed to link notifications
    pub struct LinkMonitor {
        socket: Socket,
        buffer: Vec<u8>,
        tracker: LinkTracker,
    }

    impl LinkMonitor {
        /// Create, bind and switch the socket to non-blocking mode
        #[instrument]
        pub fn new() -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| VportsyncError::Netlink(format!("Failed to create socket: {}", e)))?;
            socket
                .bind(&SocketAddr::new(0, RTMGRP_LINK))
                .map_err(|e| VportsyncError::Netlink(format!("Failed to bind socket: {}", e)))?;
            socket
                .set_non_blocking(true)
                .map_err(|e| VportsyncError::Netlink(format!("Failed to set non-blocking: {}", e)))?;

            debug!("Netlink socket bound to RTMGRP_LINK");
            Ok(Self {
                socket,
                buffer: Vec::with_capacity(RECV_BUFFER_SIZE),
                tracker: LinkTracker::new(),
            })
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.socket.as_raw_fd()
        }

        pub fn tracker(&self) -> &LinkTracker {
            &self.tracker
        }

        /// Ask the kernel for every existing link
        #[instrument(skip(self))]
        pub fn request_dump(&mut self) -> Result<()> {
            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;

            let payload = RouteNetlinkMessage::GetLink(LinkMessage::default());
            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();

            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket.send(&buf, 0).map_err(|e| {
                VportsyncError::Netlink(format!("Failed to send dump request: {}", e))
            })?;
            debug!("Requested link dump");
            Ok(())
        }

        /// Receive pending link notifications.
        ///
        /// Returns Ok(None) when nothing is queued.
        pub fn try_receive_events(&mut self) -> Result<Option<Vec<DeviceEvent>>> {
            self.buffer.clear();
            match self.socket.recv(&mut self.buffer, 0) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) => {
                    return Err(VportsyncError::Netlink(format!("Failed to receive: {}", e)));
                }
            }

            let events: Vec<_> = parse_link_messages(&self.buffer)?
                .into_iter()
                .filter_map(|change| self.tracker.apply(change))
                .collect();
            trace!(count = events.len(), "Received link events");
            Ok(Some(events))
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux::{LinkMonitor, parse_link_messages};

#[cfg(test)]
mod tests {
    use super::*;

    fn new(ifindex: u32, name: &str) -> LinkChange {
        LinkChange::New {
            ifindex,
            name: name.to_string(),
            stats: None,
        }
    }

    #[test]
    fn test_first_sight_registers() {
        let mut tracker = LinkTracker::new();
        let event = tracker.apply(new(5, "eth5")).unwrap();
        assert_eq!(event.kind, DeviceEventKind::Register);
        assert_eq!(event.dev.name(), "eth5");
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_rename_updates_shared_device() {
        let mut tracker = LinkTracker::new();
        let registered = tracker.apply(new(5, "eth5")).unwrap().dev;

        let event = tracker.apply(new(5, "wan0")).unwrap();
        assert_eq!(event.kind, DeviceEventKind::ChangeName);
        assert!(Arc::ptr_eq(&event.dev, &registered));
        assert_eq!(registered.name(), "wan0");
    }

    #[test]
    fn test_same_name_is_other() {
        let mut tracker = LinkTracker::new();
        tracker.apply(new(5, "eth5"));
        let event = tracker.apply(new(5, "eth5")).unwrap();
        assert_eq!(event.kind, DeviceEventKind::Other(RTM_NEWLINK));
    }

    #[test]
    fn test_newlink_counters_reach_device() {
        let mut tracker = LinkTracker::new();
        let dev = tracker.apply(new(5, "eth5")).unwrap().dev;
        let totals = VportStatsSnapshot {
            rx_packets: 7,
            tx_packets: 2,
            rx_bytes: 700,
            tx_bytes: 128,
        };

        tracker.apply(LinkChange::New {
            ifindex: 5,
            name: "eth5".to_string(),
            stats: Some(totals),
        });
        assert_eq!(dev.stats().snapshot(), totals);

        // A message without counters leaves the last totals in place
        tracker.apply(new(5, "eth5"));
        assert_eq!(dev.stats().snapshot(), totals);
    }

    #[test]
    fn test_dellink_unregisters() {
        let mut tracker = LinkTracker::new();
        tracker.apply(new(5, "eth5"));
        let event = tracker.apply(LinkChange::Del { ifindex: 5 }).unwrap();
        assert_eq!(event.kind, DeviceEventKind::Unregister);
        assert_eq!(event.dev.ifindex(), 5);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_dellink_unknown_is_ignored() {
        let mut tracker = LinkTracker::new();
        assert!(tracker.apply(LinkChange::Del { ifindex: 9 }).is_none());
    }
}
