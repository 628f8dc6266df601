//! Control-plane multicast channel
//!
//! Listeners subscribe to a multicast group with their port id and receive
//! vport notifications or error indications on a bounded queue. Sending never
//! waits: a full queue loses the message for that listener only.

use crate::notification::Notification;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

/// Default multicast group name for vport notifications
pub const VPORT_GROUP_NAME: &str = "ovs_vport";

/// Default per-listener queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Named multicast group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MulticastGroup {
    pub id: u32,
    pub name: String,
}

impl MulticastGroup {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// Item received by a listener
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    Message(Notification),
    /// Negative errno signalled on the group
    Error(i32),
}

/// Broadcast could not reach any listener
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no listeners on multicast group {0}")]
    NoListeners(u32),

    #[error("all {dropped} listeners on multicast group {group} are congested")]
    Congested { group: u32, dropped: usize },
}

/// Outbound side of the multicast channel
///
/// Neither operation may block; callers run in contexts that cannot sleep.
pub trait MulticastPublisher: Send + Sync {
    /// Deliver `msg` to every listener of `group`. Returns the number of
    /// listeners reached.
    fn broadcast(&self, msg: Notification, group: u32) -> std::result::Result<usize, TransportError>;

    /// Signal `errno` to the listeners of `group`, except the one bound to
    /// `portid`. Port id 0 is the kernel, so every listener is told.
    fn notify_error(&self, portid: u32, group: u32, errno: i32);
}

#[derive(Debug)]
struct Member {
    portid: u32,
    tx: mpsc::Sender<Delivery>,
}

/// Listener handle returned by [`MulticastHub::subscribe`]
#[derive(Debug)]
pub struct Subscription {
    portid: u32,
    group: u32,
    rx: mpsc::Receiver<Delivery>,
}

impl Subscription {
    pub fn portid(&self) -> u32 {
        self.portid
    }

    pub fn group(&self) -> u32 {
        self.group
    }

    /// Wait for the next delivery
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Take the next delivery if one is queued
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued so far
    pub fn drain(&mut self) -> Vec<Delivery> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// In-process multicast hub
#[derive(Debug)]
pub struct MulticastHub {
    queue_depth: usize,
    groups: RwLock<HashMap<u32, Vec<Member>>>,
}

impl MulticastHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Join `group` as listener `portid`
    pub fn subscribe(&self, group: u32, portid: u32) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.groups
            .write()
            .entry(group)
            .or_default()
            .push(Member { portid, tx });
        debug!(group, portid, "Listener joined multicast group");
        Subscription { portid, group, rx }
    }

    /// Number of live listeners on `group`
    pub fn listener_count(&self, group: u32) -> usize {
        self.groups
            .read()
            .get(&group)
            .map(|members| members.iter().filter(|m| !m.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn prune(&self, group: u32) {
        let mut groups = self.groups.write();
        if let Some(members) = groups.get_mut(&group) {
            members.retain(|m| !m.tx.is_closed());
            if members.is_empty() {
                groups.remove(&group);
            }
        }
    }
}

impl Default for MulticastHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl MulticastPublisher for MulticastHub {
    fn broadcast(&self, msg: Notification, group: u32) -> std::result::Result<usize, TransportError> {
        let mut delivered = 0;
        let mut dropped = 0;
        let mut closed = false;

        {
            let groups = self.groups.read();
            for member in groups.get(&group).into_iter().flatten() {
                match member.tx.try_send(Delivery::Message(msg.clone())) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        trace!(group, portid = member.portid, "Listener queue full, message dropped");
                        dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => closed = true,
                }
            }
        }

        if closed {
            self.prune(group);
        }

        match (delivered, dropped) {
            (0, 0) => Err(TransportError::NoListeners(group)),
            (0, dropped) => Err(TransportError::Congested { group, dropped }),
            (delivered, _) => Ok(delivered),
        }
    }

    fn notify_error(&self, portid: u32, group: u32, errno: i32) {
        let mut closed = false;

        {
            let groups = self.groups.read();
            for member in groups.get(&group).into_iter().flatten() {
                if portid != 0 && member.portid == portid {
                    continue;
                }
                if let Err(TrySendError::Closed(_)) = member.tx.try_send(Delivery::Error(errno)) {
                    closed = true;
                }
            }
        }

        if closed {
            self.prune(group);
        }
        debug!(group, portid, errno, "Signalled error on multicast group");
    }
}
