//! Vport notification messages
//!
//! A notification describes a vport's state at build time: a header with the
//! command, sequence number, flags and owning datapath, and the port
//! attributes (number, type, name, upcall port id, counters).

use crate::types::{PortNo, Vport, VportCommand, VportKind, VportStatsSnapshot};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Default allocation limit for one notification (one page)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;

const ENOMEM: i32 = 12;
const EINVAL: i32 = 22;

/// Failure to build a notification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Message buffer could not be allocated
    #[error("cannot allocate {needed} byte notification (limit {limit})")]
    NoMemory { needed: usize, limit: usize },

    /// Vport state could not be encoded
    #[error("cannot encode notification: {0}")]
    Encode(String),
}

impl BuildError {
    /// Negative errno carried to listeners
    pub fn errno(&self) -> i32 {
        match self {
            BuildError::NoMemory { .. } => -ENOMEM,
            BuildError::Encode(_) => -EINVAL,
        }
    }
}

/// Serialized vport notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    command: VportCommand,
    seq: u32,
    port_no: PortNo,
    payload: Arc<[u8]>,
}

impl Notification {
    pub fn command(&self) -> VportCommand {
        self.command
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Port the message describes
    pub fn port_no(&self) -> PortNo {
        self.port_no
    }

    /// Encoded message body
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Builds vport notifications
pub trait NotificationBuilder: Send + Sync {
    /// Snapshot `vport` into a message for `cmd`
    fn build(
        &self,
        vport: &Vport,
        flags: u32,
        seq: u32,
        cmd: VportCommand,
    ) -> std::result::Result<Notification, BuildError>;
}

#[derive(Serialize)]
struct MessageHeader {
    cmd: u8,
    seq: u32,
    flags: u32,
    dp_ifindex: u32,
}

#[derive(Serialize)]
struct VportAttributes {
    port_no: PortNo,
    #[serde(rename = "type")]
    kind: VportKind,
    name: String,
    upcall_pid: u32,
    stats: VportStatsSnapshot,
}

#[derive(Serialize)]
struct VportMessage {
    header: MessageHeader,
    vport: VportAttributes,
}

/// JSON-encoded vport info builder with a per-message allocation limit
#[derive(Clone, Debug)]
pub struct VportInfoBuilder {
    max_message_size: usize,
}

impl VportInfoBuilder {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}

impl Default for VportInfoBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl NotificationBuilder for VportInfoBuilder {
    fn build(
        &self,
        vport: &Vport,
        flags: u32,
        seq: u32,
        cmd: VportCommand,
    ) -> std::result::Result<Notification, BuildError> {
        let message = VportMessage {
            header: MessageHeader {
                cmd: cmd.number(),
                seq,
                flags,
                dp_ifindex: vport.dp_ifindex(),
            },
            vport: VportAttributes {
                port_no: vport.port_no(),
                kind: vport.kind(),
                name: vport.name(),
                upcall_pid: vport.upcall_pid(),
                stats: vport.stats().snapshot(),
            },
        };

        let payload = serde_json::to_vec(&message).map_err(|e| BuildError::Encode(e.to_string()))?;
        if payload.len() > self.max_message_size {
            return Err(BuildError::NoMemory {
                needed: payload.len(),
                limit: self.max_message_size,
            });
        }

        Ok(Notification {
            command: cmd,
            seq,
            port_no: vport.port_no(),
            payload: payload.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetDevice;
    use serde_json::Value;

    fn vport() -> Vport {
        Vport::new(7, VportKind::Netdev, 2, 4242, NetDevice::new(17, "eth7"))
    }

    #[test]
    fn test_build_delete_message() {
        let vport = vport();
        vport.stats().update(VportStatsSnapshot {
            rx_packets: 1,
            rx_bytes: 64,
            ..Default::default()
        });

        let msg = VportInfoBuilder::default()
            .build(&vport, 0, 0, VportCommand::Del)
            .unwrap();
        assert_eq!(msg.command(), VportCommand::Del);
        assert_eq!(msg.port_no(), 7);
        assert_eq!(msg.seq(), 0);

        let body: Value = serde_json::from_slice(msg.payload()).unwrap();
        assert_eq!(body["header"]["cmd"], 2);
        assert_eq!(body["header"]["flags"], 0);
        assert_eq!(body["header"]["dp_ifindex"], 2);
        assert_eq!(body["vport"]["port_no"], 7);
        assert_eq!(body["vport"]["type"], "netdev");
        assert_eq!(body["vport"]["name"], "eth7");
        assert_eq!(body["vport"]["upcall_pid"], 4242);
        assert_eq!(body["vport"]["stats"]["rx_packets"], 1);
        assert_eq!(body["vport"]["stats"]["rx_bytes"], 64);
    }

    #[test]
    fn test_build_snapshots_current_name() {
        let vport = vport();
        vport.dev().set_name("uplink");
        let msg = VportInfoBuilder::default()
            .build(&vport, 0, 9, VportCommand::New)
            .unwrap();
        let body: Value = serde_json::from_slice(msg.payload()).unwrap();
        assert_eq!(body["vport"]["name"], "uplink");
        assert_eq!(body["header"]["seq"], 9);
    }

    #[test]
    fn test_build_over_limit_is_enomem() {
        let err = VportInfoBuilder::new(16)
            .build(&vport(), 0, 0, VportCommand::Del)
            .unwrap_err();
        assert!(matches!(err, BuildError::NoMemory { limit: 16, .. }));
        assert_eq!(err.errno(), -12);
    }

    #[test]
    fn test_encode_errno() {
        assert_eq!(BuildError::Encode("bad".to_string()).errno(), -22);
    }
}
