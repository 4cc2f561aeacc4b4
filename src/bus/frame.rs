//! Frames exchanged over the bus socket
//!
//! One JSON document per line. Peers send [`PeerFrame`]s and the daemon
//! answers with [`DaemonFrame`]s. Every frame that expects an answer carries a
//! `serial` chosen by its sender, and the answer echoes it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::CallError;
use crate::error::TrackerError;
use crate::registry::TrackerSignal;
use crate::source::RawMountSource;
use crate::spec::RawMountSpec;
use crate::tracker::{TrackerOp, TrackerReply};

/// Fault name for a frame whose arguments could not be decoded
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";

/// Fault name for a RequestName on a name someone else owns
pub const ERROR_NAME_TAKEN: &str = "org.freedesktop.DBus.Error.AddressInUse";

/// Fault name for a Spawned call to an endpoint nobody is waiting on
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";

/// Error reply, named the way bus faults are
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub name: String,
    pub message: String,
}

impl Fault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl From<&TrackerError> for Fault {
    fn from(err: &TrackerError) -> Self {
        Fault::new(err.fault_name(), err.to_string())
    }
}

impl From<Fault> for CallError {
    fn from(fault: Fault) -> Self {
        CallError::from_fault(&fault.name, fault.message)
    }
}

/// Frames a peer sends to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerFrame {
    /// Call into the MountTracker interface
    Call { serial: u64, op: TrackerOp },
    /// Claim a well-known name, so mount calls addressed to it reach this peer
    RequestName { serial: u64, name: String },
    /// Spawn handshake acknowledgment for the endpoint at `path`
    Spawned {
        serial: u64,
        path: String,
        succeeded: bool,
        message: String,
    },
    /// Answer to a [`DaemonFrame::Mount`]
    MountReply {
        serial: u64,
        #[serde(default)]
        fault: Option<Fault>,
    },
}

/// Frames the daemon sends to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonFrame {
    /// First frame on every connection
    Welcome {
        /// Name the peer is known by on the bus
        unique_name: String,
        /// Name of the daemon, as passed to spawned backends
        daemon_name: String,
    },
    /// Answer to a Call, RequestName or Spawned frame
    Reply {
        serial: u64,
        #[serde(default)]
        reply: Option<TrackerReply>,
        #[serde(default)]
        fault: Option<Fault>,
    },
    /// Mount call to a backend
    Mount {
        serial: u64,
        spec: RawMountSpec,
        automount: bool,
        source: RawMountSource,
    },
    /// Tracker signal, sent to every peer
    Signal { signal: TrackerSignal },
}

impl DaemonFrame {
    /// Reply frame for the outcome of a tracker call
    pub fn reply(serial: u64, result: crate::Result<TrackerReply>) -> Self {
        match result {
            Ok(reply) => DaemonFrame::Reply {
                serial,
                reply: Some(reply),
                fault: None,
            },
            Err(e) => DaemonFrame::Reply {
                serial,
                reply: None,
                fault: Some(Fault::from(&e)),
            },
        }
    }

    /// Empty reply, or a fault
    pub fn ack(serial: u64, fault: Option<Fault>) -> Self {
        DaemonFrame::Reply {
            serial,
            reply: None,
            fault,
        }
    }
}

/// Result of reading one line from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(PeerFrame),
    /// The line is not a valid frame
    Malformed {
        /// Serial to answer with a fault, if the line carried one
        serial: Option<u64>,
        /// Endpoint a broken Spawned frame was addressed to
        spawn_path: Option<String>,
        reason: String,
    },
}

/// Decode one line received from a peer
pub fn decode_peer(line: &str) -> Decoded {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            return Decoded::Malformed {
                serial: None,
                spawn_path: None,
                reason: e.to_string(),
            }
        }
    };

    let serial = value.get("serial").and_then(Value::as_u64);
    let spawn_path = match value.get("type").and_then(Value::as_str) {
        Some("spawned") => value.get("path").and_then(Value::as_str).map(str::to_string),
        _ => None,
    };

    match serde_json::from_value(value) {
        Ok(frame) => Decoded::Frame(frame),
        Err(e) => Decoded::Malformed {
            serial,
            spawn_path,
            reason: e.to_string(),
        },
    }
}

/// Encode a frame as one line, newline included
pub fn encode<T: Serialize>(frame: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}
