//! Bus abstractions used by the tracker
//!
//! The tracker never marshals messages itself. It talks to backends through
//! the [`Bus`] trait (mount calls and spawn handshake endpoints) and announces
//! registry changes through [`SignalEmitter`]. [`local::LocalBus`] is an
//! in-process implementation of both, and [`socket::SocketServer`] puts peers
//! on the other end of a Unix socket onto it.

pub mod frame;
pub mod local;
pub mod socket;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::registry::TrackerSignal;
use crate::source::MountSource;
use crate::spec::MountSpec;

/// Fault name for a call to a name nobody owns
pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

/// Fault name for a call to a name that cannot be activated
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";

/// Fault name for a call whose connection went away before the reply
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";

/// Generic failure, used when a backend gives no more specific fault
pub const ERROR_FAILED: &str = "org.gtk.GDBus.Error.Failed";

/// Object path prefix of spawn handshake endpoints
pub const SPAWNER_PATH_PREFIX: &str = "/org/gtk/gvfs/exec_spaw";

/// Failure of a call made over the bus
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    /// Nobody owns the destination name
    #[error("{message}")]
    NoOwner { name: String, message: String },

    /// The remote side replied with a fault
    #[error("{name}: {message}")]
    Remote { name: String, message: String },

    #[error("Connection is closed: {0}")]
    Disconnected(String),
}

impl CallError {
    /// Classify a fault reply by name
    pub fn from_fault(name: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match name {
            ERROR_NAME_HAS_NO_OWNER | ERROR_SERVICE_UNKNOWN => CallError::NoOwner {
                name: name.to_string(),
                message,
            },
            _ => CallError::Remote {
                name: name.to_string(),
                message,
            },
        }
    }

    pub fn is_no_owner(&self) -> bool {
        matches!(self, CallError::NoOwner { .. })
    }

    /// Fault name this error travels under
    pub fn fault_name(&self) -> &str {
        match self {
            CallError::NoOwner { name, .. } | CallError::Remote { name, .. } => name,
            CallError::Disconnected(_) => ERROR_DISCONNECTED,
        }
    }
}

/// Payload of the Mount call sent to a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCall {
    pub spec: MountSpec,
    pub automount: bool,
    pub source: MountSource,
}

/// Acknowledgment sent by a freshly launched backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnAck {
    /// Unique name the backend sent the acknowledgment from
    pub sender: String,
    pub succeeded: bool,
    pub message: String,
}

/// What can arrive on a spawn handshake endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnMessage {
    Spawned(SpawnAck),
    /// A Spawned call whose arguments could not be decoded
    InvalidArgs { sender: String },
}

/// Single-use endpoint a launched backend reports back to
#[derive(Debug)]
pub struct SpawnEndpoint {
    path: String,
    receiver: oneshot::Receiver<SpawnMessage>,
}

impl SpawnEndpoint {
    pub fn new(path: impl Into<String>, receiver: oneshot::Receiver<SpawnMessage>) -> Self {
        Self {
            path: path.into(),
            receiver,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the one message this endpoint accepts
    pub async fn recv(&mut self) -> Result<SpawnMessage, CallError> {
        (&mut self.receiver)
            .await
            .map_err(|_| CallError::Disconnected(format!("spawn endpoint {} withdrawn", self.path)))
    }
}

/// Ownership change notification from the bus daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameOwnerChanged {
    pub name: String,
    pub old_owner: String,
    pub new_owner: String,
}

impl NameOwnerChanged {
    /// The unique name that just left the bus, if this notification reports one
    pub fn vanished_client(&self) -> Option<&str> {
        if self.name.starts_with(':') && self.new_owner.is_empty() {
            Some(&self.name)
        } else {
            None
        }
    }
}

/// Outbound side of the bus as seen by mount sessions
#[async_trait]
pub trait Bus: Send + Sync {
    /// This daemon's unique connection name
    fn unique_name(&self) -> &str;

    /// Ask the backend at `destination` to mount
    async fn call_mount(&self, destination: &str, call: MountCall) -> Result<(), CallError>;

    /// Export a spawn handshake endpoint at `path`
    fn export_spawner(&self, path: &str) -> Result<SpawnEndpoint, CallError>;

    /// Tear down the endpoint at `path`; a no-op if already gone
    fn withdraw_spawner(&self, path: &str);
}

/// Fire-and-forget signal delivery
pub trait SignalEmitter: Send + Sync {
    fn emit(&self, signal: TrackerSignal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_owner_faults() {
        assert!(CallError::from_fault(ERROR_SERVICE_UNKNOWN, "gone").is_no_owner());
        assert!(CallError::from_fault(ERROR_NAME_HAS_NO_OWNER, "gone").is_no_owner());
        assert!(!CallError::from_fault(ERROR_FAILED, "boom").is_no_owner());
    }

    #[test]
    fn test_fault_name_survives_classification() {
        let gone = CallError::from_fault(ERROR_NAME_HAS_NO_OWNER, "gone");
        assert_eq!(gone.fault_name(), ERROR_NAME_HAS_NO_OWNER);

        let handled = CallError::from_fault("org.gtk.GDBus.Error.FailedHandled", "cancelled");
        assert_eq!(handled.fault_name(), "org.gtk.GDBus.Error.FailedHandled");
        assert_eq!(handled.to_string(), "org.gtk.GDBus.Error.FailedHandled: cancelled");
    }

    #[test]
    fn test_vanished_client() {
        let left = NameOwnerChanged {
            name: ":1.40".to_string(),
            old_owner: ":1.40".to_string(),
            new_owner: String::new(),
        };
        assert_eq!(left.vanished_client(), Some(":1.40"));

        let well_known = NameOwnerChanged {
            name: "org.gtk.vfs.mountpoint_sftp".to_string(),
            old_owner: ":1.40".to_string(),
            new_owner: String::new(),
        };
        assert_eq!(well_known.vanished_client(), None);

        let arrived = NameOwnerChanged {
            name: ":1.41".to_string(),
            old_owner: String::new(),
            new_owner: ":1.41".to_string(),
        };
        assert_eq!(arrived.vanished_client(), None);
    }
}
