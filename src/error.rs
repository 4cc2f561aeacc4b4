use thiserror::Error;

use crate::bus::{CallError, ERROR_DISCONNECTED, ERROR_FAILED};

/// Message used when a lookup misses and no mount is attempted
pub const NOT_MOUNTED_MESSAGE: &str = "Location is not mounted";

/// Main error type for mount tracker operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackerError {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Mountpoint Already registered")]
    AlreadyRegistered,

    #[error("Error in mount spec")]
    InvalidSpec,

    #[error("Location is not mountable")]
    NotMountable,

    #[error("{0}")]
    NotMounted(String),

    #[error("Location is already mounted")]
    AlreadyMounted,

    #[error("No exec key defined for mountpoint")]
    SpawnConfigMissing,

    #[error("Failed to launch backend: {0}")]
    SpawnLaunchFailed(String),

    /// Fault passed through from a backend, under the backend's own name
    #[error("{message}")]
    BackendReportedFailure { name: String, message: String },

    #[error("Spawned backend did not acknowledge in time")]
    SpawnTimedOut,

    #[error("Transport error: {0}")]
    Transport(String),
}

impl TrackerError {
    /// Plain "not mounted" fault for a lookup miss
    pub fn not_mounted() -> Self {
        TrackerError::NotMounted(NOT_MOUNTED_MESSAGE.to_string())
    }

    /// "Not mounted" fault annotated with the reason an automount attempt failed
    pub fn automount_failed(cause: &TrackerError) -> Self {
        TrackerError::NotMounted(format!("Automount failed: {}", cause))
    }

    /// Backend failure without a more specific fault name
    pub fn backend_failed(message: impl Into<String>) -> Self {
        TrackerError::BackendReportedFailure {
            name: ERROR_FAILED.to_string(),
            message: message.into(),
        }
    }

    /// Bus fault name this error is replied with
    pub fn fault_name(&self) -> &str {
        match self {
            TrackerError::InvalidArguments(_) => "org.freedesktop.DBus.Error.InvalidArgs",
            TrackerError::AlreadyRegistered => "org.freedesktop.DBus.Error.InvalidArgs",
            TrackerError::InvalidSpec => "org.freedesktop.DBus.Error.InvalidArgs",
            TrackerError::NotMountable => "org.gtk.GDBus.Error.NotMounted",
            TrackerError::NotMounted(_) => "org.gtk.GDBus.Error.NotMounted",
            TrackerError::AlreadyMounted => "org.gtk.GDBus.Error.AlreadyMounted",
            TrackerError::SpawnConfigMissing => ERROR_FAILED,
            TrackerError::SpawnLaunchFailed(_) => ERROR_FAILED,
            TrackerError::BackendReportedFailure { name, .. } => name,
            TrackerError::SpawnTimedOut => "org.gtk.GDBus.Error.TimedOut",
            TrackerError::Transport(_) => ERROR_DISCONNECTED,
        }
    }
}

impl From<CallError> for TrackerError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::NoOwner { name, message } | CallError::Remote { name, message } => {
                TrackerError::BackendReportedFailure { name, message }
            }
            CallError::Disconnected(message) => TrackerError::Transport(message),
        }
    }
}

/// Result type alias for mount tracker operations
pub type Result<T> = std::result::Result<T, TrackerError>;
