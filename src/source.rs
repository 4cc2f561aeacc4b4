//! Credential sources handed to backends in the mount call
//!
//! An interactive source points the backend at the requester's mount
//! operation object so it can ask for passwords and the like. Automount uses
//! the silent variant, which tells the backend nobody is there to answer.

use serde::{Deserialize, Serialize};

/// Where a backend should send interactive mount questions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSource {
    Interactive {
        /// Bus identity of the requester
        dbus_id: String,
        /// Requester's mount operation object
        obj_path: String,
    },
    Silent,
}

/// Wire form of a credential source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMountSource {
    pub dbus_id: String,
    pub obj_path: String,
}

impl MountSource {
    pub fn interactive(dbus_id: impl Into<String>, obj_path: impl Into<String>) -> Self {
        MountSource::Interactive {
            dbus_id: dbus_id.into(),
            obj_path: obj_path.into(),
        }
    }

    pub fn silent() -> Self {
        MountSource::Silent
    }

    pub fn is_interactive(&self) -> bool {
        matches!(self, MountSource::Interactive { .. })
    }

    pub fn to_wire(&self) -> RawMountSource {
        match self {
            MountSource::Interactive { dbus_id, obj_path } => RawMountSource {
                dbus_id: dbus_id.clone(),
                obj_path: obj_path.clone(),
            },
            MountSource::Silent => RawMountSource {
                dbus_id: String::new(),
                obj_path: "/".to_string(),
            },
        }
    }

    pub fn from_wire(raw: RawMountSource) -> Self {
        if raw.dbus_id.is_empty() {
            MountSource::Silent
        } else {
            MountSource::Interactive {
                dbus_id: raw.dbus_id,
                obj_path: raw.obj_path,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_silent_source_has_no_requester() {
        let raw = MountSource::silent().to_wire();
        assert_eq!(raw.dbus_id, "");
        assert_eq!(MountSource::from_wire(raw), MountSource::Silent);
    }

    #[test]
    fn test_interactive_source_wire_form() {
        let source = MountSource::interactive(":1.12", "/org/gtk/mount/op/3");
        assert!(source.is_interactive());
        let raw = source.to_wire();
        assert_eq!(raw.obj_path, "/org/gtk/mount/op/3");
        assert_eq!(MountSource::from_wire(raw), source);
    }
}
