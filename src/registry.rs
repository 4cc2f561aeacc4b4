//! Registry of active mounts
//!
//! Each active mount is served by the bus client that registered it. The
//! registry keeps them newest-first, refuses duplicates (by identity or by
//! matching spec), and drops everything a client owned once it leaves the bus.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::SignalEmitter;
use crate::error::{Result, TrackerError};
use crate::spec::{MountSpec, RawMountSpec};

/// A mount registered by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMount {
    pub display_name: String,
    pub icon: String,
    pub preferred_filename_encoding: String,
    /// Bus identity of the registering client
    pub owner_id: String,
    /// Client-local object identifying the mount
    pub object_path: String,
    pub spec: MountSpec,
}

impl ActiveMount {
    pub fn to_record(&self) -> MountRecord {
        MountRecord {
            display_name: self.display_name.clone(),
            icon: self.icon.clone(),
            preferred_filename_encoding: self.preferred_filename_encoding.clone(),
            owner_id: self.owner_id.clone(),
            object_path: self.object_path.clone(),
            spec: self.spec.to_wire(),
        }
    }

    fn has_identity(&self, owner_id: &str, object_path: &str) -> bool {
        self.owner_id == owner_id && self.object_path == object_path
    }
}

/// Wire form of an active mount, as sent in replies and signals
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub display_name: String,
    pub icon: String,
    pub preferred_filename_encoding: String,
    pub owner_id: String,
    pub object_path: String,
    pub spec: RawMountSpec,
}

/// Arguments of a RegisterMount call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRegistration {
    pub display_name: String,
    pub icon: String,
    pub preferred_filename_encoding: String,
    pub object_path: String,
    pub spec: RawMountSpec,
}

/// Signals emitted on registry changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerSignal {
    Mounted(MountRecord),
    Unmounted(MountRecord),
}

/// Authoritative set of active mounts
pub struct MountRegistry {
    /// Newest first
    mounts: VecDeque<ActiveMount>,
    signals: Arc<dyn SignalEmitter>,
}

impl MountRegistry {
    pub fn new(signals: Arc<dyn SignalEmitter>) -> Self {
        Self {
            mounts: VecDeque::new(),
            signals,
        }
    }

    /// Register a mount for `owner_id`.
    ///
    /// Fails with `AlreadyRegistered` if the identity exists or an existing
    /// mount's spec matches, and with `InvalidSpec` if the spec is malformed.
    pub fn register(
        &mut self,
        owner_id: &str,
        registration: MountRegistration,
    ) -> Result<ActiveMount> {
        let MountRegistration {
            display_name,
            icon,
            preferred_filename_encoding,
            object_path,
            spec,
        } = registration;

        if self.find_by_identity(owner_id, &object_path).is_some() {
            return Err(TrackerError::AlreadyRegistered);
        }

        let spec = MountSpec::from_wire(spec).ok_or(TrackerError::InvalidSpec)?;

        if self.find_matching(&spec).is_some() {
            return Err(TrackerError::AlreadyRegistered);
        }

        let mount = ActiveMount {
            display_name,
            icon,
            preferred_filename_encoding,
            owner_id: owner_id.to_string(),
            object_path,
            spec,
        };

        info!(
            "Registered mount {:?} ({}{})",
            mount.display_name, mount.owner_id, mount.object_path
        );

        self.mounts.push_front(mount.clone());
        self.signals.emit(TrackerSignal::Mounted(mount.to_record()));

        Ok(mount)
    }

    /// Newest mount whose spec matches `spec`
    pub fn find_matching(&self, spec: &MountSpec) -> Option<&ActiveMount> {
        self.mounts.iter().find(|m| m.spec.matches(spec))
    }

    pub fn find_by_identity(&self, owner_id: &str, object_path: &str) -> Option<&ActiveMount> {
        self.mounts
            .iter()
            .find(|m| m.has_identity(owner_id, object_path))
    }

    /// Snapshot of every active mount, newest first
    pub fn list(&self) -> Vec<ActiveMount> {
        self.mounts.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    /// Drop every mount owned by `owner_id`, emitting `Unmounted` for each.
    ///
    /// Returns the removed mounts in removal order.
    pub fn remove_all_for(&mut self, owner_id: &str) -> Vec<ActiveMount> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.mounts.len());

        for mount in self.mounts.drain(..) {
            if mount.owner_id == owner_id {
                removed.push(mount);
            } else {
                kept.push_back(mount);
            }
        }
        self.mounts = kept;

        for mount in &removed {
            info!(
                "Removing mount {:?} ({}{}): owner left the bus",
                mount.display_name, mount.owner_id, mount.object_path
            );
            self.signals.emit(TrackerSignal::Unmounted(mount.to_record()));
        }

        removed
    }
}
