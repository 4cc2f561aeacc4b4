//! Automount on lookup miss
//!
//! When a lookup finds no active mount, the coordinator decides whether to
//! mount the location on the caller's behalf. Automount sessions never
//! prompt: they carry a silent credential source.

use std::sync::Arc;

use tracing::info;

use crate::catalog::MountableCatalog;
use crate::error::{Result, TrackerError};
use crate::registry::{ActiveMount, MountRegistry};
use crate::session::{MountOutcome, MountSession, SessionFactory};
use crate::source::MountSource;
use crate::spec::MountSpec;

pub struct AutomountCoordinator {
    catalog: Arc<MountableCatalog>,
    sessions: SessionFactory,
}

impl AutomountCoordinator {
    pub fn new(catalog: Arc<MountableCatalog>, sessions: SessionFactory) -> Self {
        Self { catalog, sessions }
    }

    /// Session to run for an unmatched `spec`, or the fault to reply with.
    ///
    /// `requested` is whether the caller allows automounting at all.
    pub fn begin(&self, spec: &MountSpec, requested: bool) -> Result<MountSession> {
        let mountable = self
            .catalog
            .lookup_for_spec(spec)
            .ok_or(TrackerError::NotMountable)?;

        if !requested || !mountable.automount {
            return Err(TrackerError::not_mounted());
        }

        info!("Automounting {:?}", spec.kind());
        Ok(self
            .sessions
            .session(Some(mountable), spec.clone(), MountSource::silent(), true))
    }

    /// Turn a finished automount session into the lookup reply
    pub fn finish(
        &self,
        registry: &MountRegistry,
        spec: &MountSpec,
        outcome: &MountOutcome,
    ) -> Result<ActiveMount> {
        if let Err(e) = &outcome.result {
            return Err(TrackerError::automount_failed(e));
        }

        registry
            .find_matching(spec)
            .cloned()
            .ok_or_else(TrackerError::not_mounted)
    }
}
