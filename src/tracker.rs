//! The MountTracker service
//!
//! A single task owns the registry and handles, one at a time, inbound
//! calls, bus ownership changes, and the completions of the mount sessions it
//! started. Sessions themselves run as separate tasks; they never touch the
//! registry, they only report back.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::automount::AutomountCoordinator;
use crate::bus::{NameOwnerChanged, SignalEmitter};
use crate::catalog::MountableCatalog;
use crate::error::{Result, TrackerError};
use crate::registry::{MountRecord, MountRegistration, MountRegistry};
use crate::session::{MountOutcome, MountSession, SessionFactory};
use crate::source::MountSource;
use crate::spec::{MountSpec, RawMountSpec};

/// Operations of the MountTracker interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerOp {
    RegisterMount(MountRegistration),
    LookupMount {
        spec: RawMountSpec,
    },
    ListMounts,
    MountLocation {
        spec: RawMountSpec,
        /// Requester's bus identity, for credential prompts
        requester_id: String,
        /// Requester's mount operation object
        requester_path: String,
    },
}

impl TrackerOp {
    pub fn name(&self) -> &'static str {
        match self {
            TrackerOp::RegisterMount(_) => "RegisterMount",
            TrackerOp::LookupMount { .. } => "LookupMount",
            TrackerOp::ListMounts => "ListMounts",
            TrackerOp::MountLocation { .. } => "MountLocation",
        }
    }
}

/// Successful replies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackerReply {
    Registered,
    Mount(MountRecord),
    Mounts(Vec<MountRecord>),
    Mounted,
}

type Responder = oneshot::Sender<Result<TrackerReply>>;

/// A reply owed once a session finishes
enum PendingReply {
    Lookup { spec: MountSpec, reply: Responder },
    MountLocation { reply: Responder },
}

enum TrackerEvent {
    Call {
        sender: String,
        op: TrackerOp,
        reply: Responder,
    },
    OwnerChanged(NameOwnerChanged),
    SessionFinished {
        outcome: MountOutcome,
        pending: PendingReply,
    },
    Shutdown,
}

/// Owner of the mount registry and dispatcher of tracker operations
pub struct MountTracker {
    registry: MountRegistry,
    catalog: Arc<MountableCatalog>,
    automount: AutomountCoordinator,
    sessions: SessionFactory,
    events: mpsc::UnboundedSender<TrackerEvent>,
    inbox: mpsc::UnboundedReceiver<TrackerEvent>,
}

impl MountTracker {
    pub fn new(
        catalog: Arc<MountableCatalog>,
        signals: Arc<dyn SignalEmitter>,
        sessions: SessionFactory,
    ) -> Self {
        let (events, inbox) = mpsc::unbounded_channel();
        Self {
            registry: MountRegistry::new(signals),
            automount: AutomountCoordinator::new(catalog.clone(), sessions.clone()),
            catalog,
            sessions,
            events,
            inbox,
        }
    }

    pub fn handle(&self) -> TrackerHandle {
        TrackerHandle {
            events: self.events.clone(),
        }
    }

    /// Process events until shut down
    pub async fn run(mut self) {
        info!("Mount tracker running");
        while let Some(event) = self.inbox.recv().await {
            match event {
                TrackerEvent::Call { sender, op, reply } => self.dispatch(&sender, op, reply),
                TrackerEvent::OwnerChanged(change) => self.owner_changed(&change),
                TrackerEvent::SessionFinished { outcome, pending } => {
                    self.session_finished(outcome, pending)
                }
                TrackerEvent::Shutdown => break,
            }
        }
        info!(
            "Mount tracker stopped with {} active mount(s)",
            self.registry.len()
        );
    }

    fn dispatch(&mut self, sender: &str, op: TrackerOp, reply: Responder) {
        debug!("{} from {}", op.name(), sender);
        match op {
            TrackerOp::RegisterMount(registration) => {
                let result = self
                    .registry
                    .register(sender, registration)
                    .map(|_| TrackerReply::Registered);
                respond(reply, result);
            }
            TrackerOp::LookupMount { spec } => self.lookup_mount(spec, reply),
            TrackerOp::ListMounts => {
                let records = self.registry.list().iter().map(|m| m.to_record()).collect();
                respond(reply, Ok(TrackerReply::Mounts(records)));
            }
            TrackerOp::MountLocation {
                spec,
                requester_id,
                requester_path,
            } => self.mount_location(spec, requester_id, requester_path, reply),
        }
    }

    fn lookup_mount(&mut self, spec: RawMountSpec, reply: Responder) {
        let Some(spec) = MountSpec::from_wire(spec) else {
            respond(reply, Err(invalid_arguments()));
            return;
        };

        if let Some(mount) = self.registry.find_matching(&spec) {
            respond(reply, Ok(TrackerReply::Mount(mount.to_record())));
            return;
        }

        match self.automount.begin(&spec, true) {
            Ok(session) => self.start_session(session, PendingReply::Lookup { spec, reply }),
            Err(e) => respond(reply, Err(e)),
        }
    }

    fn mount_location(
        &mut self,
        spec: RawMountSpec,
        requester_id: String,
        requester_path: String,
        reply: Responder,
    ) {
        let Some(spec) = MountSpec::from_wire(spec) else {
            respond(reply, Err(invalid_arguments()));
            return;
        };

        if self.registry.find_matching(&spec).is_some() {
            respond(reply, Err(TrackerError::AlreadyMounted));
            return;
        }

        let Some(mountable) = self.catalog.lookup_for_spec(&spec) else {
            respond(reply, Err(TrackerError::NotMountable));
            return;
        };

        let source = MountSource::interactive(requester_id, requester_path);
        let session = self.sessions.session(Some(mountable), spec, source, false);
        self.start_session(session, PendingReply::MountLocation { reply });
    }

    fn start_session(&self, session: MountSession, pending: PendingReply) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let outcome = session.run().await;
            if events
                .send(TrackerEvent::SessionFinished { outcome, pending })
                .is_err()
            {
                debug!("Mount session finished after tracker shutdown");
            }
        });
    }

    fn session_finished(&mut self, outcome: MountOutcome, pending: PendingReply) {
        if let Err(e) = &outcome.result {
            let kind = outcome.mountable.as_ref().map_or("<unknown>", |m| m.kind.as_str());
            warn!(
                "Mounting {} failed after {} spawn(s): {}",
                kind,
                outcome.spawn_count(),
                e
            );
        }
        match pending {
            PendingReply::Lookup { spec, reply } => {
                let result = self
                    .automount
                    .finish(&self.registry, &spec, &outcome)
                    .map(|mount| TrackerReply::Mount(mount.to_record()));
                respond(reply, result);
            }
            PendingReply::MountLocation { reply } => {
                respond(reply, outcome.result.map(|()| TrackerReply::Mounted));
            }
        }
    }

    fn owner_changed(&mut self, change: &NameOwnerChanged) {
        if let Some(client) = change.vanished_client() {
            let removed = self.registry.remove_all_for(client);
            if !removed.is_empty() {
                info!("{} left the bus, dropped {} mount(s)", client, removed.len());
            }
        }
    }
}

fn invalid_arguments() -> TrackerError {
    TrackerError::InvalidArguments("Invalid arguments".to_string())
}

fn respond(reply: Responder, result: Result<TrackerReply>) {
    if let Err(e) = &result {
        debug!("Replying with fault {}: {}", e.fault_name(), e);
    }
    if reply.send(result).is_err() {
        debug!("Caller went away before its reply");
    }
}

/// Cloneable entry point to a running tracker
#[derive(Clone)]
pub struct TrackerHandle {
    events: mpsc::UnboundedSender<TrackerEvent>,
}

impl TrackerHandle {
    /// Queue `op` on behalf of the bus client `sender`.
    ///
    /// Calls are handled in the order they are submitted; the returned
    /// receiver yields the reply.
    pub fn submit(
        &self,
        sender: impl Into<String>,
        op: TrackerOp,
    ) -> Result<oneshot::Receiver<Result<TrackerReply>>> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(TrackerEvent::Call {
                sender: sender.into(),
                op,
                reply,
            })
            .map_err(|_| stopped())?;
        Ok(response)
    }

    /// Send `op` on behalf of the bus client `sender` and wait for the reply
    pub async fn call(&self, sender: impl Into<String>, op: TrackerOp) -> Result<TrackerReply> {
        self.submit(sender, op)?.await.map_err(|_| stopped())?
    }

    pub async fn register_mount(
        &self,
        sender: impl Into<String>,
        registration: MountRegistration,
    ) -> Result<()> {
        match self.call(sender, TrackerOp::RegisterMount(registration)).await? {
            TrackerReply::Registered => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn lookup_mount(
        &self,
        sender: impl Into<String>,
        spec: RawMountSpec,
    ) -> Result<MountRecord> {
        match self.call(sender, TrackerOp::LookupMount { spec }).await? {
            TrackerReply::Mount(record) => Ok(record),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list_mounts(&self, sender: impl Into<String>) -> Result<Vec<MountRecord>> {
        match self.call(sender, TrackerOp::ListMounts).await? {
            TrackerReply::Mounts(records) => Ok(records),
            other => Err(unexpected(other)),
        }
    }

    pub async fn mount_location(
        &self,
        sender: impl Into<String>,
        spec: RawMountSpec,
        requester_path: impl Into<String>,
    ) -> Result<()> {
        let sender = sender.into();
        let op = TrackerOp::MountLocation {
            spec,
            requester_id: sender.clone(),
            requester_path: requester_path.into(),
        };
        match self.call(sender, op).await? {
            TrackerReply::Mounted => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Report a bus ownership change
    pub fn name_owner_changed(&self, change: NameOwnerChanged) {
        if self.events.send(TrackerEvent::OwnerChanged(change)).is_err() {
            debug!("Ownership change after tracker shutdown");
        }
    }

    /// Feed ownership changes from a bus subscription until it closes
    pub async fn follow_owner_changes(self, mut changes: broadcast::Receiver<NameOwnerChanged>) {
        loop {
            match changes.recv().await {
                Ok(change) => self.name_owner_changed(change),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} ownership change notification(s)", missed)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.events.send(TrackerEvent::Shutdown);
    }
}

pub(crate) fn stopped() -> TrackerError {
    TrackerError::Transport("mount tracker is not running".to_string())
}

fn unexpected(reply: TrackerReply) -> TrackerError {
    TrackerError::Transport(format!("unexpected reply {:?}", reply))
}
