//! In-process bus
//!
//! Routes mount calls to handlers registered under bus names, holds spawn
//! handshake endpoints, and broadcasts tracker signals and ownership changes
//! to subscribers. The daemon's socket front end ([`super::socket`]) puts
//! every connected peer on this bus; the tests use it directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace};

use super::{
    Bus, CallError, MountCall, NameOwnerChanged, SignalEmitter, SpawnEndpoint, SpawnMessage,
    ERROR_SERVICE_UNKNOWN,
};
use crate::registry::TrackerSignal;

/// Capacity of the signal and ownership-change broadcast channels
const BROADCAST_CAPACITY: usize = 256;

/// Backend side of the Mount call
#[async_trait]
pub trait MountHandler: Send + Sync {
    async fn mount(&self, call: MountCall) -> Result<(), CallError>;
}

/// In-process message bus
pub struct LocalBus {
    unique_name: String,
    /// Bus name -> backend serving it
    backends: Mutex<HashMap<String, Arc<dyn MountHandler>>>,
    /// Exported spawn handshake endpoints
    spawners: DashMap<String, oneshot::Sender<SpawnMessage>>,
    signals: broadcast::Sender<TrackerSignal>,
    owner_changes: broadcast::Sender<NameOwnerChanged>,
    next_client: AtomicU64,
}

impl LocalBus {
    /// Create a bus on which the daemon is known as `unique_name`
    pub fn new(unique_name: impl Into<String>) -> Self {
        let (signals, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (owner_changes, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            unique_name: unique_name.into(),
            backends: Mutex::new(HashMap::new()),
            spawners: DashMap::new(),
            signals,
            owner_changes,
            next_client: AtomicU64::new(100),
        }
    }

    /// Hand out a fresh unique connection name
    pub fn connect(&self) -> String {
        format!(":1.{}", self.next_client.fetch_add(1, Ordering::Relaxed))
    }

    /// Serve mount calls addressed to `name` with `handler`
    pub fn own_name(&self, name: impl Into<String>, handler: Arc<dyn MountHandler>) {
        let name = name.into();
        debug!("{} now owned on the local bus", name);
        self.backends.lock().insert(name, handler);
    }

    /// Like [`own_name`](Self::own_name), but refuses a name someone already owns
    pub fn try_own_name(&self, name: &str, handler: Arc<dyn MountHandler>) -> bool {
        let mut backends = self.backends.lock();
        if backends.contains_key(name) {
            return false;
        }
        debug!("{} now owned on the local bus", name);
        backends.insert(name.to_string(), handler);
        true
    }

    /// Release `name`, held by the client `owner`, and announce that it has
    /// no owner anymore
    pub fn release_name(&self, name: &str, owner: &str) {
        let had_handler = self.backends.lock().remove(name).is_some();
        debug!("{} released by {} (served mounts: {})", name, owner, had_handler);
        let _ = self.owner_changes.send(NameOwnerChanged {
            name: name.to_string(),
            old_owner: owner.to_string(),
            new_owner: String::new(),
        });
    }

    /// Drop a client: release its unique name
    pub fn disconnect(&self, name: &str) {
        self.release_name(name, name);
    }

    /// Deliver a Spawned call to the endpoint at `path`.
    ///
    /// Only the first delivery is accepted; returns false when nothing is
    /// exported there anymore.
    pub fn deliver_spawned(&self, path: &str, message: SpawnMessage) -> bool {
        match self.spawners.remove(path) {
            Some((_, sender)) => sender.send(message).is_ok(),
            None => {
                debug!("Spawned call for unknown endpoint {}", path);
                false
            }
        }
    }

    pub fn has_spawner(&self, path: &str) -> bool {
        self.spawners.contains_key(path)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TrackerSignal> {
        self.signals.subscribe()
    }

    pub fn subscribe_owner_changes(&self) -> broadcast::Receiver<NameOwnerChanged> {
        self.owner_changes.subscribe()
    }
}

#[async_trait]
impl Bus for LocalBus {
    fn unique_name(&self) -> &str {
        &self.unique_name
    }

    async fn call_mount(&self, destination: &str, call: MountCall) -> Result<(), CallError> {
        let handler = self.backends.lock().get(destination).cloned();
        match handler {
            Some(handler) => handler.mount(call).await,
            None => Err(CallError::from_fault(
                ERROR_SERVICE_UNKNOWN,
                format!(
                    "The name {} was not provided by any .service files",
                    destination
                ),
            )),
        }
    }

    fn export_spawner(&self, path: &str) -> Result<SpawnEndpoint, CallError> {
        let (sender, receiver) = oneshot::channel();
        match self.spawners.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CallError::Remote {
                name: "org.freedesktop.DBus.Error.ObjectPathInUse".to_string(),
                message: format!("An object is already exported at {}", path),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(sender);
                Ok(SpawnEndpoint::new(path, receiver))
            }
        }
    }

    fn withdraw_spawner(&self, path: &str) {
        if self.spawners.remove(path).is_some() {
            trace!("Withdrew spawn endpoint {}", path);
        }
    }
}

impl SignalEmitter for LocalBus {
    fn emit(&self, signal: TrackerSignal) {
        if self.signals.send(signal).is_err() {
            trace!("No signal subscribers on the local bus");
        }
    }
}
