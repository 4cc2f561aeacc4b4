//! Mount establishment
//!
//! A [`MountSession`] gets one mount request to a backend. If the backend is
//! not on the bus it launches it, waits for its spawn acknowledgment, and
//! retries the mount call against the acknowledging sender exactly once:
//!
//! ```text
//! Init -> Connecting -> Done
//!              |
//!              +-- no owner, not yet spawned --> Spawning -> WaitingForSpawnAck
//!                                                               |
//!                            Connecting (spawned) <-- ack ok ---+-- nack --> Done
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bus::{Bus, CallError, MountCall, SpawnMessage, SPAWNER_PATH_PREFIX};
use crate::catalog::Mountable;
use crate::error::{Result, TrackerError};
use crate::launcher::{spawn_command, Launcher};
use crate::source::MountSource;
use crate::spec::MountSpec;

/// Suffix of the next spawn endpoint path, shared by all sessions
static NEXT_SPAWNER_ID: AtomicU64 = AtomicU64::new(0);

/// States a session passes through
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    Init,
    Connecting { address: String, spawned: bool },
    Spawning,
    WaitingForSpawnAck { endpoint: String },
    Done,
}

/// Result of a finished session
#[derive(Debug)]
pub struct MountOutcome {
    pub mountable: Option<Arc<Mountable>>,
    pub result: Result<()>,
    /// Every phase entered, in order
    pub phases: Vec<SessionPhase>,
}

impl MountOutcome {
    pub fn spawn_count(&self) -> usize {
        self.phases
            .iter()
            .filter(|p| matches!(p, SessionPhase::Spawning))
            .count()
    }
}

enum Step {
    Connect(String),
    Spawn,
}

/// Everything sessions share: the bus, the launcher, and spawn settings
#[derive(Clone)]
pub struct SessionFactory {
    bus: Arc<dyn Bus>,
    launcher: Arc<dyn Launcher>,
    spawn_timeout: Option<Duration>,
}

impl SessionFactory {
    pub fn new(
        bus: Arc<dyn Bus>,
        launcher: Arc<dyn Launcher>,
        spawn_timeout: Option<Duration>,
    ) -> Self {
        Self {
            bus,
            launcher,
            spawn_timeout,
        }
    }

    pub fn session(
        &self,
        mountable: Option<Arc<Mountable>>,
        spec: MountSpec,
        source: MountSource,
        automount: bool,
    ) -> MountSession {
        MountSession::new(
            mountable,
            spec,
            source,
            automount,
            self.bus.clone(),
            self.launcher.clone(),
        )
        .with_spawn_timeout(self.spawn_timeout)
    }
}

/// One attempt at establishing a mount
pub struct MountSession {
    mountable: Option<Arc<Mountable>>,
    spec: MountSpec,
    source: MountSource,
    automount: bool,
    bus: Arc<dyn Bus>,
    launcher: Arc<dyn Launcher>,
    spawn_timeout: Option<Duration>,
    spawned: bool,
    phases: Vec<SessionPhase>,
}

impl MountSession {
    pub fn new(
        mountable: Option<Arc<Mountable>>,
        spec: MountSpec,
        source: MountSource,
        automount: bool,
        bus: Arc<dyn Bus>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            mountable,
            spec,
            source,
            automount,
            bus,
            launcher,
            spawn_timeout: None,
            spawned: false,
            phases: Vec::new(),
        }
    }

    /// Give up on a spawned backend that has not acknowledged within `timeout`
    pub fn with_spawn_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    /// Drive the session to completion. Consumes the session; everything it
    /// holds is released when the outcome is returned.
    pub async fn run(mut self) -> MountOutcome {
        let result = self.establish().await;
        self.enter(SessionPhase::Done);
        if let Err(e) = &result {
            debug!("Mount session for {:?} failed: {}", self.spec.kind(), e);
        }

        MountOutcome {
            mountable: self.mountable.take(),
            result,
            phases: std::mem::take(&mut self.phases),
        }
    }

    fn enter(&mut self, phase: SessionPhase) {
        debug!("Mount session for {:?}: {:?}", self.spec.kind(), phase);
        self.phases.push(phase);
    }

    async fn establish(&mut self) -> Result<()> {
        self.enter(SessionPhase::Init);

        let mountable = self.mountable.clone().ok_or(TrackerError::NotMountable)?;
        let mut step = match (&mountable.dbus_name, &mountable.exec) {
            (Some(name), _) => Step::Connect(name.clone()),
            (None, Some(_)) => Step::Spawn,
            (None, None) => return Err(TrackerError::SpawnConfigMissing),
        };

        loop {
            step = match step {
                Step::Connect(address) => match self.connect(&address).await {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_no_owner() && !self.spawned => Step::Spawn,
                    Err(e) => return Err(e.into()),
                },
                Step::Spawn => Step::Connect(self.spawn(&mountable).await?),
            };
        }
    }

    async fn connect(&mut self, address: &str) -> std::result::Result<(), CallError> {
        self.enter(SessionPhase::Connecting {
            address: address.to_string(),
            spawned: self.spawned,
        });

        let call = MountCall {
            spec: self.spec.clone(),
            automount: self.automount,
            source: self.source.clone(),
        };
        self.bus.call_mount(address, call).await
    }

    /// Launch the backend and wait for its acknowledgment.
    ///
    /// Returns the address to retry the mount call against.
    async fn spawn(&mut self, mountable: &Mountable) -> Result<String> {
        self.enter(SessionPhase::Spawning);
        self.spawned = true;

        let exec = mountable
            .exec
            .as_deref()
            .ok_or(TrackerError::SpawnConfigMissing)?;

        let path = format!(
            "{}/{}",
            SPAWNER_PATH_PREFIX,
            NEXT_SPAWNER_ID.fetch_add(1, Ordering::Relaxed)
        );
        let bus = self.bus.clone();
        let endpoint = self.bus.export_spawner(&path)?;
        let mut endpoint = scopeguard::guard(endpoint, move |ep| bus.withdraw_spawner(ep.path()));

        let argv = spawn_command(exec, self.bus.unique_name(), &path);
        self.launcher
            .launch(&argv)
            .map_err(|e| TrackerError::SpawnLaunchFailed(e.to_string()))?;

        self.enter(SessionPhase::WaitingForSpawnAck {
            endpoint: path.clone(),
        });

        let message = match self.spawn_timeout {
            Some(limit) => tokio::time::timeout(limit, endpoint.recv())
                .await
                .map_err(|_| TrackerError::SpawnTimedOut)?,
            None => endpoint.recv().await,
        };
        drop(endpoint);

        match message? {
            SpawnMessage::Spawned(ack) if ack.succeeded => Ok(ack.sender),
            SpawnMessage::Spawned(ack) => Err(TrackerError::backend_failed(ack.message)),
            SpawnMessage::InvalidArgs { sender } => {
                debug!("Undecodable Spawned call from {}", sender);
                Err(TrackerError::InvalidArguments(
                    "Invalid arguments from spawned child".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::local::{LocalBus, MountHandler};
    use crate::bus::SpawnAck;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::io;

    struct Accept;

    #[async_trait]
    impl MountHandler for Accept {
        async fn mount(&self, _call: MountCall) -> std::result::Result<(), CallError> {
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl MountHandler for Refuse {
        async fn mount(&self, _call: MountCall) -> std::result::Result<(), CallError> {
            Err(CallError::from_fault(
                "org.gtk.GDBus.Error.PermissionDenied",
                "Login refused",
            ))
        }
    }

    /// A backend whose user dismissed the password prompt
    struct Dismissed;

    #[async_trait]
    impl MountHandler for Dismissed {
        async fn mount(&self, _call: MountCall) -> std::result::Result<(), CallError> {
            Err(CallError::from_fault(
                "org.gtk.GDBus.Error.FailedHandled",
                "Password dialog cancelled",
            ))
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        /// Acknowledge and serve mount calls
        Serve,
        /// Acknowledge success, then never answer on the bus
        AckOnly,
        Nack,
        Garbled,
        FailLaunch,
        Silent,
    }

    struct ScriptedLauncher {
        bus: Arc<LocalBus>,
        behavior: Behavior,
        launches: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedLauncher {
        fn new(bus: Arc<LocalBus>, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                bus,
                behavior,
                launches: Mutex::new(Vec::new()),
            })
        }
    }

    impl Launcher for ScriptedLauncher {
        fn launch(&self, argv: &[String]) -> io::Result<()> {
            self.launches.lock().push(argv.to_vec());
            let path = argv.last().cloned().unwrap_or_default();
            let sender = self.bus.connect();

            let message = match self.behavior {
                Behavior::FailLaunch => {
                    return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"))
                }
                Behavior::Silent => return Ok(()),
                Behavior::Serve => {
                    self.bus.own_name(sender.clone(), Arc::new(Accept));
                    SpawnMessage::Spawned(SpawnAck {
                        sender,
                        succeeded: true,
                        message: String::new(),
                    })
                }
                Behavior::AckOnly => SpawnMessage::Spawned(SpawnAck {
                    sender,
                    succeeded: true,
                    message: String::new(),
                }),
                Behavior::Nack => SpawnMessage::Spawned(SpawnAck {
                    sender,
                    succeeded: false,
                    message: "Backend could not start".to_string(),
                }),
                Behavior::Garbled => SpawnMessage::InvalidArgs { sender },
            };
            self.bus.deliver_spawned(&path, message);
            Ok(())
        }
    }

    fn mountable(exec: Option<&str>, dbus_name: Option<&str>) -> Arc<Mountable> {
        Arc::new(Mountable {
            kind: "sftp".to_string(),
            exec: exec.map(str::to_string),
            dbus_name: dbus_name.map(str::to_string),
            automount: false,
        })
    }

    fn spawnable() -> Option<Arc<Mountable>> {
        Some(mountable(Some("/usr/libexec/vfsd-sftp"), None))
    }

    fn session(
        bus: &Arc<LocalBus>,
        launcher: &Arc<ScriptedLauncher>,
        mountable: Option<Arc<Mountable>>,
    ) -> MountSession {
        MountSession::new(
            mountable,
            MountSpec::from_items([("type", "sftp"), ("host", "x")]),
            MountSource::silent(),
            true,
            bus.clone(),
            launcher.clone(),
        )
    }

    fn setup(behavior: Behavior) -> (Arc<LocalBus>, Arc<ScriptedLauncher>) {
        let bus = Arc::new(LocalBus::new(":1.0"));
        let launcher = ScriptedLauncher::new(bus.clone(), behavior);
        (bus, launcher)
    }

    #[tokio::test]
    async fn test_known_backend_connects_directly() {
        let (bus, launcher) = setup(Behavior::Serve);
        bus.own_name("org.gtk.vfs.sftp", Arc::new(Accept));

        let outcome = session(&bus, &launcher, Some(mountable(None, Some("org.gtk.vfs.sftp"))))
            .run()
            .await;

        assert!(outcome.result.is_ok());
        assert_eq!(
            outcome.phases,
            vec![
                SessionPhase::Init,
                SessionPhase::Connecting {
                    address: "org.gtk.vfs.sftp".to_string(),
                    spawned: false
                },
                SessionPhase::Done,
            ]
        );
        assert!(launcher.launches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_exec_only_starts_by_spawning() {
        let (bus, launcher) = setup(Behavior::Serve);

        let outcome = session(&bus, &launcher, spawnable())
            .run()
            .await;

        assert!(outcome.result.is_ok(), "{:?}", outcome.result);
        assert_eq!(outcome.phases[1], SessionPhase::Spawning);
        assert!(matches!(
            outcome.phases[3],
            SessionPhase::Connecting { spawned: true, .. }
        ));

        let launches = launcher.launches.lock();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0][0], "/usr/libexec/vfsd-sftp");
        assert_eq!(launches[0][1], "--spawner");
        assert_eq!(launches[0][2], ":1.0");
        assert!(launches[0][3].starts_with(SPAWNER_PATH_PREFIX));
        assert!(!bus.has_spawner(&launches[0][3]));
    }

    #[tokio::test]
    async fn test_unreachable_name_spawns_once() {
        let (bus, launcher) = setup(Behavior::AckOnly);

        let outcome = session(
            &bus,
            &launcher,
            Some(mountable(Some("/usr/libexec/vfsd-sftp"), Some("org.gtk.vfs.sftp"))),
        )
        .run()
        .await;

        let err = outcome.result.clone().unwrap_err();
        assert!(matches!(err, TrackerError::BackendReportedFailure { .. }));
        assert_eq!(err.fault_name(), crate::bus::ERROR_SERVICE_UNKNOWN);
        assert_eq!(outcome.spawn_count(), 1);
        assert_eq!(launcher.launches.lock().len(), 1);

        let kinds: Vec<_> = outcome
            .phases
            .iter()
            .map(|p| match p {
                SessionPhase::Init => "init",
                SessionPhase::Connecting { spawned: false, .. } => "connect",
                SessionPhase::Connecting { spawned: true, .. } => "connect-spawned",
                SessionPhase::Spawning => "spawn",
                SessionPhase::WaitingForSpawnAck { .. } => "wait",
                SessionPhase::Done => "done",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["init", "connect", "spawn", "wait", "connect-spawned", "done"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_name_without_exec() {
        let (bus, launcher) = setup(Behavior::Serve);

        let outcome = session(&bus, &launcher, Some(mountable(None, Some("org.gtk.vfs.sftp"))))
            .run()
            .await;

        assert_eq!(outcome.result, Err(TrackerError::SpawnConfigMissing));
        assert!(launcher.launches.lock().is_empty());
    }

    #[tokio::test]
    async fn test_backend_fault_is_not_retried() {
        let (bus, launcher) = setup(Behavior::Serve);
        bus.own_name("org.gtk.vfs.sftp", Arc::new(Refuse));

        let outcome = session(
            &bus,
            &launcher,
            Some(mountable(Some("/usr/libexec/vfsd-sftp"), Some("org.gtk.vfs.sftp"))),
        )
        .run()
        .await;

        assert_eq!(
            outcome.result,
            Err(TrackerError::BackendReportedFailure {
                name: "org.gtk.GDBus.Error.PermissionDenied".to_string(),
                message: "Login refused".to_string(),
            })
        );
        assert_eq!(outcome.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_fault_name_is_kept() {
        let (bus, launcher) = setup(Behavior::Serve);
        bus.own_name("org.gtk.vfs.sftp", Arc::new(Dismissed));

        let outcome = session(&bus, &launcher, Some(mountable(None, Some("org.gtk.vfs.sftp"))))
            .run()
            .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.fault_name(), "org.gtk.GDBus.Error.FailedHandled");
        assert_eq!(err.to_string(), "Password dialog cancelled");
    }

    #[tokio::test]
    async fn test_nack_reports_backend_message() {
        let (bus, launcher) = setup(Behavior::Nack);

        let outcome = session(&bus, &launcher, spawnable())
            .run()
            .await;

        assert_eq!(
            outcome.result,
            Err(TrackerError::backend_failed("Backend could not start"))
        );
    }

    #[tokio::test]
    async fn test_garbled_ack() {
        let (bus, launcher) = setup(Behavior::Garbled);

        let outcome = session(&bus, &launcher, spawnable())
            .run()
            .await;

        assert!(matches!(
            outcome.result,
            Err(TrackerError::InvalidArguments(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_tears_down_endpoint() {
        let (bus, launcher) = setup(Behavior::FailLaunch);

        let outcome = session(&bus, &launcher, spawnable())
            .run()
            .await;

        assert!(matches!(
            outcome.result,
            Err(TrackerError::SpawnLaunchFailed(_))
        ));
        let launches = launcher.launches.lock();
        assert!(!bus.has_spawner(&launches[0][3]));
        assert!(!outcome
            .phases
            .iter()
            .any(|p| matches!(p, SessionPhase::WaitingForSpawnAck { .. })));
    }

    #[tokio::test]
    async fn test_silent_backend_times_out() {
        let (bus, launcher) = setup(Behavior::Silent);

        let outcome = session(&bus, &launcher, spawnable())
            .with_spawn_timeout(Some(Duration::from_millis(20)))
            .run()
            .await;

        assert_eq!(outcome.result, Err(TrackerError::SpawnTimedOut));
        let launches = launcher.launches.lock();
        assert!(!bus.has_spawner(&launches[0][3]));
    }

    #[test]
    fn test_silent_backend_without_timeout_keeps_waiting() {
        let (bus, launcher) = setup(Behavior::Silent);

        let mut run = tokio_test::task::spawn(session(&bus, &launcher, spawnable()).run());
        tokio_test::assert_pending!(run.poll());
        tokio_test::assert_pending!(run.poll());

        let launches = launcher.launches.lock();
        assert_eq!(launches.len(), 1);
        assert!(bus.has_spawner(&launches[0][3]));
    }

    #[tokio::test]
    async fn test_unknown_and_unconfigured_mountables() {
        let (bus, launcher) = setup(Behavior::Serve);

        let unknown = session(&bus, &launcher, None).run().await;
        assert_eq!(unknown.result, Err(TrackerError::NotMountable));
        assert_eq!(unknown.phases, vec![SessionPhase::Init, SessionPhase::Done]);

        let bare = session(&bus, &launcher, Some(mountable(None, None))).run().await;
        assert_eq!(bare.result, Err(TrackerError::SpawnConfigMissing));
        assert!(bare.mountable.is_some());
    }
}
