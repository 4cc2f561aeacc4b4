//! mount-tracker: the mount tracking core of a virtual filesystem daemon
//!
//! Every mount is served by its own backend process on the session bus. This
//! crate keeps track of which mounts are active, and mounts locations on
//! request by reaching the right backend, launching it first when it is not
//! running yet.
//!
//! # Architecture
//!
//! - **Catalog**: Mountable backend types, loaded once from descriptor files.
//! - **Registry**: Active mounts, unique by identity and by spec; cleaned up
//!   when the owning bus client disappears.
//! - **Session**: The per-request mount protocol (connect, spawn on demand,
//!   wait for the spawn acknowledgment, retry once).
//! - **Automount**: Mounts on lookup miss when the backend type allows it.
//! - **Tracker**: The service task dispatching MountTracker operations.
//! - **Bus**: Routing between the tracker, clients and backends; peers reach
//!   it over a Unix socket speaking newline-delimited JSON frames.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mount_tracker::bus::local::LocalBus;
//! use mount_tracker::catalog::MountableCatalog;
//! use mount_tracker::config::Config;
//! use mount_tracker::launcher::ProcessLauncher;
//! use mount_tracker::session::SessionFactory;
//! use mount_tracker::tracker::MountTracker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_file(&"config.yaml".into())?;
//! let catalog = Arc::new(MountableCatalog::load(&config.mountable_dir));
//!
//! let bus = Arc::new(LocalBus::new(config.unique_name.clone()));
//! let sessions = SessionFactory::new(bus.clone(), Arc::new(ProcessLauncher::new()), None);
//! let tracker = MountTracker::new(catalog, bus.clone(), sessions);
//!
//! let handle = tracker.handle();
//! tokio::spawn(tracker.run());
//! let mounts = handle.list_mounts(":1.42").await?;
//! # Ok(())
//! # }
//! ```

pub mod automount;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod env;
pub mod error;
pub mod launcher;
pub mod registry;
pub mod session;
pub mod source;
pub mod spec;
pub mod tracker;

pub use error::{Result, TrackerError};
