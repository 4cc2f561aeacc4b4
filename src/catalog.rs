//! Catalog of mountable backend types
//!
//! Loaded once at startup from a directory of key files, one per backend:
//!
//! ```ini
//! [Mount]
//! Type=sftp;ssh
//! Exec=${LIBEXECDIR}/vfsd-sftp
//! DBusName=org.gtk.vfs.mountpoint_sftp
//! AutoMount=false
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ini::Ini;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::env::expand_env;
use crate::spec::MountSpec;

const MOUNT_SECTION: &str = "Mount";

/// How to reach or launch the backend for one mount type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mountable {
    /// Catalog key (the spec's `type`)
    pub kind: String,
    /// Launch command template
    pub exec: Option<String>,
    /// Fixed well-known backend address
    pub dbus_name: Option<String>,
    /// Whether lookups may mount this type on demand
    pub automount: bool,
}

/// Immutable table of mountables, newest-loaded first
#[derive(Debug, Default)]
pub struct MountableCatalog {
    entries: Vec<Arc<Mountable>>,
}

impl MountableCatalog {
    /// Load every descriptor in `dir`.
    ///
    /// A missing directory yields an empty catalog. Files are read in name
    /// order; when two files declare the same type the later one wins.
    pub fn load(dir: &Path) -> Self {
        let mut catalog = Self::default();

        let read_dir = match std::fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) => {
                warn!("Cannot read mountable directory {:?}: {}", dir, e);
                return catalog;
            }
        };

        let mut paths: Vec<PathBuf> = read_dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        for path in paths {
            match load_descriptor(&path) {
                Ok(mountables) => {
                    for mountable in mountables {
                        debug!("Loaded mountable {:?} from {:?}", mountable.kind, path);
                        catalog.insert(mountable);
                    }
                }
                Err(e) => warn!("Skipping mountable descriptor {:?}: {}", path, e),
            }
        }

        info!(
            "Loaded {} mountable type(s) from {:?}",
            catalog.len(),
            dir
        );
        catalog
    }

    /// Build a catalog from already-parsed entries, first entry oldest
    pub fn from_mountables(mountables: impl IntoIterator<Item = Mountable>) -> Self {
        let mut catalog = Self::default();
        for mountable in mountables {
            catalog.insert(mountable);
        }
        catalog
    }

    fn insert(&mut self, mountable: Mountable) {
        self.entries.insert(0, Arc::new(mountable));
    }

    pub fn lookup(&self, kind: &str) -> Option<Arc<Mountable>> {
        self.entries.iter().find(|m| m.kind == kind).cloned()
    }

    /// Mountable for the spec's `type`, if it has one
    pub fn lookup_for_spec(&self, spec: &MountSpec) -> Option<Arc<Mountable>> {
        spec.kind().and_then(|kind| self.lookup(kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Mountable>> {
        self.entries.iter()
    }
}

/// Parse one descriptor file into one mountable per declared type
fn load_descriptor(path: &Path) -> Result<Vec<Mountable>, ConfigError> {
    let ini = Ini::load_from_file(path)
        .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;
    parse_descriptor(&ini)
}

fn parse_descriptor(ini: &Ini) -> Result<Vec<Mountable>, ConfigError> {
    let Some(section) = ini.section(Some(MOUNT_SECTION)) else {
        return Ok(Vec::new());
    };
    let Some(types) = section.get("Type") else {
        return Ok(Vec::new());
    };

    let exec = section.get("Exec").map(expand_env).transpose()?;
    let dbus_name = section.get("DBusName").map(str::to_string);
    let automount = section.get("AutoMount").map(parse_bool).unwrap_or(false);

    Ok(types
        .split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|kind| Mountable {
            kind: kind.to_string(),
            exec: exec.clone(),
            dbus_name: dbus_name.clone(),
            automount,
        })
        .collect())
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1")
}
