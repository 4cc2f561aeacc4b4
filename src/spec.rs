//! Mount specifications
//!
//! A mount spec identifies a mount target by a set of key/value items (the
//! `type` item selects the backend) plus a mount prefix. Specs are shared
//! between the registry, sessions and replies, so they are cheap to clone.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Item key holding the backend type
pub const TYPE_KEY: &str = "type";

/// Spec as it travels on the bus, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMountSpec {
    pub mount_prefix: String,
    pub items: Vec<(String, String)>,
}

#[derive(Debug, PartialEq, Eq)]
struct SpecInner {
    items: BTreeMap<String, String>,
    mount_prefix: String,
}

/// Validated, shared mount specification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec(Arc<SpecInner>);

impl MountSpec {
    /// Build a spec from items with the root mount prefix
    pub fn from_items<I, K, V>(items: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let items = items
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self(Arc::new(SpecInner {
            items,
            mount_prefix: "/".to_string(),
        }))
    }

    /// Same items, different mount prefix
    pub fn with_mount_prefix(&self, prefix: impl Into<String>) -> Self {
        Self(Arc::new(SpecInner {
            items: self.0.items.clone(),
            mount_prefix: normalize_prefix(prefix.into()),
        }))
    }

    /// Backend type, if the spec carries one
    pub fn kind(&self) -> Option<&str> {
        self.get(TYPE_KEY)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.items.get(key).map(String::as_str)
    }

    pub fn mount_prefix(&self) -> &str {
        &self.0.mount_prefix
    }

    /// Whether this (registered) spec serves `path_spec`.
    ///
    /// Items must be identical and the mount prefix must be a path prefix of
    /// the other spec's prefix.
    pub fn matches(&self, path_spec: &MountSpec) -> bool {
        self.0.items == path_spec.0.items
            && has_path_prefix(path_spec.mount_prefix(), self.mount_prefix())
    }

    pub fn to_wire(&self) -> RawMountSpec {
        RawMountSpec {
            mount_prefix: self.0.mount_prefix.clone(),
            items: self
                .0
                .items
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    /// Validate a spec received from the bus.
    ///
    /// Returns `None` for empty keys, duplicate keys, or a relative prefix.
    pub fn from_wire(raw: RawMountSpec) -> Option<MountSpec> {
        let mut items = BTreeMap::new();
        for (key, value) in raw.items {
            if key.is_empty() || items.insert(key, value).is_some() {
                return None;
            }
        }

        if !raw.mount_prefix.is_empty() && !raw.mount_prefix.starts_with('/') {
            return None;
        }

        Some(Self(Arc::new(SpecInner {
            items,
            mount_prefix: normalize_prefix(raw.mount_prefix),
        })))
    }
}

fn normalize_prefix(prefix: String) -> String {
    if prefix.is_empty() {
        "/".to_string()
    } else {
        prefix
    }
}

fn has_path_prefix(path: &str, prefix: &str) -> bool {
    if !path.starts_with(prefix) {
        return false;
    }
    prefix.ends_with('/') || path.len() == prefix.len() || path[prefix.len()..].starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sftp(host: &str) -> MountSpec {
        MountSpec::from_items([("type", "sftp"), ("host", host)])
    }

    #[test]
    fn test_identical_items_match() {
        assert!(sftp("x").matches(&sftp("x")));
        assert!(!sftp("x").matches(&sftp("y")));
    }

    #[test]
    fn test_extra_item_does_not_match() {
        let with_user = MountSpec::from_items([("type", "sftp"), ("host", "x"), ("user", "me")]);
        assert!(!sftp("x").matches(&with_user));
    }

    #[test]
    fn test_prefix_matching() {
        let share = sftp("x").with_mount_prefix("/srv/share");
        assert!(share.matches(&sftp("x").with_mount_prefix("/srv/share")));
        assert!(share.matches(&sftp("x").with_mount_prefix("/srv/share/docs")));
        assert!(!share.matches(&sftp("x").with_mount_prefix("/srv/shared")));
        assert!(!share.matches(&sftp("x")));
        assert!(sftp("x").matches(&share));
    }

    #[test]
    fn test_kind() {
        assert_eq!(sftp("x").kind(), Some("sftp"));
        assert_eq!(MountSpec::from_items([("host", "x")]).kind(), None);
    }

    #[test]
    fn test_from_wire_rejects_duplicate_keys() {
        let raw = RawMountSpec {
            mount_prefix: "/".to_string(),
            items: vec![
                ("type".to_string(), "smb".to_string()),
                ("type".to_string(), "ftp".to_string()),
            ],
        };
        assert!(MountSpec::from_wire(raw).is_none());
    }

    #[test]
    fn test_from_wire_rejects_relative_prefix() {
        let raw = RawMountSpec {
            mount_prefix: "share".to_string(),
            items: vec![("type".to_string(), "smb".to_string())],
        };
        assert!(MountSpec::from_wire(raw).is_none());
    }

    #[test]
    fn test_from_wire_defaults_prefix() {
        let raw = RawMountSpec {
            mount_prefix: String::new(),
            items: vec![("type".to_string(), "ftp".to_string())],
        };
        let spec = MountSpec::from_wire(raw).unwrap();
        assert_eq!(spec.mount_prefix(), "/");
        assert_eq!(spec.to_wire().items, vec![("type".to_string(), "ftp".to_string())]);
    }
}
