//! Recognizer label → display name mapping.
//!
//! Stored as a JSON object whose keys are integer labels:
//! `{"0": "Alice", "1": "Bob"}`. The map is validated once at load and is
//! immutable for the rest of the session.

use crate::atomic;
use crate::types::Resolved;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("label map not found: {0} (run `rollcall train` first)")]
    NotFound(PathBuf),
    #[error("failed to read label map {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write label map: {0}")]
    Write(#[from] std::io::Error),
    #[error("label map {path} is not a JSON object of strings: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid label {0:?}: labels must be integers")]
    InvalidLabel(String),
    #[error("label {0} is mapped more than once")]
    DuplicateLabel(i32),
    #[error("name {name:?} is mapped by both label {first} and label {second}")]
    DuplicateName { name: String, first: i32, second: i32 },
    #[error("label {0} has an empty name")]
    EmptyName(i32),
}

/// Validated, immutable label → name mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityMap {
    names: BTreeMap<i32, String>,
}

impl IdentityMap {
    /// Build a map, rejecting duplicate labels, duplicate names, and blank names.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = (i32, S)>,
        S: Into<String>,
    {
        let mut names = BTreeMap::new();
        let mut seen: HashMap<String, i32> = HashMap::new();

        for (label, name) in entries {
            let name = name.into().trim().to_string();
            if name.is_empty() {
                return Err(IdentityError::EmptyName(label));
            }
            if names.contains_key(&label) {
                return Err(IdentityError::DuplicateLabel(label));
            }
            if let Some(&first) = seen.get(&name) {
                return Err(IdentityError::DuplicateName {
                    name,
                    first,
                    second: label,
                });
            }
            seen.insert(name.clone(), label);
            names.insert(label, name);
        }

        Ok(Self { names })
    }

    /// Load and validate a label map from JSON.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                IdentityError::NotFound(path.to_path_buf())
            } else {
                IdentityError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;

        let raw: BTreeMap<String, String> =
            serde_json::from_str(&contents).map_err(|e| IdentityError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;

        let mut entries = Vec::with_capacity(raw.len());
        for (key, name) in raw {
            let label: i32 = key
                .trim()
                .parse()
                .map_err(|_| IdentityError::InvalidLabel(key.clone()))?;
            entries.push((label, name));
        }

        let map = Self::from_entries(entries)?;
        tracing::info!(path = %path.display(), identities = map.len(), "loaded label map");
        Ok(map)
    }

    /// Write the map as JSON, replacing any existing file atomically.
    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        let raw: BTreeMap<String, &str> = self
            .names
            .iter()
            .map(|(label, name)| (label.to_string(), name.as_str()))
            .collect();
        let json = serde_json::to_string_pretty(&raw).map_err(std::io::Error::from)?;
        atomic::replace_file::<IdentityError, _>(path, |f| {
            f.write_all(json.as_bytes())?;
            Ok(())
        })
    }

    /// Resolve a recognizer label. Unmapped labels resolve to `Unknown`.
    pub fn resolve(&self, label: i32) -> Resolved {
        match self.names.get(&label) {
            Some(name) => Resolved::Known(name.clone()),
            None => Resolved::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterate `(label, name)` in label order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.names.iter().map(|(l, n)| (*l, n.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unmapped() {
        let map = IdentityMap::from_entries([(0, "Alice"), (1, "Bob")]).unwrap();
        assert_eq!(map.resolve(1), Resolved::Known("Bob".into()));
        assert_eq!(map.resolve(7), Resolved::Unknown);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let err = IdentityMap::from_entries([(0, "Alice"), (3, "Alice")]).unwrap_err();
        assert!(matches!(
            err,
            IdentityError::DuplicateName { first: 0, second: 3, .. }
        ));
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let err = IdentityMap::from_entries([(2, "Alice"), (2, "Bob")]).unwrap_err();
        assert!(matches!(err, IdentityError::DuplicateLabel(2)));
    }

    #[test]
    fn test_blank_name_rejected() {
        let err = IdentityMap::from_entries([(0, "  ")]).unwrap_err();
        assert!(matches!(err, IdentityError::EmptyName(0)));
    }

    #[test]
    fn test_load_rejects_non_integer_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        std::fs::write(&path, r#"{"0": "Alice", "first": "Bob"}"#).unwrap();
        let err = IdentityMap::load(&path).unwrap_err();
        assert!(matches!(err, IdentityError::InvalidLabel(ref k) if k == "first"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = IdentityMap::load(&dir.path().join("labels.json")).unwrap_err();
        assert!(matches!(err, IdentityError::NotFound(_)));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.json");
        let map = IdentityMap::from_entries([(0, "Alice"), (10, "Bob")]).unwrap();
        map.save(&path).unwrap();
        assert_eq!(IdentityMap::load(&path).unwrap(), map);
    }
}
