//! Persistent set of drive-file ids whose pipeline outcome is terminal.
//!
//! Stored as a JSON document whose `processed` member is the id list.
//! Unknown sibling members are preserved verbatim on rewrite. Writes are
//! atomic: staged to a temp file in the same directory, then renamed.

use serde_json::{Map, Value};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{PipelineError, Result};

pub struct ProcessedSet {
    path: PathBuf,
    ids: Vec<String>,
    index: HashSet<String>,
    /// Top-level members other than `processed`, carried through rewrites.
    extra: Map<String, Value>,
}

impl ProcessedSet {
    /// Load the set from disk; a missing file starts empty.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No processed-set file at {}, starting fresh", path.display());
            return Ok(Self {
                path: path.to_path_buf(),
                ids: Vec::new(),
                index: HashSet::new(),
                extra: Map::new(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::DriveWatch(format!(
                "cannot read processed set {}: {e}",
                path.display()
            ))
        })?;

        let value: Value = match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "Processed set {} is unparseable, starting fresh: {err}",
                    path.display()
                );
                Value::Object(Map::new())
            }
        };

        let (ids, extra) = match value {
            // Legacy shape: a bare JSON list of ids.
            Value::Array(items) => (collect_ids(items), Map::new()),
            Value::Object(mut members) => {
                let ids = match members.remove("processed") {
                    Some(Value::Array(items)) => collect_ids(items),
                    _ => Vec::new(),
                };
                (ids, members)
            }
            _ => (Vec::new(), Map::new()),
        };

        let index: HashSet<String> = ids.iter().cloned().collect();
        info!(
            "Loaded processed set: {} entries from {}",
            ids.len(),
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            ids,
            index,
            extra,
        })
    }

    pub fn contains(&self, file_id: &str) -> bool {
        self.index.contains(file_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Record a terminal outcome for `file_id` and persist immediately.
    /// The set never shrinks during a process lifetime.
    pub fn mark(&mut self, file_id: &str) -> Result<()> {
        if self.index.insert(file_id.to_string()) {
            self.ids.push(file_id.to_string());
        }
        self.save()
    }

    /// Atomically replace the on-disk file: write to a staging file in the
    /// same directory, then rename over the target.
    fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| {
            PipelineError::DriveWatch(format!(
                "cannot create {} for processed set: {e}",
                parent.display()
            ))
        })?;

        let mut document = self.extra.clone();
        document.insert(
            "processed".to_string(),
            Value::Array(self.ids.iter().cloned().map(Value::String).collect()),
        );
        let serialized = serde_json::to_string_pretty(&Value::Object(document))
            .map_err(|e| PipelineError::DriveWatch(format!("processed set serialize: {e}")))?;

        let mut staging = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            PipelineError::DriveWatch(format!("processed set staging file: {e}"))
        })?;
        staging
            .write_all(serialized.as_bytes())
            .map_err(|e| PipelineError::DriveWatch(format!("processed set write: {e}")))?;
        staging.persist(&self.path).map_err(|e| {
            PipelineError::DriveWatch(format!(
                "processed set rename to {}: {e}",
                self.path.display()
            ))
        })?;

        debug!(
            "Saved processed set ({} entries) to {}",
            self.ids.len(),
            self.path.display()
        );
        Ok(())
    }
}

fn collect_ids(items: Vec<Value>) -> Vec<String> {
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(id) => Some(id),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let set = ProcessedSet::load(&dir.path().join("processed.json")).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn mark_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");

        let mut set = ProcessedSet::load(&path).unwrap();
        set.mark("file-a").unwrap();
        set.mark("file-b").unwrap();
        set.mark("file-a").unwrap();
        assert_eq!(set.len(), 2);

        let reloaded = ProcessedSet::load(&path).unwrap();
        assert!(reloaded.contains("file-a"));
        assert!(reloaded.contains("file-b"));
        assert!(!reloaded.contains("file-c"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn unknown_members_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");
        std::fs::write(
            &path,
            r#"{"processed": ["old"], "schema_hint": {"version": 3}, "note": "keep me"}"#,
        )
        .unwrap();

        let mut set = ProcessedSet::load(&path).unwrap();
        set.mark("new").unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["note"], "keep me");
        assert_eq!(raw["schema_hint"]["version"], 3);
        let ids = raw["processed"].as_array().unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn legacy_bare_list_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");
        std::fs::write(&path, r#"["a", "b"]"#).unwrap();

        let set = ProcessedSet::load(&path).unwrap();
        assert!(set.contains("a"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn corrupt_file_starts_fresh_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");
        std::fs::write(&path, "{not json").unwrap();

        let set = ProcessedSet::load(&path).unwrap();
        assert!(set.is_empty());
    }
}
