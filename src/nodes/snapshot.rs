//! On-disk snapshot of the node pool.
//!
//! The file is a JSON document `{"timestamp": <unix seconds>, "nodes": [...]}`.
//! It is written to a temporary sibling first and then renamed into place so a
//! crash never leaves a half-written snapshot behind.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::record::NodeRecord;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization/Deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Unix timestamp, seconds.
    pub timestamp: f64,
    pub nodes: Vec<NodeRecord>,
}

impl NodeSnapshot {
    pub fn new(nodes: Vec<NodeRecord>, taken_at: DateTime<Utc>) -> Self {
        Self {
            timestamp: taken_at.timestamp_millis() as f64 / 1000.0,
            nodes,
        }
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt((self.timestamp * 1000.0).round() as i64)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the snapshot. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<NodeSnapshot>, SnapshotError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, snapshot: &NodeSnapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(snapshot)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
