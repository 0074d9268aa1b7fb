//! # Schema history
//!
//! Append-only, file-backed record of each table's observed field set.
//!
//! The target is schema-less, so nothing here gates writes; the history
//! exists so operators and a restarted pipeline can reconstruct historical
//! column shapes of a schema-evolving source. An entry is appended only when
//! a record introduces fields not seen before on its table. Write failures
//! are fatal to the pipeline, same policy as checkpoints.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// One history entry: the full field set of a table at observation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub table: String,
    pub fields: Vec<String>,
    pub timestamp: u64,
}

/// Durable record of historical table shapes, JSON lines on disk.
pub struct SchemaHistory {
    path: PathBuf,
    tables: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl SchemaHistory {
    /// Open (or create) a schema history file, replaying existing entries.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(PipelineError::Io)?;
            }
        }

        let mut tables: HashMap<String, BTreeSet<String>> = HashMap::new();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let mut entries = 0usize;
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    let entry: HistoryEntry = serde_json::from_str(line)
                        .map_err(|e| PipelineError::schema_history(e.to_string()))?;
                    tables
                        .entry(entry.table)
                        .or_default()
                        .extend(entry.fields);
                    entries += 1;
                }
                if entries > 0 {
                    info!(entries, path = %path.display(), "loaded schema history");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::Io(e)),
        }

        Ok(Self {
            path,
            tables: RwLock::new(tables),
        })
    }

    /// Record the field set observed on a table.
    ///
    /// Appends a history entry only when `fields` contains names not seen
    /// before on that table; returns whether an entry was written.
    pub async fn observe<I, S>(&self, table: &str, fields: I) -> Result<bool>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let incoming: BTreeSet<String> = fields.into_iter().map(Into::into).collect();
        if incoming.is_empty() {
            return Ok(false);
        }

        let merged = {
            let mut tables = self.tables.write().await;
            let known = tables.entry(table.to_string()).or_default();
            if incoming.is_subset(known) {
                return Ok(false);
            }
            known.extend(incoming);
            known.iter().cloned().collect::<Vec<_>>()
        };

        let entry = HistoryEntry {
            table: table.to_string(),
            fields: merged,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        let mut line = serde_json::to_string(&entry)
            .map_err(|e| PipelineError::schema_history(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(PipelineError::Io)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(PipelineError::Io)?;
        file.sync_all().await.map_err(PipelineError::Io)?;

        debug!(table, "schema history advanced");
        Ok(true)
    }

    /// The known field set of a table, if any.
    pub async fn fields(&self, table: &str) -> Option<BTreeSet<String>> {
        let tables = self.tables.read().await;
        tables.get(table).cloned()
    }

    /// Tables with recorded history.
    pub async fn tables(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        tables.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_observe_appends_only_new_fields() {
        let dir = tempdir().unwrap();
        let history = SchemaHistory::open(dir.path().join("history.jsonl"))
            .await
            .unwrap();

        assert!(history.observe("users", ["id", "email"]).await.unwrap());
        // Same shape again: no new entry.
        assert!(!history.observe("users", ["id", "email"]).await.unwrap());
        // Subset: no new entry.
        assert!(!history.observe("users", ["id"]).await.unwrap());
        // New field: appended.
        assert!(history.observe("users", ["id", "nickname"]).await.unwrap());

        let fields = history.fields("users").await.unwrap();
        assert!(fields.contains("email"));
        assert!(fields.contains("nickname"));
    }

    #[tokio::test]
    async fn test_reload_from_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        {
            let history = SchemaHistory::open(&path).await.unwrap();
            history.observe("users", ["id", "email"]).await.unwrap();
            history.observe("orders", ["id", "total"]).await.unwrap();
        }

        let reloaded = SchemaHistory::open(&path).await.unwrap();
        assert_eq!(reloaded.fields("users").await.unwrap().len(), 2);
        assert!(reloaded.fields("orders").await.unwrap().contains("total"));
        let mut tables = reloaded.tables().await;
        tables.sort();
        assert_eq!(tables, vec!["orders", "users"]);
    }

    #[tokio::test]
    async fn test_empty_field_set_ignored() {
        let dir = tempdir().unwrap();
        let history = SchemaHistory::open(dir.path().join("history.jsonl"))
            .await
            .unwrap();
        assert!(!history.observe("users", Vec::<String>::new()).await.unwrap());
        assert!(history.fields("users").await.is_none());
    }
}
