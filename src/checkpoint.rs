//! # Offset checkpointing
//!
//! Durable position tracking so a restarted pipeline resumes without
//! replaying already-committed history.
//!
//! A checkpoint records the position strictly *after* the last envelope of
//! the last committed batch; on restart the event source seeks there and
//! delivery continues from that point. Saves are idempotent, and the
//! checkpoint for a batch is written only after the batch's data commit has
//! succeeded.
//!
//! ## Usage
//!
//! ```ignore
//! let store = CheckpointStore::new("/var/chronosink/checkpoints").await?;
//!
//! store.save("orders-stream", Checkpoint::offset("orders-stream", 42)).await?;
//!
//! if let Some(cp) = store.load("orders-stream").await? {
//!     source.seek(&cp.position).await?;
//! }
//! ```

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A position in the source event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamPosition {
    /// Record index into an ordered stream (file replay, embedded queues)
    Offset(u64),
    /// Opaque engine-native position (LSN-style), resumed by the engine
    External(String),
}

impl StreamPosition {
    /// The numeric offset, when this is an offset position.
    pub fn as_offset(&self) -> Option<u64> {
        match self {
            Self::Offset(n) => Some(*n),
            Self::External(_) => None,
        }
    }
}

impl std::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offset(n) => write!(f, "offset:{n}"),
            Self::External(s) => write!(f, "external:{s}"),
        }
    }
}

/// Durable marker of how far into the source stream the pipeline has
/// successfully applied changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Source stream identifier
    pub stream: String,
    /// Position strictly after the last applied envelope
    pub position: StreamPosition,
    /// Unix timestamp (seconds) when the checkpoint was created
    pub timestamp: u64,
    /// Additional metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Checkpoint {
    /// Create an offset checkpoint.
    pub fn offset(stream: impl Into<String>, offset: u64) -> Self {
        Self::at(stream, StreamPosition::Offset(offset))
    }

    /// Create a checkpoint at an engine-native position.
    pub fn external(stream: impl Into<String>, position: impl Into<String>) -> Self {
        Self::at(stream, StreamPosition::External(position.into()))
    }

    /// Create a checkpoint at an arbitrary position.
    pub fn at(stream: impl Into<String>, position: StreamPosition) -> Self {
        Self {
            stream: stream.into(),
            position,
            timestamp: current_timestamp(),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Age of the checkpoint in seconds.
    pub fn age_secs(&self) -> u64 {
        current_timestamp().saturating_sub(self.timestamp)
    }
}

fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Trait for checkpoint storage backends.
#[async_trait::async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()>;
    async fn load(&self, key: &str) -> Result<Option<Checkpoint>>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list(&self) -> Result<Vec<String>>;
}

/// Shared checkpoint backend.
pub type SharedCheckpointBackend = Arc<dyn CheckpointBackend>;

/// Persistent checkpoint storage.
///
/// Stores one JSON file per stream with atomic tmp-write + fsync + rename.
pub struct CheckpointStore {
    base_dir: PathBuf,
    cache: RwLock<HashMap<String, Checkpoint>>,
    fsync: bool,
}

impl CheckpointStore {
    /// Create a new checkpoint store, loading any existing checkpoints.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    /// Create a checkpoint store with fsync control.
    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await.map_err(PipelineError::Io)?;

        let store = Self {
            base_dir,
            cache: RwLock::new(HashMap::new()),
            fsync,
        };
        store.load_all().await?;
        Ok(store)
    }

    /// Save a checkpoint durably.
    pub async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        if key.is_empty() || key.contains('/') || key.contains('\\') {
            return Err(PipelineError::checkpoint(format!(
                "invalid checkpoint key: {key:?}"
            )));
        }

        let file_path = self.file_path(key);
        let temp_path = file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(&checkpoint)
            .map_err(|e| PipelineError::checkpoint(e.to_string()))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await
            .map_err(PipelineError::Io)?;

        file.write_all(json.as_bytes())
            .await
            .map_err(PipelineError::Io)?;

        if self.fsync {
            file.sync_all().await.map_err(PipelineError::Io)?;
        }

        fs::rename(&temp_path, &file_path)
            .await
            .map_err(PipelineError::Io)?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), checkpoint.clone());
        }

        debug!(key, position = %checkpoint.position, "saved checkpoint");
        Ok(())
    }

    /// Load a checkpoint.
    pub async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        {
            let cache = self.cache.read().await;
            if let Some(cp) = cache.get(key) {
                return Ok(Some(cp.clone()));
            }
        }

        let file_path = self.file_path(key);
        if !file_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&file_path).await.map_err(PipelineError::Io)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .await
            .map_err(PipelineError::Io)?;

        let checkpoint: Checkpoint = serde_json::from_str(&contents)
            .map_err(|e| PipelineError::checkpoint(e.to_string()))?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(key.to_string(), checkpoint.clone());
        }

        Ok(Some(checkpoint))
    }

    /// Delete a checkpoint.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let file_path = self.file_path(key);
        if file_path.exists() {
            fs::remove_file(&file_path).await.map_err(PipelineError::Io)?;
        }

        {
            let mut cache = self.cache.write().await;
            cache.remove(key);
        }

        info!(key, "deleted checkpoint");
        Ok(())
    }

    /// List all checkpoint keys.
    pub async fn list(&self) -> Result<Vec<String>> {
        let cache = self.cache.read().await;
        Ok(cache.keys().cloned().collect())
    }

    async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.base_dir).await.map_err(PipelineError::Io)?;

        let mut loaded = 0;
        while let Some(entry) = entries.next_entry().await.map_err(PipelineError::Io)? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    match self.load(stem).await {
                        Ok(Some(_)) => loaded += 1,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(key = stem, error = %e, "failed to load checkpoint");
                        }
                    }
                }
            }
        }

        if loaded > 0 {
            info!(count = loaded, dir = %self.base_dir.display(), "loaded checkpoints");
        }
        Ok(())
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.base_dir.join(format!("{key}.json"))
    }
}

/// In-memory checkpoint store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for CheckpointStore {
    async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        CheckpointStore::save(self, key, checkpoint).await
    }

    async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        CheckpointStore::load(self, key).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        CheckpointStore::delete(self, key).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        CheckpointStore::list(self).await
    }
}

#[async_trait::async_trait]
impl CheckpointBackend for MemoryCheckpointStore {
    async fn save(&self, key: &str, checkpoint: Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.insert(key.to_string(), checkpoint);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Checkpoint>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        checkpoints.remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let checkpoints = self.checkpoints.read().await;
        Ok(checkpoints.keys().cloned().collect())
    }
}
