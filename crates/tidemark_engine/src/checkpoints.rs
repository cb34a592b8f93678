//! Checkpoint persistence.
//!
//! One checkpoint per (replication identifier, direction). A checkpoint
//! is written only after the batch it covers has been durably applied,
//! and replication resumes from the last persisted checkpoint after a
//! restart, never from scratch, unless explicitly reset.

use crate::backend::BoxFuture;
use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tidemark_protocol::{Checkpoint, Direction};

/// Persists replication progress per (identifier, direction).
///
/// `set` must be durable before the caller requests the next batch.
/// Concurrent replications with the same identifier are prevented by
/// the registry, not here.
pub trait CheckpointStore: Send + Sync {
    /// Reads the last persisted checkpoint, if any.
    fn get(
        &self,
        identifier: &str,
        direction: Direction,
    ) -> BoxFuture<'_, ReplicationResult<Option<Checkpoint>>>;

    /// Durably persists a checkpoint.
    fn set(
        &self,
        identifier: &str,
        direction: Direction,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'_, ReplicationResult<()>>;

    /// Explicitly discards both directions for an identifier, so the
    /// next start replicates from scratch.
    fn reset(&self, identifier: &str) -> BoxFuture<'_, ReplicationResult<()>>;
}

fn slot_key(identifier: &str, direction: Direction) -> String {
    format!("{identifier}/{direction}")
}

/// An in-memory checkpoint store for tests and ephemeral replications.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    slots: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn get(
        &self,
        identifier: &str,
        direction: Direction,
    ) -> BoxFuture<'_, ReplicationResult<Option<Checkpoint>>> {
        let result = self.slots.read().get(&slot_key(identifier, direction)).cloned();
        Box::pin(async move { Ok(result) })
    }

    fn set(
        &self,
        identifier: &str,
        direction: Direction,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'_, ReplicationResult<()>> {
        self.slots
            .write()
            .insert(slot_key(identifier, direction), checkpoint);
        Box::pin(async move { Ok(()) })
    }

    fn reset(&self, identifier: &str) -> BoxFuture<'_, ReplicationResult<()>> {
        let prefix = format!("{identifier}/");
        self.slots.write().retain(|key, _| !key.starts_with(&prefix));
        Box::pin(async move { Ok(()) })
    }
}

/// A file-backed checkpoint store.
///
/// All slots live in one JSON file, rewritten atomically on every `set`
/// (write to a temporary sibling, sync, rename). Checkpoints are tiny
/// and written once per applied batch, so the full rewrite stays cheap.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    slots: RwLock<HashMap<String, Checkpoint>>,
}

impl FileCheckpointStore {
    /// Opens or creates the store at the given path, loading any
    /// previously persisted slots.
    pub fn open(path: impl Into<PathBuf>) -> ReplicationResult<Self> {
        let path = path.into();
        let slots = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ReplicationError::Storage(format!("corrupt checkpoint file: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(ReplicationError::Storage(format!(
                    "cannot read checkpoint file: {e}"
                )))
            }
        };

        Ok(Self {
            path,
            slots: RwLock::new(slots),
        })
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> ReplicationResult<()> {
        let snapshot = self.slots.read().clone();
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| ReplicationError::Storage(format!("encode checkpoints: {e}")))?;

        let tmp = self.path.with_extension("tmp");
        let io_err = |e: std::io::Error| ReplicationError::Storage(format!("persist checkpoints: {e}"));

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn get(
        &self,
        identifier: &str,
        direction: Direction,
    ) -> BoxFuture<'_, ReplicationResult<Option<Checkpoint>>> {
        let result = self.slots.read().get(&slot_key(identifier, direction)).cloned();
        Box::pin(async move { Ok(result) })
    }

    fn set(
        &self,
        identifier: &str,
        direction: Direction,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'_, ReplicationResult<()>> {
        self.slots
            .write()
            .insert(slot_key(identifier, direction), checkpoint);
        let result = self.persist();
        Box::pin(async move { result })
    }

    fn reset(&self, identifier: &str) -> BoxFuture<'_, ReplicationResult<()>> {
        let prefix = format!("{identifier}/");
        self.slots.write().retain(|key, _| !key.starts_with(&prefix));
        let result = self.persist();
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryCheckpointStore::new();

        assert_eq!(store.get("users", Direction::Pull).await.unwrap(), None);

        store
            .set("users", Direction::Pull, Checkpoint::from_sequence(7))
            .await
            .unwrap();
        store
            .set("users", Direction::Push, Checkpoint::from_sequence(3))
            .await
            .unwrap();

        // Directions are independent slots
        assert_eq!(
            store.get("users", Direction::Pull).await.unwrap(),
            Some(Checkpoint::from_sequence(7))
        );
        assert_eq!(
            store.get("users", Direction::Push).await.unwrap(),
            Some(Checkpoint::from_sequence(3))
        );
    }

    #[tokio::test]
    async fn reset_clears_only_one_identifier() {
        let store = MemoryCheckpointStore::new();
        store
            .set("a", Direction::Pull, Checkpoint::from_sequence(1))
            .await
            .unwrap();
        store
            .set("b", Direction::Pull, Checkpoint::from_sequence(2))
            .await
            .unwrap();

        store.reset("a").await.unwrap();

        assert_eq!(store.get("a", Direction::Pull).await.unwrap(), None);
        assert_eq!(
            store.get("b", Direction::Pull).await.unwrap(),
            Some(Checkpoint::from_sequence(2))
        );
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");

        {
            let store = FileCheckpointStore::open(&path).unwrap();
            store
                .set("users", Direction::Pull, Checkpoint::from_sequence(42))
                .await
                .unwrap();
        }

        let reopened = FileCheckpointStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("users", Direction::Pull).await.unwrap(),
            Some(Checkpoint::from_sequence(42))
        );
    }

    #[tokio::test]
    async fn file_store_starts_empty_without_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path().join("missing.json")).unwrap();
        assert_eq!(store.get("x", Direction::Push).await.unwrap(), None);
    }
}
