use crate::config::IndexMode;
use crate::error::StoreError;
use crate::models::{IndexEntry, ScoredEntry};
use crate::store::IndexState;
use crate::traits::VectorStore;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Index persisted as one JSON document. Every write goes to a sibling temp file
/// that is renamed over the index, and memory is updated only after the rename.
///
/// Once a write holds the lock it always runs to completion, even if the caller
/// stops waiting, so disk and memory never disagree. Only waiting for the lock
/// is bounded by `lock_timeout`.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Arc<RwLock<IndexState>>,
    lock_timeout: Duration,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>, mode: IndexMode) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match mode {
            IndexMode::Reset => {
                let empty = persist_in_background(path.clone(), IndexState::default()).await?;
                tracing::info!(path = %path.display(), "vector index reset");
                empty
            }
            IndexMode::Accumulate => match tokio::fs::read(&path).await {
                Ok(bytes) => {
                    let state: IndexState = serde_json::from_slice(&bytes)?;
                    tracing::info!(
                        path = %path.display(),
                        entries = state.entries.len(),
                        "vector index loaded"
                    );
                    state
                }
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    tracing::info!(path = %path.display(), "vector index not found, starting empty");
                    IndexState::default()
                }
                Err(error) => return Err(error.into()),
            },
        };

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(state)),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    pub fn with_lock_timeout(self, lock_timeout: Duration) -> Self {
        Self {
            lock_timeout,
            ..self
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write_with<T>(
        &self,
        change: impl FnOnce(&mut IndexState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = tokio::time::timeout(self.lock_timeout, self.state.clone().write_owned())
            .await
            .map_err(|_| StoreError::Timeout(self.lock_timeout))?;

        let mut next = (*guard).clone();
        let output = change(&mut next)?;

        // Detached so a dropped caller cannot stop the write between rename and swap.
        let path = self.path.clone();
        tokio::spawn(async move {
            let written = persist_in_background(path, next).await?;
            *guard = written;
            Ok::<(), StoreError>(())
        })
        .await
        .map_err(|error| StoreError::Io(std::io::Error::other(error)))??;

        Ok(output)
    }
}

async fn persist_in_background(path: PathBuf, state: IndexState) -> Result<IndexState, StoreError> {
    tokio::task::spawn_blocking(move || persist(&path, &state).map(|()| state))
        .await
        .map_err(|error| StoreError::Io(std::io::Error::other(error)))?
}

fn persist(path: &Path, state: &IndexState) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec(state)?;
    let temp = temp_path(path);
    std::fs::write(&temp, bytes)?;
    if let Err(error) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(error.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

#[async_trait]
impl VectorStore for JsonFileStore {
    async fn upsert(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize, StoreError> {
        self.write_with(|state| state.replace_document(document_id, entries))
            .await
    }

    async fn query_nearest(
        &self,
        vector: &[f32],
        k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        self.state.read().await.nearest(vector, k, scope)
    }

    async fn delete(&self, document_id: &str) -> Result<usize, StoreError> {
        self.write_with(|state| Ok(state.remove_document(document_id)))
            .await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.write_with(|state| {
            state.clear();
            Ok(())
        })
        .await
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.entries.len())
    }

    async fn contains_document(&self, document_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().await.contains_document(document_id))
    }

    fn name(&self) -> &str {
        "json-file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::entry;
    use tempfile::tempdir;

    #[tokio::test]
    async fn entries_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("vectordb").join("index.json");

        let store = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        store
            .upsert("doc1", vec![entry("doc1", 0, vec![1.0, 0.0]), entry("doc1", 1, vec![0.0, 1.0])])
            .await?;
        drop(store);

        let reopened = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        assert_eq!(reopened.len().await?, 2);

        let hits = reopened.query_nearest(&[0.0, 1.0], 1, None).await?;
        assert_eq!(hits[0].entry.segment.sequence, 1);
        assert_eq!(hits[0].entry.provenance.document_id, "doc1");
        Ok(())
    }

    #[tokio::test]
    async fn reset_mode_discards_previous_runs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");

        let store = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        store
            .upsert("doc1", vec![entry("doc1", 0, vec![1.0, 0.0])])
            .await?;
        drop(store);

        let reset = JsonFileStore::open(&path, IndexMode::Reset).await?;
        assert!(reset.is_empty().await?);
        drop(reset);

        let reopened = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        assert!(reopened.is_empty().await?);
        Ok(())
    }

    #[tokio::test]
    async fn insertion_order_continues_after_reopen() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");

        let store = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        store
            .upsert("doc1", vec![entry("doc1", 0, vec![1.0, 0.0])])
            .await?;
        drop(store);

        let reopened = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        reopened
            .upsert("doc2", vec![entry("doc2", 0, vec![1.0, 0.0])])
            .await?;

        let hits = reopened.query_nearest(&[1.0, 0.0], 2, None).await?;
        assert_eq!(hits[0].entry.provenance.document_id, "doc1");
        assert_eq!(hits[1].entry.provenance.document_id, "doc2");
        Ok(())
    }

    #[tokio::test]
    async fn rejected_write_leaves_disk_and_memory_unchanged(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");

        let store = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        store
            .upsert("doc1", vec![entry("doc1", 0, vec![1.0, 0.0])])
            .await?;
        let result = store
            .upsert("doc2", vec![entry("doc2", 0, vec![1.0, 0.0, 0.0])])
            .await;

        assert!(matches!(result, Err(StoreError::DimensionMismatch { .. })));
        assert_eq!(store.len().await?, 1);
        drop(store);

        let reopened = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        assert!(!reopened.contains_document("doc2").await?);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_all_reach_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");
        let store = Arc::new(JsonFileStore::open(&path, IndexMode::Accumulate).await?);

        let writers: Vec<_> = (0..8)
            .map(|index| {
                let store = store.clone();
                tokio::spawn(async move {
                    let document_id = format!("doc{index}");
                    store
                        .upsert(
                            &document_id,
                            vec![
                                entry(&document_id, 0, vec![1.0, 0.0]),
                                entry(&document_id, 1, vec![0.0, 1.0]),
                            ],
                        )
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await??;
        }
        assert_eq!(store.len().await?, 16);
        drop(store);

        let reopened = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        assert_eq!(reopened.len().await?, 16);
        for index in 0..8 {
            assert!(reopened.contains_document(&format!("doc{index}")).await?);
        }
        assert!(!temp_path(&path).exists());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_writes_keep_disk_and_memory_in_step(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");
        let store = JsonFileStore::open(&path, IndexMode::Accumulate).await?;

        let bulk: Vec<IndexEntry> = (0..5_000)
            .map(|sequence| entry("bulk", sequence, vec![0.5; 32]))
            .collect();
        store.upsert("bulk", bulk).await?;

        for index in 0..20 {
            let document_id = format!("doc{index}");
            let write = store.upsert(&document_id, vec![entry(&document_id, 0, vec![0.5; 32])]);
            // The caller gives up almost at once; the write may or may not have started.
            let _ = tokio::time::timeout(std::time::Duration::from_micros(50 * index), write).await;
        }

        // Settled once every started write has released the lock.
        let in_memory_len = store.len().await?;
        let reopened = JsonFileStore::open(&path, IndexMode::Accumulate).await?;
        assert_eq!(reopened.len().await?, in_memory_len);
        for index in 0..20 {
            let document_id = format!("doc{index}");
            assert_eq!(
                store.contains_document(&document_id).await?,
                reopened.contains_document(&document_id).await?,
                "{document_id}"
            );
        }
        assert!(!temp_path(&path).exists());
        Ok(())
    }

    #[tokio::test]
    async fn lock_wait_times_out_without_writing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("index.json");
        let store = JsonFileStore::open(&path, IndexMode::Accumulate)
            .await?
            .with_lock_timeout(std::time::Duration::from_millis(20));

        let reader = store.state.read().await;
        let result = store
            .upsert("doc1", vec![entry("doc1", 0, vec![1.0, 0.0])])
            .await;
        drop(reader);

        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert!(!store.contains_document("doc1").await?);
        assert!(!path.exists());
        Ok(())
    }
}
