use crate::error::StoreError;
use crate::models::{IndexEntry, ScoredEntry};
use crate::store::IndexState;
use crate::traits::VectorStore;
use async_trait::async_trait;
use tokio::sync::RwLock;

/// In-process index. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<IndexState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn upsert(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize, StoreError> {
        self.state.write().await.replace_document(document_id, entries)
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
        Ok(self.state.write().await.remove_document(document_id))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.state.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.state.read().await.entries.len())
    }

    async fn contains_document(&self, document_id: &str) -> Result<bool, StoreError> {
        Ok(self.state.read().await.contains_document(document_id))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
