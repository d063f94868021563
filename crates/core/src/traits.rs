use crate::error::StoreError;
use crate::models::{IndexEntry, ScoredEntry};
use async_trait::async_trait;

/// Persistent vector index. Implementations own all entries and serialize writers.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Atomically replaces every entry of `document_id` with `entries`.
    /// Readers observe either the old set or the new one. Returns how many entries were replaced.
    async fn upsert(&self, document_id: &str, entries: Vec<IndexEntry>) -> Result<usize, StoreError>;

    /// Up to `k` entries by descending cosine similarity, ties broken by insertion order.
    /// `scope` restricts the search to one document.
    async fn query_nearest(
        &self,
        vector: &[f32],
        k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ScoredEntry>, StoreError>;

    async fn delete(&self, document_id: &str) -> Result<usize, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    async fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len().await? == 0)
    }

    async fn contains_document(&self, document_id: &str) -> Result<bool, StoreError>;

    fn name(&self) -> &str;
}
