use crate::cancel::CancelToken;
use crate::embeddings::EmbeddingBackend;
use crate::error::{BackendError, PipelineError, StoreError};
use crate::models::ScoredSegment;
use crate::retry::RetryPolicy;
use crate::traits::VectorStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn EmbeddingBackend>,
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
    store_timeout: Duration,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingBackend>,
        store: Arc<dyn VectorStore>,
        retry: RetryPolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            retry,
            store_timeout,
        }
    }

    /// Nearest segments to `query_text`, best first. Returns fewer than `k` when the
    /// index is smaller, and `EmptyIndex` when it holds nothing at all.
    pub async fn retrieve(
        &self,
        query_text: &str,
        k: usize,
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredSegment>, PipelineError> {
        self.retrieve_scoped(query_text, k, None, cancel).await
    }

    pub async fn retrieve_scoped(
        &self,
        query_text: &str,
        k: usize,
        scope: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<Vec<ScoredSegment>, PipelineError> {
        if k == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "k must be at least 1".to_string(),
            ));
        }
        if query_text.trim().is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "query is empty".to_string(),
            ));
        }

        if self.read(self.store.is_empty()).await? {
            return Err(PipelineError::EmptyIndex);
        }

        let vector = cancel
            .guard(self.retry.run("embed_query", || self.embedder.embed(query_text)))
            .await?
            .map_err(|failure| PipelineError::EmbeddingBackend {
                attempts: failure.attempts,
                source: failure.error,
            })?;

        let expected = self.embedder.dimensions();
        if vector.len() != expected {
            return Err(PipelineError::EmbeddingBackend {
                attempts: 1,
                source: BackendError::Dimension {
                    expected,
                    actual: vector.len(),
                },
            });
        }

        let hits = cancel
            .guard(self.read(self.store.query_nearest(&vector, k, scope)))
            .await??;

        debug!(
            k,
            scope = scope.unwrap_or("*"),
            hits = hits.len(),
            top_score = hits.first().map(|hit| hit.score),
            "retrieved segments"
        );

        Ok(hits.into_iter().map(ScoredSegment::from).collect())
    }

    async fn read<T>(
        &self,
        operation: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, PipelineError> {
        match tokio::time::timeout(self.store_timeout, operation).await {
            Ok(result) => result.map_err(PipelineError::IndexRead),
            Err(_) => Err(PipelineError::IndexRead(StoreError::Timeout(
                self.store_timeout,
            ))),
        }
    }
}
