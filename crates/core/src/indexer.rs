use crate::cancel::CancelToken;
use crate::embeddings::EmbeddingBackend;
use crate::error::{BackendError, PipelineError};
use crate::models::{Document, IndexEntry, IngestResult, Provenance, Segment};
use crate::retry::RetryPolicy;
use crate::traits::VectorStore;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use tracing::{debug, info};

/// Embeds a document's segments and writes them to the index as one unit.
#[derive(Clone)]
pub struct Indexer {
    embedder: Arc<dyn EmbeddingBackend>,
    store: Arc<dyn VectorStore>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Indexer {
    pub fn new(
        embedder: Arc<dyn EmbeddingBackend>,
        store: Arc<dyn VectorStore>,
        retry: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            embedder,
            store,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// All embeddings are computed before anything is written, and the write is a
    /// single store upsert, so a failure or cancellation never leaves part of the
    /// document visible. A previous version of the document stays in place on failure.
    pub async fn ingest(
        &self,
        document: &Document,
        segments: &[Segment],
        cancel: &CancelToken,
    ) -> Result<IngestResult, PipelineError> {
        let vectors = cancel.guard(self.embed_segments(segments)).await??;
        debug!(
            document_id = %document.document_id,
            segments = vectors.len(),
            "segments embedded"
        );

        let provenance = Provenance {
            document_id: document.document_id.clone(),
            ingested_at: document.ingested_at,
        };
        let entries: Vec<IndexEntry> = segments
            .iter()
            .cloned()
            .zip(vectors)
            .map(|(segment, vector)| IndexEntry {
                segment,
                vector,
                provenance: provenance.clone(),
                insertion: 0,
            })
            .collect();

        // Last point at which cancellation is honoured; the upsert itself is atomic.
        cancel.check()?;

        // Not raced against a timeout; stores bound their own lock waits.
        let replaced = self
            .store
            .upsert(&document.document_id, entries)
            .await
            .map_err(|source| PipelineError::IndexWrite {
                document_id: document.document_id.clone(),
                source,
            })?;

        info!(
            document_id = %document.document_id,
            segments = segments.len(),
            replaced,
            store = self.store.name(),
            "document indexed"
        );

        Ok(IngestResult {
            document_id: document.document_id.clone(),
            segment_count: segments.len(),
            replaced_segments: replaced,
            dimensions: self.embedder.dimensions(),
        })
    }

    /// Removes every entry of `document_id`.
    pub async fn evict(&self, document_id: &str) -> Result<usize, PipelineError> {
        self.store
            .delete(document_id)
            .await
            .map_err(|source| PipelineError::IndexWrite {
                document_id: document_id.to_string(),
                source,
            })
    }

    pub async fn clear(&self) -> Result<(), PipelineError> {
        self.store.clear().await.map_err(|source| PipelineError::IndexWrite {
                document_id: "*".to_string(),
                source,
            })
    }

    /// Embeds segment texts in batches of `EMBED_BATCH_SIZE`, at most `concurrency`
    /// batches in flight. Each batch is retried as a unit.
    async fn embed_segments(&self, segments: &[Segment]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let expected = self.embedder.dimensions();
        let batches: Vec<Vec<String>> = segments
            .chunks(EMBED_BATCH_SIZE)
            .map(|batch| batch.iter().map(|segment| segment.text.clone()).collect())
            .collect();

        let embedder = self.embedder.clone();
        let retry = self.retry;
        let embedded: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(move |batch| embed_batch(embedder.clone(), retry, batch, expected))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        Ok(embedded.into_iter().flatten().collect())
    }
}

const EMBED_BATCH_SIZE: usize = 16;

async fn embed_batch(
    embedder: Arc<dyn EmbeddingBackend>,
    retry: RetryPolicy,
    texts: Vec<String>,
    expected: usize,
) -> Result<Vec<Vec<f32>>, PipelineError> {
    let vectors = retry
        .run("embed", || embedder.embed_batch(&texts))
        .await
        .map_err(|failure| PipelineError::EmbeddingBackend {
            attempts: failure.attempts,
            source: failure.error,
        })?;

    if vectors.len() != texts.len() {
        return Err(PipelineError::EmbeddingBackend {
            attempts: 1,
            source: BackendError::MalformedResponse(format!(
                "{} embeddings for {} segments",
                vectors.len(),
                texts.len()
            )),
        });
    }
    if let Some(vector) = vectors.iter().find(|vector| vector.len() != expected) {
        return Err(PipelineError::EmbeddingBackend {
            attempts: 1,
            source: BackendError::Dimension {
                expected,
                actual: vector.len(),
            },
        });
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::split;
    use crate::error::StoreError;
    use crate::stores::MemoryStore;
    use crate::test_support::{fast_retry, FailingEmbedder, CountingEmbedder};
    use std::sync::atomic::Ordering;

    fn indexer(embedder: Arc<dyn EmbeddingBackend>, store: Arc<MemoryStore>) -> Indexer {
        Indexer::new(embedder, store, fast_retry(), 4)
    }

    #[tokio::test]
    async fn ingest_writes_every_segment_with_provenance() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(Arc::new(CountingEmbedder::default()), store.clone());
        let document = Document::new("doc1", "a".repeat(1200));
        let segments = split("doc1", &document.raw_text, 500, 50).unwrap();

        let result = indexer
            .ingest(&document, &segments, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.segment_count, 3);
        assert_eq!(result.replaced_segments, 0);
        assert_eq!(store.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn reingest_replaces_previous_segments() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(Arc::new(CountingEmbedder::default()), store.clone());

        let first = Document::new("doc1", "x".repeat(1200));
        let segments = split("doc1", &first.raw_text, 500, 50).unwrap();
        indexer.ingest(&first, &segments, &CancelToken::new()).await.unwrap();

        let second = Document::new("doc1", "0123456789");
        let segments = split("doc1", &second.raw_text, 500, 50).unwrap();
        let result = indexer
            .ingest(&second, &segments, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(result.replaced_segments, 3);
        assert_eq!(store.len().await.unwrap(), 1);
        let hits = store.query_nearest(&[1.0; 8], 10, Some("doc1")).await.unwrap();
        assert_eq!(hits[0].entry.segment.text, "0123456789");
    }

    #[tokio::test]
    async fn embedding_failure_leaves_previous_version_visible() {
        let store = Arc::new(MemoryStore::new());
        let good = indexer(Arc::new(CountingEmbedder::default()), store.clone());
        let original = Document::new("doc1", "original text");
        let segments = split("doc1", &original.raw_text, 500, 50).unwrap();
        good.ingest(&original, &segments, &CancelToken::new()).await.unwrap();

        let failing = FailingEmbedder::failing_after(2, true);
        let calls = failing.calls.clone();
        let bad = indexer(Arc::new(failing), store.clone());
        let replacement = Document::new("doc1", "r".repeat(2000));
        let segments = split("doc1", &replacement.raw_text, 500, 50).unwrap();

        let result = bad.ingest(&replacement, &segments, &CancelToken::new()).await;

        assert!(matches!(
            result,
            Err(PipelineError::EmbeddingBackend { attempts: 3, .. })
        ));
        assert!(calls.load(Ordering::SeqCst) >= 3);
        let hits = store.query_nearest(&[1.0; 8], 10, None).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.segment.text, "original text");
    }

    #[tokio::test]
    async fn permanent_embedding_failure_is_not_retried() {
        let store = Arc::new(MemoryStore::new());
        let failing = FailingEmbedder::failing_after(0, false);
        let calls = failing.calls.clone();
        let indexer = Indexer::new(Arc::new(failing), store.clone(), fast_retry(), 1);
        let document = Document::new("doc1", "some text");
        let segments = split("doc1", &document.raw_text, 500, 50).unwrap();

        let result = indexer.ingest(&document, &segments, &CancelToken::new()).await;

        assert!(matches!(
            result,
            Err(PipelineError::EmbeddingBackend { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_index_write_error() {
        let store = Arc::new(MemoryStore::new());
        let narrow = indexer(Arc::new(CountingEmbedder::with_dimensions(8)), store.clone());
        let wide = indexer(Arc::new(CountingEmbedder::with_dimensions(16)), store.clone());

        let first = Document::new("doc1", "first document");
        let segments = split("doc1", &first.raw_text, 500, 50).unwrap();
        narrow.ingest(&first, &segments, &CancelToken::new()).await.unwrap();

        let second = Document::new("doc2", "second document");
        let segments = split("doc2", &second.raw_text, 500, 50).unwrap();
        let result = wide.ingest(&second, &segments, &CancelToken::new()).await;

        match result {
            Err(PipelineError::IndexWrite { document_id, source }) => {
                assert_eq!(document_id, "doc2");
                assert!(matches!(source, StoreError::DimensionMismatch { .. }));
            }
            other => panic!("expected index write error, got {other:?}"),
        }
        assert!(!store.contains_document("doc2").await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_ingestion_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(Arc::new(CountingEmbedder::default()), store.clone());
        let document = Document::new("doc1", "text that never lands");
        let segments = split("doc1", &document.raw_text, 5, 1).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = indexer.ingest(&document, &segments, &cancel).await;

        assert!(matches!(result, Err(PipelineError::Cancelled)));
        assert!(store.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn segments_are_embedded_in_batches() {
        let store = Arc::new(MemoryStore::new());
        let embedder = CountingEmbedder::default();
        let (calls, batches) = (embedder.calls.clone(), embedder.batches.clone());
        let indexer = indexer(Arc::new(embedder), store.clone());
        let document = Document::new("doc1", "b".repeat(40 * 450 + 50));
        let segments = split("doc1", &document.raw_text, 500, 50).unwrap();
        assert_eq!(segments.len(), 40);

        indexer
            .ingest(&document, &segments, &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(batches.load(Ordering::SeqCst), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 40);
        let hits = store.query_nearest(&[1.0; 8], 40, Some("doc1")).await.unwrap();
        let mut sequences: Vec<usize> = hits.iter().map(|hit| hit.entry.segment.sequence).collect();
        sequences.sort_unstable();
        assert_eq!(sequences, (0..40).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingestion_runs_on_spawned_tasks() {
        let store = Arc::new(MemoryStore::new());
        let indexer = indexer(Arc::new(CountingEmbedder::default()), store.clone());

        let tasks: Vec<_> = (0..4)
            .map(|index| {
                let indexer = indexer.clone();
                tokio::spawn(async move {
                    let document_id = format!("doc{index}");
                    let document = Document::new(&document_id, "c".repeat(1200));
                    let segments = split(&document_id, &document.raw_text, 500, 50)?;
                    indexer.ingest(&document, &segments, &CancelToken::new()).await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().segment_count, 3);
        }
        assert_eq!(store.len().await.unwrap(), 12);
    }
}
