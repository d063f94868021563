use crate::answerer::{Answerer, PromptTemplate};
use crate::cancel::CancelToken;
use crate::chunking::{split_with, ChunkingConfig};
use crate::config::PipelineConfig;
use crate::embeddings::EmbeddingBackend;
use crate::error::PipelineError;
use crate::generation::GenerationBackend;
use crate::indexer::Indexer;
use crate::models::{Answer, Document, IngestResult, IngestionState, Query, QueryState, Segment};
use crate::retriever::Retriever;
use crate::traits::VectorStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct DocumentSlot {
    state: Arc<watch::Sender<IngestionState>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

/// Runs ingestion (chunk, embed, index) and query (retrieve, answer) requests.
/// Each call is an independent pipeline; callers share one coordinator behind an `Arc`.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    chunking: ChunkingConfig,
    indexer: Indexer,
    retriever: Retriever,
    answerer: Answerer,
    store: Arc<dyn VectorStore>,
    documents: Mutex<HashMap<String, DocumentSlot>>,
}

impl PipelineCoordinator {
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn EmbeddingBackend>,
        generator: Arc<dyn GenerationBackend>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let chunking = config.chunking()?;
        let template = PromptTemplate::new(config.prompt_template.clone())?;

        let indexer = Indexer::new(
            embedder.clone(),
            store.clone(),
            config.embed_retry(),
            config.embedding_concurrency,
        );
        let retriever = Retriever::new(
            embedder,
            store.clone(),
            config.embed_retry(),
            config.store_timeout(),
        );
        let answerer = Answerer::new(generator, template, config.generate_retry());

        Ok(Self {
            config,
            chunking,
            indexer,
            retriever,
            answerer,
            store,
            documents: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn ingest(
        &self,
        document_id: &str,
        raw_text: &str,
    ) -> Result<IngestResult, PipelineError> {
        self.ingest_with_cancel(document_id, raw_text, &CancelToken::new())
            .await
    }

    /// Re-ingesting an id replaces its segments. Ingestions of one id run one at a time;
    /// different ids proceed in parallel.
    pub async fn ingest_with_cancel(
        &self,
        document_id: &str,
        raw_text: &str,
        cancel: &CancelToken,
    ) -> Result<IngestResult, PipelineError> {
        if document_id.trim().is_empty() {
            return Err(PipelineError::InvalidConfiguration(
                "document id is empty".to_string(),
            ));
        }

        let (state, write_lock, fresh) = self.slot(document_id);
        let _serialized = match cancel.guard(write_lock.clone().lock_owned()).await {
            Ok(guard) => guard,
            Err(error) => {
                // Never started: a slot this call created and nobody else uses is dropped again.
                if fresh {
                    self.forget_idle_slot(document_id, &write_lock);
                }
                return Err(error);
            }
        };
        let tracker = IngestionTracker::start(document_id, state);

        let result = self.run_ingestion(&tracker, document_id, raw_text, cancel).await;
        match &result {
            Ok(outcome) => {
                tracker.advance(IngestionState::Indexed);
                info!(
                    document_id,
                    segments = outcome.segment_count,
                    replaced = outcome.replaced_segments,
                    "ingestion finished"
                );
            }
            Err(error) => {
                tracker.advance(IngestionState::Failed);
                warn!(document_id, kind = error.kind(), error = %error, "ingestion failed");
            }
        }
        result
    }

    async fn run_ingestion(
        &self,
        tracker: &IngestionTracker,
        document_id: &str,
        raw_text: &str,
        cancel: &CancelToken,
    ) -> Result<IngestResult, PipelineError> {
        cancel.check()?;
        let document = Document::new(document_id, raw_text);

        tracker.advance(IngestionState::Chunking);
        let segments = split_with(&document.document_id, &document.raw_text, self.chunking);
        debug!(
            document_id,
            chars = document.raw_text.chars().count(),
            segments = segments.len(),
            "document chunked"
        );

        tracker.advance(IngestionState::Embedding);
        self.indexer.ingest(&document, &segments, cancel).await
    }

    pub async fn query(&self, question: &str, top_k: Option<usize>) -> Result<Answer, PipelineError> {
        self.query_with_cancel(question, top_k, &CancelToken::new())
            .await
    }

    pub async fn query_with_cancel(
        &self,
        question: &str,
        top_k: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<Answer, PipelineError> {
        let query = self.build_query(question, top_k, None);
        self.run_query(&query, cancel).await
    }

    /// Answers from one document only. If that document is being ingested, waits for
    /// the ingestion to finish first so it never reads a half-built document.
    pub async fn query_document(
        &self,
        document_id: &str,
        question: &str,
        top_k: Option<usize>,
        cancel: &CancelToken,
    ) -> Result<Answer, PipelineError> {
        self.await_indexed(document_id, cancel).await?;
        let query = self.build_query(question, top_k, Some(document_id));
        self.run_query(&query, cancel).await
    }

    pub fn ingestion_state(&self, document_id: &str) -> Option<IngestionState> {
        self.documents
            .lock()
            .get(document_id)
            .map(|slot| *slot.state.borrow())
    }

    /// Removes a document's entries. Waits for an in-flight ingestion of the same id,
    /// then forgets the document's ingestion state.
    pub async fn evict(&self, document_id: &str) -> Result<usize, PipelineError> {
        let write_lock = self
            .documents
            .lock()
            .get(document_id)
            .map(|slot| slot.write_lock.clone());
        let serialized = match write_lock {
            Some(lock) => Some(lock.lock_owned().await),
            None => None,
        };

        let removed = self.indexer.evict(document_id).await?;
        if let Some(guard) = serialized {
            let lock = tokio::sync::OwnedMutexGuard::mutex(&guard).clone();
            drop(guard);
            self.forget_idle_slot(document_id, &lock);
        }
        info!(document_id, removed, "document evicted");
        Ok(removed)
    }

    /// Empties the index and forgets every document not currently being ingested.
    pub async fn clear_index(&self) -> Result<(), PipelineError> {
        self.indexer.clear().await?;
        self.documents
            .lock()
            .retain(|_, slot| Arc::strong_count(&slot.write_lock) > 1);
        info!(store = self.store.name(), "index cleared");
        Ok(())
    }

    fn build_query(&self, question: &str, top_k: Option<usize>, document_id: Option<&str>) -> Query {
        Query {
            question: question.to_string(),
            top_k: top_k.unwrap_or(self.config.top_k),
            document_id: document_id.map(str::to_string),
        }
    }

    async fn run_query(&self, query: &Query, cancel: &CancelToken) -> Result<Answer, PipelineError> {
        let mut state = QueryState::Received;
        let result = self.run_query_steps(query, &mut state, cancel).await;

        match &result {
            Ok(answer) => {
                advance_query(&mut state, QueryState::Answered);
                info!(
                    top_k = query.top_k,
                    segments = answer.segment_ids.len(),
                    "query answered"
                );
            }
            Err(error) => {
                advance_query(&mut state, QueryState::Failed);
                warn!(kind = error.kind(), error = %error, "query failed");
            }
        }
        result
    }

    async fn run_query_steps(
        &self,
        query: &Query,
        state: &mut QueryState,
        cancel: &CancelToken,
    ) -> Result<Answer, PipelineError> {
        cancel.check()?;

        advance_query(state, QueryState::Retrieving);
        let hits = self
            .retriever
            .retrieve_scoped(
                &query.question,
                query.top_k,
                query.document_id.as_deref(),
                cancel,
            )
            .await?;

        advance_query(state, QueryState::Answering);
        let segments: Vec<Segment> = hits.into_iter().map(|hit| hit.segment).collect();
        self.answerer
            .answer(
                &query.question,
                &segments,
                self.config.max_context_chars,
                cancel,
            )
            .await
    }

    async fn await_indexed(&self, document_id: &str, cancel: &CancelToken) -> Result<(), PipelineError> {
        let write_lock = self
            .documents
            .lock()
            .get(document_id)
            .map(|slot| slot.write_lock.clone());

        if let Some(lock) = write_lock {
            // Ingestions hold the lock until they settle; taking it means none is in flight.
            drop(cancel.guard(lock.lock_owned()).await?);
            debug!(document_id, state = ?self.ingestion_state(document_id), "ingestion settled before query");
        }

        let indexed = tokio::time::timeout(
            self.config.store_timeout(),
            self.store.contains_document(document_id),
        )
        .await
        .map_err(|_| {
            PipelineError::IndexRead(crate::error::StoreError::Timeout(self.config.store_timeout()))
        })?
        .map_err(PipelineError::IndexRead)?;

        if indexed {
            Ok(())
        } else {
            Err(PipelineError::UnknownDocument(document_id.to_string()))
        }
    }

    /// The document's slot, created on first use. `fresh` is true when this call created it.
    fn slot(&self, document_id: &str) -> (Arc<watch::Sender<IngestionState>>, Arc<tokio::sync::Mutex<()>>, bool) {
        let mut documents = self.documents.lock();
        let fresh = !documents.contains_key(document_id);
        let slot = documents
            .entry(document_id.to_string())
            .or_insert_with(|| DocumentSlot {
                state: Arc::new(watch::channel(IngestionState::Received).0),
                write_lock: Arc::new(tokio::sync::Mutex::new(())),
            });
        (slot.state.clone(), slot.write_lock.clone(), fresh)
    }

    /// Drops the slot for `document_id` if `lock` is its lock and the caller holds
    /// the only reference besides the map.
    fn forget_idle_slot(&self, document_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut documents = self.documents.lock();
        let idle = documents.get(document_id).is_some_and(|slot| {
            Arc::ptr_eq(&slot.write_lock, lock) && Arc::strong_count(lock) == 2
        });
        if idle {
            documents.remove(document_id);
        }
    }
}

struct IngestionTracker {
    document_id: String,
    state: Arc<watch::Sender<IngestionState>>,
}

impl IngestionTracker {
    fn start(document_id: &str, state: Arc<watch::Sender<IngestionState>>) -> Self {
        state.send_replace(IngestionState::Received);
        debug!(document_id, state = ?IngestionState::Received, "ingestion state");
        Self {
            document_id: document_id.to_string(),
            state,
        }
    }

    fn advance(&self, next: IngestionState) {
        let current = *self.state.borrow();
        debug_assert!(
            current.can_advance_to(next),
            "illegal ingestion transition {current:?} -> {next:?}"
        );
        self.state.send_replace(next);
        debug!(document_id = %self.document_id, state = ?next, "ingestion state");
    }
}

fn advance_query(state: &mut QueryState, next: QueryState) {
    debug_assert!(
        state.can_advance_to(next),
        "illegal query transition {state:?} -> {next:?}"
    );
    *state = next;
    debug!(state = ?next, "query state");
}
