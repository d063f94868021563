use crate::embeddings::{CharacterNgramEmbedder, EmbeddingBackend};
use crate::error::BackendError;
use crate::generation::GenerationBackend;
use crate::models::{IndexEntry, Provenance, Segment};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        call_timeout: Duration::from_secs(2),
    }
}

pub fn segment(document_id: &str, sequence: usize, text: &str) -> Segment {
    let length = text.chars().count();
    Segment {
        segment_id: format!("{document_id}-{sequence}"),
        document_id: document_id.to_string(),
        sequence,
        text: text.to_string(),
        start: 0,
        end: length,
        target_length: length.max(1),
        overlap: 0,
    }
}

pub fn entry(document_id: &str, sequence: usize, vector: Vec<f32>) -> IndexEntry {
    IndexEntry {
        segment: segment(document_id, sequence, "text"),
        vector,
        provenance: Provenance {
            document_id: document_id.to_string(),
            ingested_at: Utc::now(),
        },
        insertion: 0,
    }
}

/// Trigram embedder that counts calls and can be slowed down.
#[derive(Debug, Clone)]
pub struct CountingEmbedder {
    inner: CharacterNgramEmbedder,
    pub calls: Arc<AtomicU32>,
    pub batches: Arc<AtomicU32>,
    pub delay: Option<Duration>,
}

impl Default for CountingEmbedder {
    fn default() -> Self {
        Self::with_dimensions(8)
    }
}

impl CountingEmbedder {
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            inner: CharacterNgramEmbedder { dimensions },
            calls: Arc::new(AtomicU32::new(0)),
            batches: Arc::new(AtomicU32::new(0)),
            delay: None,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

#[async_trait]
impl EmbeddingBackend for CountingEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.inner.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Succeeds for the first `succeed_first` calls, then fails every call.
#[derive(Debug, Clone)]
pub struct FailingEmbedder {
    inner: CharacterNgramEmbedder,
    succeed_first: u32,
    transient: bool,
    pub calls: Arc<AtomicU32>,
}

impl FailingEmbedder {
    pub fn failing_after(succeed_first: u32, transient: bool) -> Self {
        Self {
            inner: CharacterNgramEmbedder { dimensions: 8 },
            succeed_first,
            transient,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for FailingEmbedder {
    fn dimensions(&self) -> usize {
        self.inner.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.succeed_first {
            return Ok(self.inner.embed_sync(text));
        }
        if self.transient {
            Err(BackendError::RateLimited("try again later".to_string()))
        } else {
            Err(BackendError::Status {
                status: 401,
                body: "invalid api key".to_string(),
            })
        }
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Records every prompt and answers with a fixed reply.
#[derive(Debug, Clone)]
pub struct RecordingGenerator {
    pub prompts: Arc<Mutex<Vec<String>>>,
    reply: String,
}

impl RecordingGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            prompts: Arc::new(Mutex::new(Vec::new())),
            reply: reply.to_string(),
        }
    }
}

#[async_trait]
impl GenerationBackend for RecordingGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        self.prompts.lock().push(prompt.to_string());
        Ok(self.reply.clone())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

#[derive(Debug, Clone)]
pub struct FailingGenerator {
    pub calls: Arc<AtomicU32>,
    transient: bool,
}

impl FailingGenerator {
    pub fn new(transient: bool) -> Self {
        Self {
            calls: Arc::new(AtomicU32::new(0)),
            transient,
        }
    }
}

#[async_trait]
impl GenerationBackend for FailingGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            Err(BackendError::Status {
                status: 502,
                body: "bad gateway".to_string(),
            })
        } else {
            Err(BackendError::MalformedResponse("no choices".to_string()))
        }
    }

    fn name(&self) -> &str {
        "failing"
    }
}
