use std::time::Duration;
use thiserror::Error;

/// Failure of a single embedding or generation call.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("vector has dimension {actual}, expected {expected}")]
    Dimension { expected: usize, actual: usize },
}

impl BackendError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408,
            Self::Http(error) => error.is_timeout() || error.is_connect(),
            Self::MalformedResponse(_) | Self::Dimension { .. } => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("vector dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by the pipeline. The coordinator passes these through unchanged,
/// so callers always see the kind raised by the component that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("embedding backend failed after {attempts} attempt(s): {source}")]
    EmbeddingBackend {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("generation backend failed after {attempts} attempt(s): {source}")]
    GenerationBackend {
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("index write failed for document {document_id}: {source}")]
    IndexWrite {
        document_id: String,
        #[source]
        source: StoreError,
    },

    #[error("index read failed: {0}")]
    IndexRead(#[source] StoreError),

    #[error("the index has no entries; ingest a document first")]
    EmptyIndex,

    #[error("segment {segment_id} has {length} chars, above max_context_chars={limit}")]
    ContextTooLarge {
        segment_id: String,
        length: usize,
        limit: usize,
    },

    #[error("document {0} is not indexed")]
    UnknownDocument(String),

    #[error("request was cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Short stable name of the error kind, used in logs and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration(_) => "invalid_configuration",
            Self::EmbeddingBackend { .. } => "embedding_backend",
            Self::GenerationBackend { .. } => "generation_backend",
            Self::IndexWrite { .. } => "index_write",
            Self::IndexRead(_) => "index_read",
            Self::EmptyIndex => "empty_index",
            Self::ContextTooLarge { .. } => "context_too_large",
            Self::UnknownDocument(_) => "unknown_document",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors raised while turning an uploaded file into raw text.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("multimodal OCR failed: {0}")]
    OcrFailed(String),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
