pub mod answerer;
pub mod backends;
pub mod cancel;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod generation;
pub mod indexer;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod retriever;
pub mod retry;
pub mod store;
pub mod stores;
pub mod traits;

#[cfg(test)]
pub(crate) mod test_support;

pub use answerer::{assemble_context, AssembledContext, Answerer, PromptTemplate};
pub use backends::{OpenAiChat, OpenAiConfig, OpenAiEmbeddings};
pub use cancel::CancelToken;
pub use chunking::{normalize_whitespace, reconstruct, split, ChunkingConfig};
pub use config::{IndexConfig, IndexMode, PipelineConfig, RetryConfig, TimeoutConfig};
pub use embeddings::{CharacterNgramEmbedder, EmbeddingBackend, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{BackendError, PipelineError, SourceError, StoreError};
pub use extractor::{DocumentSource, OcrEndpointConfig, PageText, PdfDocumentSource, SourceDocument};
pub use generation::GenerationBackend;
pub use indexer::Indexer;
pub use ingest::{discover_pdf_files, load_folder, FolderLoad, SkippedFile};
pub use models::{
    Answer, Document, IndexEntry, IngestResult, IngestionState, Provenance, Query, QueryState,
    ScoredEntry, ScoredSegment, Segment,
};
pub use orchestrator::PipelineCoordinator;
pub use retriever::Retriever;
pub use retry::RetryPolicy;
pub use stores::{JsonFileStore, MemoryStore};
pub use traits::VectorStore;
