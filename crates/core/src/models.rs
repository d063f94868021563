use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An ingested source file. Owned by the coordinator for one ingestion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub raw_text: String,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    pub fn new(document_id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            raw_text: raw_text.into(),
            ingested_at: Utc::now(),
        }
    }
}

/// A contiguous slice of a document's text. Offsets are in characters, end exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: String,
    pub document_id: String,
    pub sequence: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub target_length: usize,
    pub overlap: usize,
}

impl Segment {
    pub fn char_len(&self) -> usize {
        self.end - self.start
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub document_id: String,
    pub ingested_at: DateTime<Utc>,
}

/// One row of the vector index. `insertion` is assigned by the store and orders ties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub segment: Segment,
    pub vector: Vec<f32>,
    pub provenance: Provenance,
    #[serde(default)]
    pub insertion: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: IndexEntry,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredSegment {
    pub segment: Segment,
    pub provenance: Provenance,
    pub score: f32,
}

impl From<ScoredEntry> for ScoredSegment {
    fn from(value: ScoredEntry) -> Self {
        Self {
            segment: value.entry.segment,
            provenance: value.entry.provenance,
            score: value.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub question: String,
    pub top_k: usize,
    pub document_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub segment_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestResult {
    pub document_id: String,
    pub segment_count: usize,
    pub replaced_segments: usize,
    pub dimensions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IngestionState {
    Received,
    Chunking,
    Embedding,
    Indexed,
    Failed,
}

impl IngestionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Indexed | Self::Failed)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use IngestionState::*;
        matches!(
            (self, next),
            (Received, Chunking)
                | (Chunking, Embedding)
                | (Embedding, Indexed)
                | (Received | Chunking | Embedding, Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryState {
    Received,
    Retrieving,
    Answering,
    Answered,
    Failed,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Answered | Self::Failed)
    }

    pub fn can_advance_to(self, next: Self) -> bool {
        use QueryState::*;
        matches!(
            (self, next),
            (Received, Retrieving)
                | (Retrieving, Answering)
                | (Answering, Answered)
                | (Received | Retrieving | Answering, Failed)
        )
    }
}
