use crate::error::PipelineError;
use crate::models::Segment;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub target_length: usize,
    pub overlap: usize,
}

impl ChunkingConfig {
    pub fn new(target_length: usize, overlap: usize) -> Result<Self, PipelineError> {
        if target_length == 0 {
            return Err(PipelineError::InvalidConfiguration(
                "chunk target length must be greater than zero".to_string(),
            ));
        }
        if overlap >= target_length {
            return Err(PipelineError::InvalidConfiguration(format!(
                "chunk overlap {overlap} must be smaller than target length {target_length}"
            )));
        }
        Ok(Self {
            target_length,
            overlap,
        })
    }

    fn stride(&self) -> usize {
        self.target_length - self.overlap
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Slides a `target_length` character window over `text`, advancing by
/// `target_length - overlap`. The last window may be shorter. Empty text yields no segments.
pub fn split(
    document_id: &str,
    text: &str,
    target_length: usize,
    overlap: usize,
) -> Result<Vec<Segment>, PipelineError> {
    let config = ChunkingConfig::new(target_length, overlap)?;
    Ok(split_with(document_id, text, config))
}

pub fn split_with(document_id: &str, text: &str, config: ChunkingConfig) -> Vec<Segment> {
    let chars: Vec<char> = text.chars().collect();
    let mut segments = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + config.target_length).min(chars.len());
        let piece: String = chars[start..end].iter().collect();
        let sequence = segments.len();

        segments.push(Segment {
            segment_id: make_segment_id(document_id, sequence, &piece),
            document_id: document_id.to_string(),
            sequence,
            text: piece,
            start,
            end,
            target_length: config.target_length,
            overlap: config.overlap,
        });

        if end == chars.len() {
            break;
        }
        start += config.stride();
    }

    segments
}

/// Rebuilds the source text from an ordered run of segments of one document,
/// dropping the leading overlap of every segment after the first.
pub fn reconstruct(segments: &[Segment]) -> String {
    let mut text = String::new();
    let mut covered: usize = 0;

    for segment in segments {
        let skip = covered.saturating_sub(segment.start);
        text.extend(segment.text.chars().skip(skip));
        covered = covered.max(segment.end);
    }

    text
}

fn make_segment_id(document_id: &str, sequence: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update((sequence as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
