use crate::error::StoreError;
use crate::models::{IndexEntry, ScoredEntry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Entries of an index plus the counters needed to keep ordering stable across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexState {
    pub dimensions: Option<usize>,
    pub next_insertion: u64,
    pub entries: Vec<IndexEntry>,
}

impl IndexState {
    pub fn replace_document(
        &mut self,
        document_id: &str,
        mut entries: Vec<IndexEntry>,
    ) -> Result<usize, StoreError> {
        let remaining = self
            .entries
            .iter()
            .filter(|entry| entry.provenance.document_id != document_id)
            .count();
        let expected = if remaining == 0 {
            entries.first().map(|entry| entry.vector.len())
        } else {
            self.dimensions
        };

        if let Some(expected) = expected {
            if let Some(bad) = entries.iter().find(|entry| entry.vector.len() != expected) {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: bad.vector.len(),
                });
            }
        }

        let replaced = self.remove_document(document_id);
        for entry in &mut entries {
            entry.insertion = self.next_insertion;
            self.next_insertion += 1;
        }
        self.entries.extend(entries);
        self.dimensions = if self.entries.is_empty() { None } else { expected };
        Ok(replaced)
    }

    pub fn remove_document(&mut self, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| entry.provenance.document_id != document_id);
        if self.entries.is_empty() {
            self.dimensions = None;
        }
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.dimensions = None;
    }

    pub fn contains_document(&self, document_id: &str) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.provenance.document_id == document_id)
    }

    pub fn nearest(
        &self,
        vector: &[f32],
        k: usize,
        scope: Option<&str>,
    ) -> Result<Vec<ScoredEntry>, StoreError> {
        if let Some(expected) = self.dimensions {
            if vector.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
        }

        let mut scored: Vec<ScoredEntry> = self
            .entries
            .iter()
            .filter(|entry| scope.map_or(true, |id| entry.provenance.document_id == id))
            .map(|entry| ScoredEntry {
                score: cosine_similarity(vector, &entry.vector),
                entry: entry.clone(),
            })
            .collect();

        scored.sort_by(|left, right| match right.score.total_cmp(&left.score) {
            Ordering::Equal => left.entry.insertion.cmp(&right.entry.insertion),
            other => other,
        });
        scored.truncate(k);
        Ok(scored)
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    let dot: f32 = left.iter().zip(right).map(|(a, b)| a * b).sum();
    let left_norm = left.iter().map(|value| value * value).sum::<f32>().sqrt();
    let right_norm = right.iter().map(|value| value * value).sum::<f32>().sqrt();
    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm * right_norm)
}
