//! Pipeline configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it changes.

use crate::chunking::ChunkingConfig;
use crate::error::PipelineError;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const QUESTION_PLACEHOLDER: &str = "{question}";
pub const CONTEXT_PLACEHOLDER: &str = "{context}";

pub const DEFAULT_PROMPT_TEMPLATE: &str = "You are a very powerful assistant for question-answering tasks. \
Use only the following pieces of retrieved context to answer the question. \
If the context does not contain the answer, say that you don't know instead of guessing. \
Respond in the language of the question.\n\
Question: {question}\n\
Context: {context}\n\
Answer:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    /// Keep entries written by earlier runs.
    #[default]
    Accumulate,
    /// Drop every entry when the index is opened.
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub path: PathBuf,
    pub mode: IndexMode,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("vectordb").join("index.json"),
            mode: IndexMode::Accumulate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub embed_secs: u64,
    pub generate_secs: u64,
    pub store_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            embed_secs: 30,
            generate_secs: 60,
            store_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub max_context_chars: usize,
    pub prompt_template: String,
    pub model_name: String,
    pub temperature: f32,
    pub embedding_concurrency: usize,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub index: IndexConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 4,
            max_context_chars: 3_000,
            prompt_template: DEFAULT_PROMPT_TEMPLATE.to_string(),
            model_name: "gpt-3.5-turbo".to_string(),
            temperature: 0.0,
            embedding_concurrency: 4,
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, PipelineError> {
        toml::from_str(raw).map_err(|error| {
            PipelineError::InvalidConfiguration(format!("unreadable config: {error}"))
        })
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = std::fs::read_to_string(path).map_err(|error| {
            PipelineError::InvalidConfiguration(format!(
                "cannot read config {}: {error}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.chunking()?;

        let invalid = |message: String| -> Result<(), PipelineError> {
            Err(PipelineError::InvalidConfiguration(message))
        };
        if self.top_k == 0 {
            return invalid("top_k must be at least 1".to_string());
        }
        if self.max_context_chars == 0 {
            return invalid("max_context_chars must be greater than zero".to_string());
        }
        for placeholder in [QUESTION_PLACEHOLDER, CONTEXT_PLACEHOLDER] {
            if !self.prompt_template.contains(placeholder) {
                return invalid(format!("prompt_template is missing {placeholder}"));
            }
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return invalid(format!(
                "temperature {} is outside 0.0..=2.0",
                self.temperature
            ));
        }
        if self.model_name.trim().is_empty() {
            return invalid("model_name is empty".to_string());
        }
        if self.embedding_concurrency == 0 {
            return invalid("embedding_concurrency must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn chunking(&self) -> Result<ChunkingConfig, PipelineError> {
        ChunkingConfig::new(self.chunk_size, self.chunk_overlap)
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            call_timeout: Duration::from_secs(self.timeouts.embed_secs),
        }
    }

    pub fn embed_retry(&self) -> RetryPolicy {
        self.retry_policy()
            .with_timeout(Duration::from_secs(self.timeouts.embed_secs))
    }

    pub fn generate_retry(&self) -> RetryPolicy {
        self.retry_policy()
            .with_timeout(Duration::from_secs(self.timeouts.generate_secs))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.store_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.top_k, 4);
        assert_eq!(config.index.mode, IndexMode::Accumulate);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            chunk_size = 800
            top_k = 6

            [index]
            mode = "reset"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.chunk_size, 800);
        assert_eq!(config.chunk_overlap, 50);
        assert_eq!(config.top_k, 6);
        assert_eq!(config.index.mode, IndexMode::Reset);
        assert_eq!(config.index.path, IndexConfig::default().path);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 500);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cases = [
            PipelineConfig {
                chunk_overlap: 500,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                top_k: 0,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                prompt_template: "Question: {question}".to_string(),
                ..PipelineConfig::default()
            },
            PipelineConfig {
                temperature: 3.5,
                ..PipelineConfig::default()
            },
            PipelineConfig {
                embedding_concurrency: 0,
                ..PipelineConfig::default()
            },
        ];

        for config in cases {
            assert!(matches!(
                config.validate(),
                Err(PipelineError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn retry_policies_use_their_own_timeouts() {
        let config = PipelineConfig::default();
        assert_eq!(config.embed_retry().call_timeout, Duration::from_secs(30));
        assert_eq!(config.generate_retry().call_timeout, Duration::from_secs(60));
        assert_eq!(config.embed_retry().max_attempts, 3);
    }
}
