use crate::cancel::CancelToken;
use crate::config::{CONTEXT_PLACEHOLDER, DEFAULT_PROMPT_TEMPLATE, QUESTION_PLACEHOLDER};
use crate::error::PipelineError;
use crate::generation::GenerationBackend;
use crate::models::{Answer, Segment};
use crate::retry::RetryPolicy;
use std::sync::Arc;
use tracing::{debug, info};

const SEGMENT_SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_PROMPT_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Result<Self, PipelineError> {
        let template = template.into();
        for placeholder in [QUESTION_PLACEHOLDER, CONTEXT_PLACEHOLDER] {
            if !template.contains(placeholder) {
                return Err(PipelineError::InvalidConfiguration(format!(
                    "prompt template is missing {placeholder}"
                )));
            }
        }
        Ok(Self { template })
    }

    /// Single left-to-right pass: text inserted for one placeholder is never expanded again.
    pub fn render(&self, question: &str, context: &str) -> String {
        let mut rendered = String::with_capacity(self.template.len() + question.len() + context.len());
        let mut rest = self.template.as_str();

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let tail = &rest[open..];
            if let Some(after) = tail.strip_prefix(QUESTION_PLACEHOLDER) {
                rendered.push_str(question);
                rest = after;
            } else if let Some(after) = tail.strip_prefix(CONTEXT_PLACEHOLDER) {
                rendered.push_str(context);
                rest = after;
            } else {
                rendered.push('{');
                rest = &tail[1..];
            }
        }

        rendered.push_str(rest);
        rendered
    }
}

/// Context text plus the ids of the segments that made it in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledContext {
    pub text: String,
    pub segment_ids: Vec<String>,
}

/// Joins segments in the given order and stops before the first one that would push the
/// total past `max_context_chars`; that segment and everything after it are dropped whole.
/// Any single segment longer than the limit is `ContextTooLarge`.
pub fn assemble_context(
    segments: &[Segment],
    max_context_chars: usize,
) -> Result<AssembledContext, PipelineError> {
    if let Some(oversized) = segments
        .iter()
        .find(|segment| segment.text.chars().count() > max_context_chars)
    {
        return Err(PipelineError::ContextTooLarge {
            segment_id: oversized.segment_id.clone(),
            length: oversized.text.chars().count(),
            limit: max_context_chars,
        });
    }

    let separator_chars = SEGMENT_SEPARATOR.chars().count();
    let mut text = String::new();
    let mut used = 0;
    let mut segment_ids = Vec::new();

    for segment in segments {
        let length = segment.text.chars().count();
        let needed = if segment_ids.is_empty() {
            length
        } else {
            length + separator_chars
        };
        if used + needed > max_context_chars {
            break;
        }
        if !segment_ids.is_empty() {
            text.push_str(SEGMENT_SEPARATOR);
        }
        text.push_str(&segment.text);
        used += needed;
        segment_ids.push(segment.segment_id.clone());
    }

    Ok(AssembledContext { text, segment_ids })
}

#[derive(Clone)]
pub struct Answerer {
    backend: Arc<dyn GenerationBackend>,
    template: PromptTemplate,
    retry: RetryPolicy,
}

impl Answerer {
    pub fn new(backend: Arc<dyn GenerationBackend>, template: PromptTemplate, retry: RetryPolicy) -> Self {
        Self {
            backend,
            template,
            retry,
        }
    }

    /// The exact prompt `answer` would send, with the segment ids it includes.
    pub fn build_prompt(
        &self,
        question: &str,
        context_segments: &[Segment],
        max_context_chars: usize,
    ) -> Result<(String, Vec<String>), PipelineError> {
        let context = assemble_context(context_segments, max_context_chars)?;
        Ok((self.template.render(question, &context.text), context.segment_ids))
    }

    pub async fn answer(
        &self,
        question: &str,
        context_segments: &[Segment],
        max_context_chars: usize,
        cancel: &CancelToken,
    ) -> Result<Answer, PipelineError> {
        let (prompt, segment_ids) = self.build_prompt(question, context_segments, max_context_chars)?;
        debug!(
            prompt_chars = prompt.chars().count(),
            used_segments = segment_ids.len(),
            offered_segments = context_segments.len(),
            "prompt assembled"
        );

        let text = cancel
            .guard(self.retry.run("generate", || self.backend.generate(&prompt)))
            .await?
            .map_err(|failure| PipelineError::GenerationBackend {
                attempts: failure.attempts,
                source: failure.error,
            })?;

        info!(
            backend = self.backend.name(),
            answer_chars = text.chars().count(),
            "answer generated"
        );

        Ok(Answer { text, segment_ids })
    }
}
