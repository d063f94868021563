use crate::error::BackendError;
use async_trait::async_trait;

/// Single request/response text generation.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;

    fn name(&self) -> &str;
}
