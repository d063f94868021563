use crate::embeddings::EmbeddingBackend;
use crate::error::BackendError;
use crate::generation::GenerationBackend;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-ada-002";
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(60),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn client(&self) -> Result<Client, BackendError> {
        Ok(Client::builder().timeout(self.request_timeout).build()?)
    }
}

/// `/embeddings` endpoint of an OpenAI-compatible API.
pub struct OpenAiEmbeddings {
    config: OpenAiConfig,
    client: Client,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbeddings {
    pub fn new(
        config: OpenAiConfig,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: config.client()?,
            config,
            model: model.into(),
            dimensions,
        })
    }

    async fn request(&self, input: Value) -> Result<Value, BackendError> {
        let response = self
            .client
            .post(self.config.url("embeddings"))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "model": self.model, "input": input }))
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbeddings {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let parsed = self.request(json!(text)).await?;
        let mut vectors = parse_embeddings(&parsed, self.dimensions)?;
        match vectors.len() {
            1 => Ok(vectors.remove(0)),
            count => Err(BackendError::MalformedResponse(format!(
                "expected one embedding, got {count}"
            ))),
        }
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let parsed = self.request(json!(texts)).await?;
        let vectors = parse_embeddings(&parsed, self.dimensions)?;
        if vectors.len() != texts.len() {
            return Err(BackendError::MalformedResponse(format!(
                "embedding count {} doesn't match input count {}",
                vectors.len(),
                texts.len()
            )));
        }
        Ok(vectors)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// `/chat/completions` endpoint with a single user message and no streaming.
pub struct OpenAiChat {
    config: OpenAiConfig,
    client: Client,
    model: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(
        config: OpenAiConfig,
        model: impl Into<String>,
        temperature: f32,
    ) -> Result<Self, BackendError> {
        Ok(Self {
            client: config.client()?,
            config,
            model: model.into(),
            temperature,
        })
    }
}

#[async_trait]
impl GenerationBackend for OpenAiChat {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        let response = self
            .client
            .post(self.config.url("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.model,
                "temperature": self.temperature,
                "messages": [{ "role": "user", "content": prompt }],
            }))
            .send()
            .await?;

        let parsed = read_json(response).await?;
        parse_completion(&parsed)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

async fn read_json(response: Response) -> Result<Value, BackendError> {
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::RateLimited(body));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

fn parse_embeddings(parsed: &Value, dimensions: usize) -> Result<Vec<Vec<f32>>, BackendError> {
    let data = parsed
        .pointer("/data")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::MalformedResponse("missing data array".to_string()))?;

    let mut indexed = data
        .iter()
        .enumerate()
        .map(|(position, item)| {
            let index = item
                .pointer("/index")
                .and_then(Value::as_u64)
                .map_or(position, |index| index as usize);
            let vector = item
                .pointer("/embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| BackendError::MalformedResponse("missing embedding".to_string()))?
                .iter()
                .map(|value| {
                    value.as_f64().map(|value| value as f32).ok_or_else(|| {
                        BackendError::MalformedResponse("non-numeric embedding value".to_string())
                    })
                })
                .collect::<Result<Vec<f32>, BackendError>>()?;

            if vector.len() != dimensions {
                return Err(BackendError::Dimension {
                    expected: dimensions,
                    actual: vector.len(),
                });
            }
            Ok((index, vector))
        })
        .collect::<Result<Vec<_>, BackendError>>()?;

    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, vector)| vector).collect())
}

fn parse_completion(parsed: &Value) -> Result<String, BackendError> {
    parsed
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| BackendError::MalformedResponse("missing choices[0].message.content".to_string()))
}
