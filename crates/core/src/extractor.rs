use crate::chunking::normalize_whitespace;
use crate::error::SourceError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document as PdfFile;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

/// Raw text of one uploaded file, ready for the pipeline.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub document_id: String,
    pub source_path: PathBuf,
    pub raw_text: String,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn load(&self, path: &Path) -> Result<SourceDocument, SourceError>;
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Reads PDF page text with lopdf. When the file has no text layer and OCR is
/// configured, the PDF is sent to a multimodal OCR endpoint instead.
#[derive(Debug, Clone, Default)]
pub struct PdfDocumentSource {
    ocr: Option<OcrEndpointConfig>,
}

impl PdfDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ocr(ocr: OcrEndpointConfig) -> Self {
        Self { ocr: Some(ocr) }
    }

    pub async fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, SourceError> {
        let owned = path.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_text_layer(&owned))
            .await
            .map_err(|error| SourceError::PdfParse(format!("extraction task failed: {error}")))?;

        match extracted {
            Ok(pages) => Ok(pages),
            Err(SourceError::PdfParse(parse_error)) => match &self.ocr {
                Some(ocr) => {
                    tracing::info!(path = %path.display(), "no text layer, trying OCR fallback");
                    extract_with_llm_ocr(ocr, path).await.map_err(|ocr_error| {
                        SourceError::PdfParse(format!(
                            "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                        ))
                    })
                }
                None => Err(SourceError::PdfParse(parse_error)),
            },
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl DocumentSource for PdfDocumentSource {
    async fn load(&self, path: &Path) -> Result<SourceDocument, SourceError> {
        if path.file_name().is_none() {
            return Err(SourceError::MissingFileName(path.display().to_string()));
        }

        let pages = self.extract_pages(path).await?;
        let raw_text = pages
            .iter()
            .map(|page| normalize_whitespace(&page.text))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(SourceDocument {
            document_id: generate_document_id(path),
            source_path: path.to_path_buf(),
            raw_text,
        })
    }
}

pub fn generate_document_id(path: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn extract_text_layer(path: &Path) -> Result<Vec<PageText>, SourceError> {
    let document = PdfFile::load(path).map_err(|error| SourceError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| SourceError::PdfParse(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(PageText {
                number: page_no,
                text,
            });
        }
    }

    if pages.is_empty() {
        return Err(SourceError::PdfParse(format!(
            "pdf had no readable page text: {}",
            path.display()
        )));
    }

    Ok(pages)
}

async fn extract_with_llm_ocr(
    config: &OcrEndpointConfig,
    path: &Path,
) -> Result<Vec<PageText>, SourceError> {
    let pdf = tokio::fs::read(path).await?;
    let payload = LlmOcrRequest {
        pdf_base64: STANDARD.encode(pdf),
        source_path: path.to_string_lossy().to_string(),
    };

    let client = Client::builder().timeout(config.timeout).build()?;
    let mut request = client
        .post(&config.endpoint)
        .header("content-type", "application/json")
        .json(&payload);

    if let Some(api_key) = &config.api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request.send().await?;

    if !response.status().is_success() {
        return Err(SourceError::OcrFailed(format!(
            "multimodal OCR request to {} returned {}",
            config.endpoint,
            response.status()
        )));
    }

    let payload: LlmOcrResponse = response.json().await?;
    payload_to_pages(&payload, path)
}

fn ocr_page(number: u32, text: &str) -> Option<PageText> {
    let text = text.trim();
    (!text.is_empty()).then(|| PageText {
        number,
        text: text.to_string(),
    })
}

/// Prefers the endpoint's page list; falls back to `text` split on form feeds.
fn payload_to_pages(payload: &LlmOcrResponse, path: &Path) -> Result<Vec<PageText>, SourceError> {
    let listed: Vec<PageText> = payload
        .pages
        .iter()
        .flatten()
        .filter_map(|page| ocr_page(page.page.unwrap_or(1), page.text.as_deref()?))
        .collect();
    if !listed.is_empty() {
        return Ok(listed);
    }

    let split: Vec<PageText> = payload
        .text
        .as_deref()
        .unwrap_or_default()
        .split('\u{000c}')
        .zip(1u32..)
        .filter_map(|(chunk, number)| ocr_page(number, chunk))
        .collect();
    if !split.is_empty() {
        return Ok(split);
    }

    Err(SourceError::OcrFailed(format!(
        "OCR endpoint returned no text for {}",
        path.display()
    )))
}
