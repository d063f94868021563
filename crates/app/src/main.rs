use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use pdf_qa_core::backends::openai::{
    DEFAULT_BASE_URL, DEFAULT_EMBEDDING_DIMENSIONS as OPENAI_EMBEDDING_DIMENSIONS,
    DEFAULT_EMBEDDING_MODEL,
};
use pdf_qa_core::{
    discover_pdf_files, load_folder, Answer, CancelToken, CharacterNgramEmbedder, DocumentSource,
    EmbeddingBackend, IndexMode, JsonFileStore, OcrEndpointConfig, OpenAiChat, OpenAiConfig,
    OpenAiEmbeddings, PdfDocumentSource, PipelineConfig, PipelineCoordinator, SourceDocument,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pdf-qa", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML file with pipeline settings
    #[arg(long, env = "PDF_QA_CONFIG")]
    config: Option<PathBuf>,

    /// Location of the persistent vector index
    #[arg(long, env = "PDF_QA_INDEX_PATH")]
    index_path: Option<PathBuf>,

    /// Drop every indexed document before running the command
    #[arg(long, default_value_t = false)]
    reset_index: bool,

    /// Embedding backend
    #[arg(long, value_enum, default_value_t = EmbedderKind::Openai)]
    embedder: EmbedderKind,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    openai_base_url: String,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Embedding model name
    #[arg(long, default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Vector length returned by the embedding model
    #[arg(long, default_value_t = OPENAI_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Chat model used to answer (overrides the config file)
    #[arg(long)]
    model: Option<String>,

    /// Sampling temperature (overrides the config file)
    #[arg(long)]
    temperature: Option<f32>,

    /// Multimodal OCR endpoint used for PDFs without a text layer
    #[arg(long, env = "LLM_OCR_ENDPOINT")]
    ocr_endpoint: Option<String>,

    /// OCR endpoint API key
    #[arg(long, env = "LLM_OCR_API_KEY", hide_env_values = true)]
    ocr_api_key: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EmbedderKind {
    /// OpenAI-compatible embeddings endpoint.
    Openai,
    /// Offline hashed character trigrams.
    Local,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest one PDF, or every PDF under a folder.
    Ingest {
        /// PDF file to ingest.
        #[arg(long, conflicts_with = "folder", required_unless_present = "folder")]
        file: Option<PathBuf>,
        /// Document id to store the file under (defaults to a hash of its path).
        #[arg(long, requires = "file")]
        id: Option<String>,
        /// Folder searched recursively for PDFs.
        #[arg(long)]
        folder: Option<PathBuf>,
    },
    /// Answer a question from the indexed documents.
    Ask {
        #[arg(long)]
        question: String,
        /// Number of segments to retrieve.
        #[arg(long)]
        top_k: Option<usize>,
        /// Restrict the answer to one document id.
        #[arg(long)]
        document: Option<String>,
    },
    /// Ingest one PDF and answer a question about it.
    Chat {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        question: String,
        #[arg(long)]
        top_k: Option<usize>,
        /// Use the OCR endpoint when the PDF has no text layer.
        #[arg(long, default_value_t = false)]
        extract_images: bool,
    },
    /// Remove one document from the index.
    Evict {
        #[arg(long)]
        id: String,
    },
    /// Remove every document from the index.
    Clear,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        index = %config.index.path.display(),
        "pdf-qa boot"
    );

    let needs_generator = matches!(cli.command, Command::Ask { .. } | Command::Chat { .. });
    let coordinator = Arc::new(build_coordinator(&cli, config, needs_generator).await?);

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Command::Ingest { file, id, folder } => {
            let source = document_source(&cli.ocr_endpoint, &cli.ocr_api_key, true);
            if let Some(folder) = folder {
                ingest_folder(&coordinator, &source, &folder, &cancel).await?;
            } else if let Some(file) = file {
                let document = load_document(&source, &file, id).await?;
                ingest_one(&coordinator, &document, &cancel).await?;
            }
        }
        Command::Ask {
            question,
            top_k,
            document,
        } => {
            let answer = match document {
                Some(document_id) => {
                    coordinator
                        .query_document(&document_id, &question, top_k, &cancel)
                        .await
                }
                None => coordinator.query_with_cancel(&question, top_k, &cancel).await,
            }
            .map_err(|error| anyhow::anyhow!("query failed ({}): {error}", error.kind()))?;
            print_answer(&answer);
        }
        Command::Chat {
            file,
            question,
            top_k,
            extract_images,
        } => {
            let source = document_source(&cli.ocr_endpoint, &cli.ocr_api_key, extract_images);
            let document = load_document(&source, &file, None).await?;
            ingest_one(&coordinator, &document, &cancel).await?;

            let answer = coordinator
                .query_document(&document.document_id, &question, top_k, &cancel)
                .await
                .map_err(|error| anyhow::anyhow!("query failed ({}): {error}", error.kind()))?;
            print_answer(&answer);
        }
        Command::Evict { id } => {
            let removed = coordinator
                .evict(&id)
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            println!("{removed} segments removed for {id}");
        }
        Command::Clear => {
            coordinator
                .clear_index()
                .await
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            println!("index cleared");
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path).map_err(|error| anyhow::anyhow!(error.to_string()))?,
        None => PipelineConfig::default(),
    };

    if let Some(path) = &cli.index_path {
        config.index.path = path.clone();
    }
    if cli.reset_index {
        config.index.mode = IndexMode::Reset;
    }
    if let Some(model) = &cli.model {
        config.model_name = model.clone();
    }
    if let Some(temperature) = cli.temperature {
        config.temperature = temperature;
    }

    config
        .validate()
        .map_err(|error| anyhow::anyhow!(error.to_string()))?;
    Ok(config)
}

async fn build_coordinator(
    cli: &Cli,
    config: PipelineConfig,
    needs_generator: bool,
) -> anyhow::Result<PipelineCoordinator> {
    let api_key = cli.openai_api_key.clone().unwrap_or_default();
    if api_key.is_empty() && (needs_generator || cli.embedder == EmbedderKind::Openai) {
        bail!("OPENAI_API_KEY (or --openai-api-key) is required for this command");
    }

    let openai = OpenAiConfig {
        base_url: cli.openai_base_url.clone(),
        api_key,
        request_timeout: Duration::from_secs(config.timeouts.generate_secs),
    };

    let embedder: Arc<dyn EmbeddingBackend> = match cli.embedder {
        EmbedderKind::Openai => Arc::new(
            OpenAiEmbeddings::new(
                OpenAiConfig {
                    request_timeout: Duration::from_secs(config.timeouts.embed_secs),
                    ..openai.clone()
                },
                &cli.embedding_model,
                cli.embedding_dimensions,
            )
            .context("building embeddings client")?,
        ),
        EmbedderKind::Local => Arc::new(CharacterNgramEmbedder::default()),
    };

    let generator = Arc::new(
        OpenAiChat::new(openai, &config.model_name, config.temperature)
            .context("building chat client")?,
    );

    let store = Arc::new(
        JsonFileStore::open(&config.index.path, config.index.mode)
            .await
            .with_context(|| format!("opening index {}", config.index.path.display()))?
            .with_lock_timeout(config.store_timeout()),
    );

    PipelineCoordinator::new(config, embedder, generator, store)
        .map_err(|error| anyhow::anyhow!(error.to_string()))
}

fn document_source(
    endpoint: &Option<String>,
    api_key: &Option<String>,
    allow_ocr: bool,
) -> PdfDocumentSource {
    match endpoint.as_deref().map(str::trim) {
        Some(endpoint) if allow_ocr && !endpoint.is_empty() => {
            PdfDocumentSource::with_ocr(OcrEndpointConfig {
                endpoint: endpoint.to_string(),
                api_key: api_key.clone().filter(|key| !key.trim().is_empty()),
                timeout: Duration::from_secs(120),
            })
        }
        _ => PdfDocumentSource::new(),
    }
}

async fn load_document(
    source: &PdfDocumentSource,
    path: &Path,
    id: Option<String>,
) -> anyhow::Result<SourceDocument> {
    let mut document = source
        .load(path)
        .await
        .map_err(|error| anyhow::anyhow!("cannot read {}: {error}", path.display()))?;
    if let Some(id) = id {
        document.document_id = id;
    }
    Ok(document)
}

async fn ingest_one(
    coordinator: &PipelineCoordinator,
    document: &SourceDocument,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    let result = coordinator
        .ingest_with_cancel(&document.document_id, &document.raw_text, cancel)
        .await
        .map_err(|error| {
            anyhow::anyhow!(
                "ingestion of {} ({}) failed ({}): {error}",
                document.document_id,
                document.source_path.display(),
                error.kind()
            )
        })?;

    println!(
        "{} segments indexed for {} ({}), {} replaced",
        result.segment_count,
        result.document_id,
        document.source_path.display(),
        result.replaced_segments
    );
    Ok(())
}

async fn ingest_folder(
    coordinator: &Arc<PipelineCoordinator>,
    source: &PdfDocumentSource,
    folder: &Path,
    cancel: &CancelToken,
) -> anyhow::Result<()> {
    if discover_pdf_files(folder).is_empty() {
        bail!("no pdf files found in {}", folder.display());
    }

    let load = load_folder(source, folder).await;
    let mut failed = load.skipped.len();
    for skipped in &load.skipped {
        println!("skipped {}: {}", skipped.path.display(), skipped.error);
    }

    let mut tasks = JoinSet::new();
    for document in load.documents {
        let coordinator = Arc::clone(coordinator);
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let outcome = coordinator
                .ingest_with_cancel(&document.document_id, &document.raw_text, &cancel)
                .await;
            (document, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (document, outcome) = joined.context("ingestion task panicked")?;
        match outcome {
            Ok(result) => println!(
                "{} segments indexed for {} ({})",
                result.segment_count,
                result.document_id,
                document.source_path.display()
            ),
            Err(error) => {
                failed += 1;
                println!(
                    "failed {} ({}): {} {error}",
                    document.document_id,
                    document.source_path.display(),
                    error.kind()
                );
            }
        }
    }

    if failed > 0 {
        bail!("{failed} document(s) were not indexed");
    }
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    if !answer.segment_ids.is_empty() {
        println!();
        println!("context segments:");
        for segment_id in &answer.segment_ids {
            println!("  {segment_id}");
        }
    }
}
