use crate::error::RagError;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_CHUNK_SIZE: usize = 1_000;
pub const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone)]
pub struct RagConfig {
    pub storage_root: PathBuf,
    pub chunk_size: usize,
    pub embedding_dimensions: usize,
    pub default_top_k: usize,
    pub document_extensions: Vec<String>,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("data"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            embedding_dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            default_top_k: DEFAULT_TOP_K,
            document_extensions: ["xml", "htm", "html", "txt"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl RagConfig {
    pub fn with_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    /// Loads overrides from the environment (and `.env` if present) on top of the defaults.
    pub fn from_env() -> Result<Self, RagError> {
        let _ = dotenvy::dotenv();

        let mut config = Self::default();
        if let Ok(root) = env::var("FILING_RAG_ROOT") {
            config.storage_root = PathBuf::from(root);
        }
        if let Some(value) = parse_env("FILING_RAG_CHUNK_SIZE")? {
            config.chunk_size = value;
        }
        if let Some(value) = parse_env("FILING_RAG_EMBEDDING_DIMENSIONS")? {
            config.embedding_dimensions = value;
        }
        if let Some(value) = parse_env("FILING_RAG_TOP_K")? {
            config.default_top_k = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RagError> {
        if self.chunk_size == 0 {
            return Err(RagError::InvalidChunkConfig(
                "chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.embedding_dimensions == 0 {
            return Err(RagError::InvalidChunkConfig(
                "embedding_dimensions must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env(key: &str) -> Result<Option<usize>, RagError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| RagError::InvalidArgument(format!("{key} must be a positive integer, got {raw:?}"))),
        Err(_) => Ok(None),
    }
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EdgarConfig {
    /// SEC requires a descriptive agent with a contact address.
    pub user_agent: String,
    pub tickers_url: String,
    pub submissions_base: String,
    pub archives_base: String,
}

impl Default for EdgarConfig {
    fn default() -> Self {
        Self {
            user_agent: "filing-rag admin@example.com".to_string(),
            tickers_url: "https://www.sec.gov/files/company_tickers.json".to_string(),
            submissions_base: "https://data.sec.gov/submissions/".to_string(),
            archives_base: "https://www.sec.gov/Archives/edgar/data/".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewsConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub page_size: usize,
}

impl Default for NewsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://newsapi.org/v2/everything".to_string(),
            api_key: None,
            page_size: 100,
        }
    }
}
