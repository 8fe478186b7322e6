use crate::error::RagError;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// One vector per input, in input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError>;
}

#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

/// OpenAI-compatible `/v1/embeddings` client.
pub struct HttpEmbedder {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, RagError> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            api_key,
            model: model.into(),
            dimensions,
        })
    }
}

impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .map_err(|error| RagError::upstream("embedding provider", error.to_string()))?;
        if !response.status().is_success() {
            return Err(RagError::upstream(
                "embedding provider",
                format!("{} returned {}", self.endpoint, response.status()),
            ));
        }

        let mut payload: EmbeddingResponse = response
            .json()
            .map_err(|error| RagError::upstream("embedding provider", error.to_string()))?;
        payload.data.sort_by_key(|row| row.index);
        Ok(payload.data.into_iter().map(|row| row.embedding).collect())
    }
}

pub type EmbedderFactory = Box<dyn Fn() -> Result<Arc<dyn Embedder>, RagError> + Send + Sync>;

/// Injected handle around an expensive embedder: built by `factory` on first use,
/// then shared read-only for the rest of the process.
pub struct EmbeddingProvider {
    factory: EmbedderFactory,
    instance: Mutex<Option<Arc<dyn Embedder>>>,
}

impl EmbeddingProvider {
    pub fn new(factory: EmbedderFactory) -> Self {
        Self {
            factory,
            instance: Mutex::new(None),
        }
    }

    pub fn from_embedder(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            factory: Box::new(|| {
                Err(RagError::InvalidArgument(
                    "embedder was supplied pre-built".to_string(),
                ))
            }),
            instance: Mutex::new(Some(embedder)),
        }
    }

    pub fn get(&self) -> Result<Arc<dyn Embedder>, RagError> {
        let mut slot = self.instance.lock().map_err(|_| RagError::Internal {
            handler: "embedding provider".to_string(),
            details: "initialization lock poisoned".to_string(),
        })?;

        if let Some(embedder) = slot.as_ref() {
            return Ok(Arc::clone(embedder));
        }

        let embedder = (self.factory)()?;
        info!(dimensions = embedder.dimensions(), "embedding provider initialized");
        *slot = Some(Arc::clone(&embedder));
        Ok(embedder)
    }

    pub fn dimensions(&self) -> Result<usize, RagError> {
        Ok(self.get()?.dimensions())
    }

    /// Embeds `texts`, rejecting responses whose count or width disagrees with the provider.
    pub fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
        let embedder = self.get()?;
        let vectors = embedder.embed_batch(texts)?;

        if vectors.len() != texts.len() {
            return Err(RagError::upstream(
                "embedding provider",
                format!("returned {} vectors for {} inputs", vectors.len(), texts.len()),
            ));
        }
        let dimensions = embedder.dimensions();
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != dimensions) {
            return Err(RagError::upstream(
                "embedding provider",
                format!("vector width {} != configured {}", bad.len(), dimensions),
            ));
        }

        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed("Net income attributable to shareholders");
        let second = embedder.embed("Net income attributable to shareholders");
        assert_eq!(first, second);
    }

    #[test]
    fn embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        let vectors = embedder.embed_batch(&["abc", "defg"]).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|vector| vector.len() == 32));
    }

    #[test]
    fn provider_constructs_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let provider = EmbeddingProvider::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CharacterNgramEmbedder { dimensions: 8 }) as Arc<dyn Embedder>)
        }));

        provider.embed(&["one"]).unwrap();
        provider.embed(&["two", "three"]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(provider.dimensions().unwrap(), 8);
    }

    #[test]
    fn provider_surfaces_factory_failure() {
        let provider = EmbeddingProvider::new(Box::new(|| {
            Err(RagError::upstream("embedding provider", "model missing"))
        }));
        assert!(matches!(
            provider.embed(&["text"]),
            Err(RagError::UpstreamUnavailable { .. })
        ));
    }

    struct ShortEmbedder;

    impl Embedder for ShortEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, RagError> {
            Ok(texts.iter().map(|_| vec![0.0; 2]).collect())
        }
    }

    #[test]
    fn provider_rejects_wrong_width() {
        let provider = EmbeddingProvider::from_embedder(Arc::new(ShortEmbedder));
        assert!(provider.embed(&["text"]).is_err());
    }
}
