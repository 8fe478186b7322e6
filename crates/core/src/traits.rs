use crate::{CompletionRequest, DocumentHandle, FetchError, RagError, SentimentScore};
use async_trait::async_trait;

/// Downloads filings into the entity's namespace. Already-present documents are returned
/// without being downloaded again.
#[async_trait]
pub trait FilingSource: Send + Sync {
    async fn fetch(
        &self,
        entity: &str,
        count: usize,
        form_types: &[String],
    ) -> Result<Vec<DocumentHandle>, FetchError>;
}

#[async_trait]
pub trait NewsSource: Send + Sync {
    async fn fetch_news(&self, entity: &str) -> Result<Vec<DocumentHandle>, FetchError>;
}

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RagError>;
}

/// Maps question text to the entity symbols it mentions.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    async fn resolve(&self, question: &str) -> Result<Vec<String>, RagError>;
}

pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<String, RagError>;
}

/// Scores the tone of a piece of text, typically a news article.
pub trait SentimentScorer: Send + Sync {
    fn score(&self, text: &str) -> Result<SentimentScore, RagError>;
}
