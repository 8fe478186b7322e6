pub mod chunking;
pub mod classifier;
pub mod completion;
pub mod config;
pub mod edgar;
pub mod embeddings;
pub mod error;
pub mod handlers;
pub mod index;
pub mod models;
pub mod news;
pub mod orchestrator;
pub mod resolver;
pub mod retrieval;
pub mod router;
pub mod sentiment;
pub mod store;
pub mod traits;
pub mod xbrl;

pub use chunking::{chunk_document, chunk_span, ChunkingConfig};
pub use classifier::{KeywordClassifier, UNCLASSIFIED};
pub use completion::OpenAiCompletion;
pub use config::{CompletionConfig, EdgarConfig, NewsConfig, RagConfig, DEFAULT_CHUNK_SIZE, DEFAULT_TOP_K};
pub use edgar::{choose_primary_document, EdgarClient};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, EmbedderFactory, EmbeddingProvider, HttpEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{FetchError, RagError};
pub use handlers::default_handlers;
pub use index::{EntityIndex, VectorIndexManager};
pub use models::{
    Answer, ArticleSentiment, BuildReport, Chunk, ChunkDescriptor, CompletionRequest,
    DocumentHandle, FactValue, FilingRecord, FormType, IndexStats, Metric, ScoredChunk,
    SentimentLabel, SentimentScore, Snippet, StructuredFact, YearComparison,
};
pub use news::NewsApiClient;
pub use orchestrator::{summarize, AskCoordinator};
pub use resolver::{CompletionResolver, DirectoryResolver};
pub use retrieval::RetrievalService;
pub use router::{AskContext, AskHandler, IntentRouter};
pub use sentiment::{overall_sentiment, score_news, LexiconSentimentScorer};
pub use store::{normalize_entity, DocumentStore};
pub use traits::{
    Classifier, CompletionService, EntityResolver, FilingSource, NewsSource, SentimentScorer,
};
pub use xbrl::{extract_fact, FactExtractor};
