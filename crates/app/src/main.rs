use anyhow::{bail, Context};
use chrono::Utc;
use clap::{Parser, Subcommand};
use filing_rag_core::{
    overall_sentiment, score_news, summarize, AskContext, AskCoordinator, CharacterNgramEmbedder,
    ChunkingConfig, Classifier, CompletionConfig, CompletionResolver, CompletionService,
    DirectoryResolver, DocumentStore, EdgarClient, EdgarConfig, Embedder, EmbeddingProvider,
    EntityResolver, FactExtractor, FilingSource, HttpEmbedder, IntentRouter, KeywordClassifier,
    LexiconSentimentScorer, Metric, NewsApiClient, NewsConfig, NewsSource, OpenAiCompletion,
    RagConfig, RetrievalService, SentimentScorer, VectorIndexManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "filing-rag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding one namespace per ticker (defaults to FILING_RAG_ROOT or ./data).
    #[arg(long)]
    root: Option<PathBuf>,

    /// Characters per chunk (defaults to FILING_RAG_CHUNK_SIZE or 1000).
    #[arg(long)]
    chunk_size: Option<usize>,

    /// OpenAI-compatible embeddings endpoint; the offline n-gram embedder is used when unset.
    #[arg(long, env = "FILING_RAG_EMBEDDING_ENDPOINT")]
    embedding_endpoint: Option<String>,

    /// Embedding model name sent to the embeddings endpoint.
    #[arg(long, env = "FILING_RAG_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Chat completions endpoint.
    #[arg(
        long,
        env = "FILING_RAG_COMPLETION_ENDPOINT",
        default_value = "https://api.openai.com/v1/chat/completions"
    )]
    completion_endpoint: String,

    /// Chat completion model.
    #[arg(long, env = "FILING_RAG_COMPLETION_MODEL", default_value = "gpt-4")]
    completion_model: String,

    /// API key for the completion and embeddings endpoints.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// User agent sent to SEC EDGAR ("Name email@domain").
    #[arg(long, env = "EDGAR_USER_AGENT", default_value = "filing-rag admin@example.com")]
    edgar_user_agent: String,

    /// NewsAPI key used by fetch-news.
    #[arg(long, env = "NEWSAPI_KEY", hide_env_values = true)]
    news_api_key: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Download recent filings for a ticker from EDGAR.
    Fetch {
        #[arg(long)]
        ticker: String,
        /// Number of filings to download.
        #[arg(long, default_value = "20")]
        count: usize,
        /// Comma-separated form types.
        #[arg(long, value_delimiter = ',', default_value = "10-K,10-Q")]
        forms: Vec<String>,
    },
    /// Store recent news articles mentioning a ticker.
    FetchNews {
        #[arg(long)]
        ticker: String,
    },
    /// Chunk, embed and persist the vector index of a ticker.
    BuildIndex {
        #[arg(long)]
        ticker: String,
        /// Rebuild even if an index already exists.
        #[arg(long, default_value_t = false)]
        reset: bool,
    },
    /// Print statistics of a persisted index.
    Inspect {
        #[arg(long)]
        ticker: String,
    },
    /// Answer a free-text question.
    Ask {
        #[arg(long)]
        question: String,
        /// Number of passages retrieved per entity.
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// Look up one XBRL fact: a metric name (net income, revenue) or a raw element name.
    Fact {
        #[arg(long)]
        ticker: String,
        #[arg(long)]
        metric: String,
        #[arg(long)]
        year: i32,
    },
    /// Label text as 10-K, 10-Q, 8-K, NEWS or UNCLASSIFIED.
    Classify {
        #[arg(long)]
        text: String,
    },
    /// Summarize text with the completion service.
    Summarize {
        #[arg(long)]
        text: String,
    },
    /// Score the tone of text, or of every stored news article of a ticker.
    Sentiment {
        #[arg(long, conflicts_with = "text", required_unless_present = "text")]
        ticker: Option<String>,
        #[arg(long)]
        text: Option<String>,
    },
}

struct App {
    config: RagConfig,
    store: DocumentStore,
    indexes: Arc<VectorIndexManager>,
    completion: Arc<dyn CompletionService>,
}

impl App {
    fn new(cli: &Cli) -> anyhow::Result<Self> {
        let mut config = RagConfig::from_env()?;
        if let Some(root) = &cli.root {
            config.storage_root = root.clone();
        }
        if let Some(chunk_size) = cli.chunk_size {
            config.chunk_size = chunk_size;
        }
        config.validate()?;

        let store = DocumentStore::new(&config.storage_root, config.document_extensions.clone());
        let embeddings = Arc::new(embedding_provider(cli, config.embedding_dimensions));
        let indexes = Arc::new(VectorIndexManager::new(
            store.clone(),
            embeddings,
            ChunkingConfig::new(config.chunk_size)?,
        ));
        let completion: Arc<dyn CompletionService> = Arc::new(OpenAiCompletion::new(CompletionConfig {
            endpoint: cli.completion_endpoint.clone(),
            api_key: cli.openai_api_key.clone(),
            model: cli.completion_model.clone(),
        })?);

        Ok(Self {
            config,
            store,
            indexes,
            completion,
        })
    }

    fn coordinator(&self, cli: &Cli) -> anyhow::Result<AskCoordinator> {
        let directory = DirectoryResolver::with_known_companies()?.with_tickers(self.store.entities());
        let resolver: Arc<dyn EntityResolver> = if cli.openai_api_key.is_some() {
            Arc::new(CompletionResolver::new(Arc::clone(&self.completion), directory))
        } else {
            Arc::new(directory)
        };

        let context = AskContext {
            facts: FactExtractor::new(self.store.clone())?,
            retrieval: Arc::new(RetrievalService::new(Arc::clone(&self.indexes))),
            completion: Arc::clone(&self.completion),
            top_k: self.config.default_top_k,
        };
        Ok(AskCoordinator::new(
            resolver,
            IntentRouter::with_default_handlers()?,
            context,
        ))
    }
}

fn embedding_provider(cli: &Cli, dimensions: usize) -> EmbeddingProvider {
    let endpoint = cli.embedding_endpoint.clone();
    let api_key = cli.openai_api_key.clone();
    let model = cli.embedding_model.clone();

    EmbeddingProvider::new(Box::new(move || {
        let embedder: Arc<dyn Embedder> = match &endpoint {
            Some(endpoint) => Arc::new(HttpEmbedder::new(
                endpoint.clone(),
                api_key.clone(),
                model.clone(),
                dimensions,
            )?),
            None => Arc::new(CharacterNgramEmbedder { dimensions }),
        };
        Ok(embedder)
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let app = App::new(&cli)?;
    info!(
        version = app_version,
        root = %app.config.storage_root.display(),
        started_at = %Utc::now().to_rfc3339(),
        "filing-rag boot"
    );

    match &cli.command {
        Command::Fetch {
            ticker,
            count,
            forms,
        } => {
            let client = EdgarClient::new(
                EdgarConfig {
                    user_agent: cli.edgar_user_agent.clone(),
                    ..EdgarConfig::default()
                },
                app.store.clone(),
            )?;
            let documents = client
                .fetch(ticker, *count, forms)
                .await
                .with_context(|| format!("fetching filings for {ticker}"))?;
            for document in &documents {
                println!("{}", document.path.display());
            }
            println!("{} filing(s) available for {}", documents.len(), ticker.to_uppercase());
        }
        Command::FetchNews { ticker } => {
            let client = NewsApiClient::new(
                NewsConfig {
                    api_key: cli.news_api_key.clone(),
                    ..NewsConfig::default()
                },
                app.store.clone(),
            )?;
            let articles = client
                .fetch_news(ticker)
                .await
                .with_context(|| format!("fetching news for {ticker}"))?;
            println!("{} article(s) stored for {}", articles.len(), ticker.to_uppercase());
        }
        Command::BuildIndex { ticker, reset } => {
            let report = tokio::task::block_in_place(|| app.indexes.build(ticker, *reset))?;
            println!(
                "{}: {} chunk(s) from {} document(s){}",
                report.entity,
                report.chunks,
                report.documents,
                if report.rebuilt { "" } else { " (existing index kept)" }
            );
        }
        Command::Inspect { ticker } => {
            let stats = tokio::task::block_in_place(|| app.indexes.inspect(ticker))?;
            println!("entity: {}", stats.entity);
            println!("chunks: {}", stats.chunk_count);
            println!("dimensions: {}", stats.dimensions);
            println!("chunk_size: {}", stats.chunk_size);
            println!("built_at: {}", stats.built_at.to_rfc3339());
            for (source, chunks) in &stats.chunks_per_source {
                println!("  {source}: {chunks}");
            }
        }
        Command::Ask { question, top_k } => {
            let coordinator = app.coordinator(&cli)?;
            let answer = coordinator
                .ask_with_top_k(question, top_k.unwrap_or(app.config.default_top_k))
                .await?;
            info!(handler = %answer.handler, "answered");
            println!("{}", answer.text);
            for snippet in &answer.snippets {
                println!(
                    "  source={} chunk={} distance={:.4}",
                    snippet.source, snippet.offset_index, snippet.distance
                );
            }
        }
        Command::Fact {
            ticker,
            metric,
            year,
        } => {
            let facts = FactExtractor::new(app.store.clone())?;
            let fact = match Metric::parse(metric) {
                Some(metric) => facts.metric_for_year(ticker, metric, *year)?,
                None if metric.chars().all(|ch| ch.is_ascii_alphanumeric()) => {
                    facts.extract(ticker, &[metric.as_str()], *year)?
                }
                None => bail!("unknown metric {metric:?}: use net income, revenue or an XBRL element name"),
            };
            println!(
                "{} {} {} ({:?}): {}  [{}]",
                fact.entity, fact.tag_name, fact.fiscal_year, fact.period, fact.value, fact.source
            );
        }
        Command::Classify { text } => {
            let classifier = KeywordClassifier::new()?;
            println!("{}", classifier.classify(text)?);
        }
        Command::Summarize { text } => {
            println!("{}", summarize(app.completion.as_ref(), text).await?);
        }
        Command::Sentiment { ticker, text } => {
            let scorer = LexiconSentimentScorer::new()?;
            if let Some(text) = text {
                let sentiment = scorer.score(text)?;
                println!("{} {:.3}", sentiment.label, sentiment.score);
            } else if let Some(ticker) = ticker {
                let articles = score_news(&app.store, &scorer, ticker)?;
                for article in &articles {
                    println!(
                        "{} {} {:.3}",
                        article.source, article.sentiment.label, article.sentiment.score
                    );
                }
                if let Some(overall) = overall_sentiment(&articles) {
                    println!(
                        "overall: {} {:.3} across {} article(s)",
                        overall.label,
                        overall.score,
                        articles.len()
                    );
                }
            }
        }
    }

    Ok(())
}
