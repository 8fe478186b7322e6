use crate::router::{AskContext, IntentRouter};
use crate::traits::{CompletionService, EntityResolver};
use crate::{Answer, CompletionRequest, RagError};
use std::sync::Arc;
use tracing::info;

/// Question entry point: resolves entity symbols, then hands the question to the router.
pub struct AskCoordinator {
    resolver: Arc<dyn EntityResolver>,
    router: IntentRouter,
    context: AskContext,
}

impl AskCoordinator {
    pub fn new(resolver: Arc<dyn EntityResolver>, router: IntentRouter, context: AskContext) -> Self {
        Self {
            resolver,
            router,
            context,
        }
    }

    pub fn router(&self) -> &IntentRouter {
        &self.router
    }

    pub fn completion(&self) -> &Arc<dyn CompletionService> {
        &self.context.completion
    }

    pub async fn ask(&self, question: &str) -> Result<Answer, RagError> {
        self.ask_with_top_k(question, self.context.top_k).await
    }

    pub async fn ask_with_top_k(&self, question: &str, top_k: usize) -> Result<Answer, RagError> {
        if top_k == 0 {
            return Err(RagError::InvalidArgument("top_k must be at least 1".to_string()));
        }

        let entities = self.resolver.resolve(question).await?;
        info!(entities = ?entities, top_k, "resolved question entities");

        if top_k == self.context.top_k {
            return self.router.route(&self.context, &entities, question).await;
        }
        let context = AskContext {
            top_k,
            ..self.context.clone()
        };
        self.router.route(&context, &entities, question).await
    }

    /// One-sentence executive summary followed by three highlights.
    pub async fn summarize(&self, text: &str) -> Result<String, RagError> {
        summarize(self.context.completion.as_ref(), text).await
    }
}

pub async fn summarize(completion: &dyn CompletionService, text: &str) -> Result<String, RagError> {
    if text.trim().is_empty() {
        return Err(RagError::InvalidArgument("nothing to summarize".to_string()));
    }

    completion
        .complete(&CompletionRequest {
            system: "You are a concise financial research assistant.".to_string(),
            prompt: format!(
                "Summarize the following filing text. Start with a one-sentence executive summary, then list three key highlights as bullet points.\n\n{text}"
            ),
            temperature: 0.2,
            max_tokens: 400,
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingProvider};
    use crate::index::VectorIndexManager;
    use crate::resolver::DirectoryResolver;
    use crate::retrieval::RetrievalService;
    use crate::store::DocumentStore;
    use crate::xbrl::FactExtractor;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        requests: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionService for Recorder {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, RagError> {
            self.requests
                .lock()
                .map_err(|_| RagError::InvalidArgument("poisoned".to_string()))?
                .push(request.clone());
            Ok("Summary.".to_string())
        }
    }

    fn coordinator(root: &Path, completion: Arc<Recorder>) -> Result<AskCoordinator, RagError> {
        let store = DocumentStore::new(root, vec!["xml".to_string(), "txt".to_string()]);
        store.write_document(
            "AAPL",
            "aapl-20200926.xml",
            b"<xbrl><us-gaap:NetIncomeLoss>57411000000</us-gaap:NetIncomeLoss></xbrl>",
        )?;
        let embeddings = Arc::new(EmbeddingProvider::from_embedder(Arc::new(
            CharacterNgramEmbedder::default(),
        )));
        let indexes = Arc::new(VectorIndexManager::new(
            store.clone(),
            embeddings,
            ChunkingConfig { chunk_size: 128 },
        ));
        let context = AskContext {
            facts: FactExtractor::new(store)?,
            retrieval: Arc::new(RetrievalService::new(indexes)),
            completion,
            top_k: 5,
        };
        Ok(AskCoordinator::new(
            Arc::new(DirectoryResolver::with_known_companies()?),
            IntentRouter::with_default_handlers()?,
            context,
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn company_name_is_resolved_before_routing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = coordinator(dir.path(), Arc::new(Recorder::default()))?;

        let answer = coordinator
            .ask("What was Apple's net income in 2020?")
            .await?;
        assert_eq!(answer.entities, vec!["AAPL".to_string()]);
        assert_eq!(answer.handler, "net_income_by_year");
        assert_eq!(answer.text, "AAPL net income 2020: $57411000000");
        Ok(())
    }

    #[tokio::test]
    async fn structured_lookup_runs_on_a_current_thread_runtime() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = coordinator(dir.path(), Arc::new(Recorder::default()))?;

        let answer = coordinator.ask("What was AAPL net income in 2020?").await?;
        assert_eq!(answer.handler, "net_income_by_year");
        assert_eq!(answer.text, "AAPL net income 2020: $57411000000");
        Ok(())
    }

    #[tokio::test]
    async fn zero_top_k_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let coordinator = coordinator(dir.path(), Arc::new(Recorder::default()))?;
        assert!(matches!(
            coordinator.ask_with_top_k("anything", 0).await,
            Err(RagError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn summarize_uses_fixed_generation_settings() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let recorder = Arc::new(Recorder::default());
        let coordinator = coordinator(dir.path(), Arc::clone(&recorder))?;

        assert_eq!(coordinator.summarize("Revenue grew 6%.").await?, "Summary.");
        assert!(coordinator.summarize("   ").await.is_err());

        let requests = recorder.requests.lock().map_err(|_| "poisoned")?;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].max_tokens, 400);
        assert!((requests[0].temperature - 0.2).abs() < f32::EPSILON);
        assert!(requests[0].prompt.ends_with("Revenue grew 6%."));
        Ok(())
    }
}
