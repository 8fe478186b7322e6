use crate::handlers;
use crate::retrieval::RetrievalService;
use crate::traits::CompletionService;
use crate::xbrl::FactExtractor;
use crate::{Answer, RagError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Everything a handler action may call into.
#[derive(Clone)]
pub struct AskContext {
    pub facts: FactExtractor,
    pub retrieval: Arc<RetrievalService>,
    pub completion: Arc<dyn CompletionService>,
    pub top_k: usize,
}

/// One `(predicate, action)` pair of the routing chain.
///
/// `matches` must be cheap, pure and infallible; all I/O belongs in `handle`.
#[async_trait]
pub trait AskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn matches(&self, question: &str) -> bool;

    /// Set only by the terminal handler whose predicate accepts everything.
    fn is_fallback(&self) -> bool {
        false
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        question: &str,
    ) -> Result<Answer, RagError>;
}

/// Stateless first-match dispatcher over an ordered handler list.
pub struct IntentRouter {
    handlers: Vec<Box<dyn AskHandler>>,
}

impl IntentRouter {
    /// Fails unless exactly one fallback handler is present and it is last.
    pub fn new(handlers: Vec<Box<dyn AskHandler>>) -> Result<Self, RagError> {
        let Some(last) = handlers.last() else {
            return Err(RagError::InvalidArgument(
                "router needs at least a fallback handler".to_string(),
            ));
        };
        if !last.is_fallback() {
            return Err(RagError::InvalidArgument(format!(
                "last handler {} is not a fallback",
                last.name()
            )));
        }
        if let Some(early) = handlers[..handlers.len() - 1]
            .iter()
            .find(|handler| handler.is_fallback())
        {
            return Err(RagError::InvalidArgument(format!(
                "fallback handler {} would shadow later handlers",
                early.name()
            )));
        }

        Ok(Self { handlers })
    }

    pub fn with_default_handlers() -> Result<Self, RagError> {
        Self::new(handlers::default_handlers()?)
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|handler| handler.name()).collect()
    }

    /// The first handler whose predicate accepts `question`.
    pub fn select(&self, question: &str) -> &dyn AskHandler {
        for handler in &self.handlers {
            let matched = handler.matches(question);
            debug!(handler = handler.name(), matched, "predicate evaluated");
            if matched {
                return handler.as_ref();
            }
        }
        // `new` guarantees the last handler is an always-true fallback.
        self.handlers[self.handlers.len() - 1].as_ref()
    }

    /// Dispatches to the first matching handler. A failing action is never retried on a
    /// later handler: caller-actionable errors pass through, anything else becomes
    /// `RagError::Internal` naming the handler.
    pub async fn route(
        &self,
        context: &AskContext,
        entities: &[String],
        question: &str,
    ) -> Result<Answer, RagError> {
        let handler = self.select(question);
        info!(handler = handler.name(), entities = ?entities, "routing question");

        handler
            .handle(context, entities, question)
            .await
            .map_err(|error| {
                if error.is_user_facing() {
                    error
                } else {
                    RagError::Internal {
                        handler: handler.name().to_string(),
                        details: error.to_string(),
                    }
                }
            })
    }
}
