use crate::config::CompletionConfig;
use crate::error::RagError;
use crate::models::CompletionRequest;
use crate::traits::CompletionService;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const SERVICE: &str = "completion service";

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompletion {
    client: Client,
    config: CompletionConfig,
}

impl OpenAiCompletion {
    pub fn new(config: CompletionConfig) -> Result<Self, RagError> {
        url::Url::parse(&config.endpoint)?;
        let client = Client::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, RagError> {
        let body = ChatRequest {
            model: &self.config.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
        };

        let mut call = self.client.post(&self.config.endpoint).json(&body);
        if let Some(api_key) = &self.config.api_key {
            call = call.bearer_auth(api_key.trim());
        }
        debug!(model = %self.config.model, max_tokens = request.max_tokens, "requesting completion");

        let response = call
            .send()
            .await
            .map_err(|error| RagError::upstream(SERVICE, error.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::upstream(SERVICE, format!("{status}: {text}")));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| RagError::upstream(SERVICE, error.to_string()))?;
        first_choice(parsed)
    }
}

fn first_choice(response: ChatResponse) -> Result<String, RagError> {
    response
        .choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| RagError::upstream(SERVICE, "response carried no message content"))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: Option<String>,
}
