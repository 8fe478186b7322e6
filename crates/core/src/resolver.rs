use crate::error::RagError;
use crate::models::CompletionRequest;
use crate::traits::{CompletionService, EntityResolver};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

const KNOWN_COMPANIES: [(&str, &str); 12] = [
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("salesforce", "CRM"),
    ("amazon", "AMZN"),
    ("alphabet", "GOOGL"),
    ("google", "GOOGL"),
    ("meta", "META"),
    ("facebook", "META"),
    ("nvidia", "NVDA"),
    ("tesla", "TSLA"),
    ("netflix", "NFLX"),
    ("oracle", "ORCL"),
];

/// Resolves entities from a fixed company directory: company names anywhere in the text
/// (case-insensitive) and uppercase ticker tokens of known symbols.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    names: BTreeMap<String, String>,
    tickers: BTreeSet<String>,
    token_pattern: Regex,
}

impl DirectoryResolver {
    pub fn new<N, T>(entries: impl IntoIterator<Item = (N, T)>) -> Result<Self, RagError>
    where
        N: AsRef<str>,
        T: AsRef<str>,
    {
        let mut names = BTreeMap::new();
        let mut tickers = BTreeSet::new();
        for (name, ticker) in entries {
            let ticker = ticker.as_ref().trim().to_ascii_uppercase();
            names.insert(name.as_ref().trim().to_lowercase(), ticker.clone());
            tickers.insert(ticker);
        }
        Ok(Self {
            names,
            tickers,
            token_pattern: Regex::new(r"\b[A-Z][A-Z.]{0,9}\b")?,
        })
    }

    pub fn with_known_companies() -> Result<Self, RagError> {
        Self::new(KNOWN_COMPANIES)
    }

    /// Accepts additional bare symbols, e.g. every entity already present in the store.
    pub fn with_tickers(mut self, tickers: impl IntoIterator<Item = String>) -> Self {
        self.tickers
            .extend(tickers.into_iter().map(|ticker| ticker.to_ascii_uppercase()));
        self
    }

    pub fn ticker_for_name(&self, name: &str) -> Option<&str> {
        self.names
            .get(&name.trim().to_lowercase())
            .map(String::as_str)
    }

    /// Symbols mentioned in `text`, ordered by first mention, without duplicates.
    pub fn find(&self, text: &str) -> Vec<String> {
        let lower = text.to_lowercase();
        let mut hits: Vec<(usize, &str)> = Vec::new();

        for (name, ticker) in &self.names {
            if let Some(position) = find_word(&lower, name) {
                hits.push((position, ticker));
            }
        }
        for token in self.token_pattern.find_iter(text) {
            if let Some(ticker) = self.tickers.get(token.as_str()) {
                hits.push((token.start(), ticker));
            }
        }

        hits.sort_by_key(|(position, _)| *position);
        let mut seen = BTreeSet::new();
        hits.into_iter()
            .filter(|(_, ticker)| seen.insert(*ticker))
            .map(|(_, ticker)| ticker.to_string())
            .collect()
    }
}

/// Byte position of `word` in `haystack` where it is not part of a longer word.
fn find_word(haystack: &str, word: &str) -> Option<usize> {
    haystack.match_indices(word).map(|(start, _)| start).find(|start| {
        let before = haystack[..*start].chars().next_back();
        let after = haystack[start + word.len()..].chars().next();
        !before.map_or(false, char::is_alphanumeric) && !after.map_or(false, char::is_alphanumeric)
    })
}

#[async_trait]
impl EntityResolver for DirectoryResolver {
    async fn resolve(&self, question: &str) -> Result<Vec<String>, RagError> {
        Ok(self.find(question))
    }
}

/// Asks the completion service which companies a question names, then maps the names
/// through the directory. Symbols the directory finds on its own are kept as well.
pub struct CompletionResolver {
    completion: Arc<dyn CompletionService>,
    directory: DirectoryResolver,
}

impl CompletionResolver {
    pub fn new(completion: Arc<dyn CompletionService>, directory: DirectoryResolver) -> Self {
        Self {
            completion,
            directory,
        }
    }
}

#[async_trait]
impl EntityResolver for CompletionResolver {
    async fn resolve(&self, question: &str) -> Result<Vec<String>, RagError> {
        let reply = self
            .completion
            .complete(&CompletionRequest {
                system: "Extract company names, comma-separated.".to_string(),
                prompt: format!(
                    "You are a helper that extracts company names from a user question.\nList only the company names mentioned, comma-separated, nothing else.\nQuestion: {question}\n"
                ),
                temperature: 0.0,
                max_tokens: 64,
            })
            .await?;
        debug!(reply = %reply, "company names extracted");

        let mut entities = self.directory.find(question);
        for name in reply.split(',') {
            let resolved = self
                .directory
                .ticker_for_name(name)
                .map(str::to_string)
                .or_else(|| self.directory.find(name).into_iter().next());
            if let Some(ticker) = resolved {
                if !entities.contains(&ticker) {
                    entities.push(ticker);
                }
            }
        }
        Ok(entities)
    }
}
