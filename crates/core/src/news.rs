use crate::config::NewsConfig;
use crate::error::FetchError;
use crate::models::DocumentHandle;
use crate::store::{normalize_entity, DocumentStore};
use crate::traits::NewsSource;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

/// NewsAPI-style `everything` client. Each article becomes a small text document in the
/// entity namespace so it is indexed alongside the filings.
pub struct NewsApiClient {
    client: Client,
    config: NewsConfig,
    store: DocumentStore,
}

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    articles: Vec<Article>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Article {
    #[serde(default)]
    source: ArticleSource,
    title: Option<String>,
    description: Option<String>,
    url: String,
    published_at: String,
}

#[derive(Debug, Default, Deserialize)]
struct ArticleSource {
    name: Option<String>,
}

impl NewsApiClient {
    pub fn new(config: NewsConfig, store: DocumentStore) -> Result<Self, FetchError> {
        url::Url::parse(&config.endpoint)?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            config,
            store,
        })
    }
}

#[async_trait]
impl NewsSource for NewsApiClient {
    async fn fetch_news(&self, entity: &str) -> Result<Vec<DocumentHandle>, FetchError> {
        let entity = normalize_entity(entity)?;
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| FetchError::NotConfigured("news api key is not set".to_string()))?;

        let query = format!("{entity} stock OR {entity} revenue OR {entity} earnings");
        let page_size = self.config.page_size.to_string();
        let response = self
            .client
            .get(&self.config.endpoint)
            .header("X-Api-Key", api_key)
            .query(&[
                ("q", query.as_str()),
                ("language", "en"),
                ("sortBy", "publishedAt"),
                ("pageSize", page_size.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::BadResponse {
                url: self.config.endpoint.clone(),
                status: response.status().to_string(),
            });
        }
        let payload: NewsResponse = response.json().await?;

        let mut handles = Vec::with_capacity(payload.articles.len());
        for article in &payload.articles {
            let name = article_file_name(&article.published_at);
            if self.store.contains(&entity, &name)? {
                debug!(entity = %entity, document = %name, "article already stored");
                handles.push(DocumentHandle {
                    entity: entity.clone(),
                    path: self.store.document_path(&entity, &name)?,
                    name,
                });
                continue;
            }
            handles.push(
                self.store
                    .write_document(&entity, &name, render_article(article).as_bytes())?,
            );
        }

        info!(entity = %entity, articles = handles.len(), "stored news articles");
        Ok(handles)
    }
}

/// `2024-05-10T14:32:12Z` becomes `news-20240510T143212.txt`.
fn article_file_name(published_at: &str) -> String {
    let stamp: String = published_at
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() && *ch != 'Z')
        .collect();
    format!("news-{stamp}.txt")
}

fn render_article(article: &Article) -> String {
    let mut text = String::new();
    text.push_str(article.title.as_deref().unwrap_or_default());
    if let Some(description) = article.description.as_deref().filter(|d| !d.is_empty()) {
        text.push_str(" - ");
        text.push_str(description);
    }
    text.push('\n');
    if let Some(source) = &article.source.name {
        text.push_str(&format!("Source: {source}\n"));
    }
    text.push_str(&format!("URL: {}\nPublished: {}\n", article.url, article.published_at));
    text
}
