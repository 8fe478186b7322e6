use crate::config::EdgarConfig;
use crate::error::FetchError;
use crate::models::{DocumentHandle, FilingRecord};
use crate::store::{normalize_entity, DocumentStore};
use crate::traits::FilingSource;
use crate::xbrl::is_instance_document;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// SEC EDGAR filing source: resolves tickers to CIKs, lists recent filings and downloads
/// each filing's primary document into the entity namespace.
pub struct EdgarClient {
    client: Client,
    config: EdgarConfig,
    store: DocumentStore,
    cik_map: OnceCell<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    cik_str: u64,
    ticker: String,
}

#[derive(Debug, Default, Deserialize)]
struct Submissions {
    #[serde(default)]
    filings: SubmissionFilings,
}

#[derive(Debug, Default, Deserialize)]
struct SubmissionFilings {
    #[serde(default)]
    recent: RecentFilings,
}

/// Column-oriented listing as served by `submissions/CIK##########.json`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecentFilings {
    #[serde(default)]
    accession_number: Vec<String>,
    #[serde(default)]
    form: Vec<String>,
    #[serde(default)]
    filing_date: Vec<String>,
    #[serde(default)]
    report_date: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct FilingIndex {
    directory: FilingDirectory,
}

#[derive(Debug, Deserialize)]
struct FilingDirectory {
    #[serde(default)]
    item: Vec<FilingIndexItem>,
}

#[derive(Debug, Deserialize)]
struct FilingIndexItem {
    name: String,
}

/// A listed filing before its primary document is known.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedFiling {
    accession: String,
    form: String,
    filing_date: NaiveDate,
    report_date: Option<NaiveDate>,
}

impl EdgarClient {
    pub fn new(config: EdgarConfig, store: DocumentStore) -> Result<Self, FetchError> {
        url::Url::parse(&config.tickers_url)?;
        url::Url::parse(&config.submissions_base)?;
        url::Url::parse(&config.archives_base)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent).map_err(|_| {
                FetchError::NotConfigured(format!("invalid user agent {:?}", config.user_agent))
            })?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            config,
            store,
            cik_map: OnceCell::new(),
        })
    }

    /// Zero-padded ten digit CIK for `ticker`. The ticker map is downloaded once per client.
    pub async fn cik_for(&self, ticker: &str) -> Result<String, FetchError> {
        let map = self
            .cik_map
            .get_or_try_init(|| async {
                let entries: HashMap<String, TickerEntry> =
                    self.get_json(&self.config.tickers_url).await?;
                info!(tickers = entries.len(), "loaded ticker map");
                Ok::<_, FetchError>(cik_map_from(entries.into_values()))
            })
            .await?;

        map.get(&ticker.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| FetchError::UnknownEntity(ticker.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::BadResponse {
                url: url.to_string(),
                status: response.status().to_string(),
            });
        }
        Ok(response.json().await?)
    }

    async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::BadResponse {
                url: url.to_string(),
                status: response.status().to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    fn filing_base(&self, cik: &str, accession: &str) -> String {
        let cik = cik.trim_start_matches('0');
        format!(
            "{}/{}/{}",
            self.config.archives_base.trim_end_matches('/'),
            cik,
            accession
        )
    }

    /// Downloads one filing's primary document unless the manifest already records it and
    /// the file is on disk.
    async fn fetch_filing(
        &self,
        entity: &str,
        cik: &str,
        filing: &ListedFiling,
        manifest: &[FilingRecord],
    ) -> Result<Option<(FilingRecord, DocumentHandle)>, FetchError> {
        if let Some(existing) = manifest
            .iter()
            .find(|record| record.accession == filing.accession)
        {
            if self.store.contains(entity, &existing.file_name)? {
                debug!(entity = %entity, accession = %filing.accession, "already downloaded");
                let path = self.store.document_path(entity, &existing.file_name)?;
                return Ok(Some((
                    existing.clone(),
                    DocumentHandle {
                        entity: entity.to_string(),
                        name: existing.file_name.clone(),
                        path,
                    },
                )));
            }
        }

        let base = self.filing_base(cik, &filing.accession);
        let index: FilingIndex = self.get_json(&format!("{base}/index.json")).await?;
        let names = index
            .directory
            .item
            .iter()
            .map(|item| item.name.as_str())
            .collect::<Vec<_>>();

        let Some(primary) = choose_primary_document(&names) else {
            warn!(entity = %entity, accession = %filing.accession, "no XBRL instance or HTML document in filing");
            return Ok(None);
        };

        let contents = match self.get_bytes(&format!("{base}/{primary}")).await {
            Ok(contents) => contents,
            Err(error) => {
                warn!(entity = %entity, document = %primary, reason = %error, "download failed, skipping filing");
                return Ok(None);
            }
        };
        let handle = self.store.write_document(entity, primary, &contents)?;
        info!(entity = %entity, document = %primary, bytes = contents.len(), "downloaded filing");

        Ok(Some((
            FilingRecord {
                accession: filing.accession.clone(),
                form: filing.form.clone(),
                filing_date: filing.filing_date,
                report_date: filing.report_date,
                file_name: primary.to_string(),
            },
            handle,
        )))
    }

    /// Fetches each listed filing in turn. A filing whose EDGAR requests fail is skipped;
    /// a local storage failure ends the run. Filings completed before either are always
    /// written to the manifest.
    async fn fetch_listed(
        &self,
        entity: &str,
        cik: &str,
        listed: &[ListedFiling],
    ) -> Result<Vec<DocumentHandle>, FetchError> {
        let manifest = self.store.manifest(entity)?;
        let mut records = Vec::new();
        let mut handles = Vec::new();
        let mut failure = None;

        for filing in listed {
            match self.fetch_filing(entity, cik, filing, &manifest).await {
                Ok(Some((record, handle))) => {
                    records.push(record);
                    handles.push(handle);
                }
                Ok(None) => {}
                Err(
                    error @ (FetchError::Http(_)
                    | FetchError::BadResponse { .. }
                    | FetchError::Serialization(_)),
                ) => {
                    warn!(entity = %entity, accession = %filing.accession, reason = %error, "filing unavailable, skipping");
                }
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        self.store.record_filings(entity, &records)?;
        match failure {
            Some(error) => Err(error),
            None => Ok(handles),
        }
    }
}

#[async_trait]
impl FilingSource for EdgarClient {
    async fn fetch(
        &self,
        entity: &str,
        count: usize,
        form_types: &[String],
    ) -> Result<Vec<DocumentHandle>, FetchError> {
        let entity = normalize_entity(entity)?;
        let cik = self.cik_for(&entity).await?;
        let submissions: Submissions = self
            .get_json(&format!(
                "{}/CIK{}.json",
                self.config.submissions_base.trim_end_matches('/'),
                cik
            ))
            .await?;

        let listed = recent_filings(&submissions.filings.recent, form_types, count);
        info!(entity = %entity, cik = %cik, filings = listed.len(), "listed recent filings");

        self.fetch_listed(&entity, &cik, &listed).await
    }
}

fn cik_map_from(entries: impl IntoIterator<Item = TickerEntry>) -> HashMap<String, String> {
    entries
        .into_iter()
        .map(|entry| (entry.ticker.to_ascii_uppercase(), format!("{:010}", entry.cik_str)))
        .collect()
}

/// Up to `count` filings of the requested forms, in listing order (newest first).
/// Rows with an unparseable filing date are skipped.
fn recent_filings(recent: &RecentFilings, form_types: &[String], count: usize) -> Vec<ListedFiling> {
    recent
        .accession_number
        .iter()
        .zip(&recent.form)
        .zip(&recent.filing_date)
        .enumerate()
        .filter(|(_, ((_, form), _))| form_types.iter().any(|wanted| wanted == *form))
        .filter_map(|(row, ((accession, form), filing_date))| {
            Some(ListedFiling {
                accession: accession.replace('-', ""),
                form: form.clone(),
                filing_date: NaiveDate::parse_from_str(filing_date, "%Y-%m-%d").ok()?,
                report_date: recent
                    .report_date
                    .get(row)
                    .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()),
            })
        })
        .take(count)
        .collect()
}

/// The XBRL instance document if the filing has one, else the first HTML document.
pub fn choose_primary_document<'a>(names: &[&'a str]) -> Option<&'a str> {
    let instance = names.iter().copied().find(|name| is_instance_document(name));

    instance.or_else(|| {
        names.iter().copied().find(|name| {
            let lower = name.to_ascii_lowercase();
            lower.ends_with(".htm") || lower.ends_with(".html")
        })
    })
}
