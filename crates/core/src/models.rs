use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A fixed-size slice of one source document. `offset_index * chunk_size` is the
/// character offset of `text` inside the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub source: String,
    pub offset_index: u64,
    pub text: String,
}

impl Chunk {
    pub fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor {
            source: self.source.clone(),
            offset_index: self.offset_index,
        }
    }
}

/// Pointer stored in the index metadata in place of the chunk text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub source: String,
    pub offset_index: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: ChunkDescriptor,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snippet {
    pub source: String,
    pub offset_index: u64,
    pub distance: f32,
    pub text: String,
}

impl fmt::Display for Snippet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [chunk {}]\n\n{}", self.source, self.offset_index, self.text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FormType {
    Annual,
    Quarterly,
    Other,
}

impl FormType {
    pub fn from_form(form: &str) -> Self {
        match form.trim().to_ascii_uppercase().as_str() {
            "10-K" | "10-K/A" | "10-K405" | "20-F" | "40-F" => Self::Annual,
            "10-Q" | "10-Q/A" => Self::Quarterly,
            _ => Self::Other,
        }
    }

    /// Lower is preferred when several filings cover the same fiscal year.
    pub fn preference(self) -> u8 {
        match self {
            Self::Annual => 0,
            Self::Quarterly => 1,
            Self::Other => 2,
        }
    }
}

/// One row of an entity's `filings.json` manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilingRecord {
    pub accession: String,
    pub form: String,
    pub filing_date: NaiveDate,
    #[serde(default)]
    pub report_date: Option<NaiveDate>,
    pub file_name: String,
}

impl FilingRecord {
    pub fn form_type(&self) -> FormType {
        FormType::from_form(&self.form)
    }
}

/// A document persisted under an entity's namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentHandle {
    pub entity: String,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Integer(i64),
    Text(String),
}

impl FactValue {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let numeric = trimmed
            .strip_prefix('-')
            .unwrap_or(trimmed)
            .chars()
            .all(|ch| ch.is_ascii_digit());

        if numeric && !trimmed.is_empty() && trimmed != "-" {
            if let Ok(value) = trimmed.parse::<i64>() {
                return Self::Integer(value);
            }
        }
        Self::Text(trimmed.to_string())
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredFact {
    pub entity: String,
    pub tag_name: String,
    pub fiscal_year: i32,
    pub period: FormType,
    pub value: FactValue,
    pub source: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    NetIncome,
    Revenue,
}

impl Metric {
    /// XBRL element names tried in order.
    pub fn tags(self) -> &'static [&'static str] {
        match self {
            Self::NetIncome => &["NetIncomeLoss", "ProfitLoss"],
            Self::Revenue => &[
                "Revenues",
                "SalesRevenueNet",
                "RevenueFromContractWithCustomerExcludingAssessedTax",
            ],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::NetIncome => "net income",
            Self::Revenue => "revenue",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['_', '-'], " ").as_str() {
            "net income" | "netincome" | "profit" | "profits" | "earnings" => Some(Self::NetIncome),
            "revenue" | "revenues" | "sales" => Some(Self::Revenue),
            _ => None,
        }
    }
}

/// Year-keyed metric values for two entities, used by comparison questions.
pub type YearComparison = BTreeMap<i32, (i64, i64)>;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub handler: String,
    pub entities: Vec<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts: Vec<StructuredFact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snippets: Vec<Snippet>,
}

impl Answer {
    pub fn text(handler: &str, entities: &[String], text: impl Into<String>) -> Self {
        Self {
            handler: handler.to_string(),
            entities: entities.to_vec(),
            text: text.into(),
            facts: Vec::new(),
            snippets: Vec::new(),
        }
    }

    pub fn with_facts(mut self, facts: Vec<StructuredFact>) -> Self {
        self.facts = facts;
        self
    }

    pub fn with_snippets(mut self, snippets: Vec<Snippet>) -> Self {
        self.snippets = snippets;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Positive => "Positive",
            Self::Negative => "Negative",
            Self::Neutral => "Neutral",
        })
    }
}

/// Tone of a text with a confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentScore {
    pub label: SentimentLabel,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleSentiment {
    pub source: String,
    pub sentiment: SentimentScore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub entity: String,
    pub chunk_count: usize,
    pub dimensions: usize,
    pub chunk_size: usize,
    pub built_at: DateTime<Utc>,
    pub chunks_per_source: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildReport {
    pub entity: String,
    pub documents: usize,
    pub chunks: usize,
    pub rebuilt: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fact_value_coerces_digits_only() {
        assert_eq!(FactValue::parse("57411000000"), FactValue::Integer(57_411_000_000));
        assert_eq!(FactValue::parse(" -12 "), FactValue::Integer(-12));
        assert_eq!(FactValue::parse("1.5"), FactValue::Text("1.5".to_string()));
        assert_eq!(FactValue::parse("Apple Inc."), FactValue::Text("Apple Inc.".to_string()));
        assert_eq!(FactValue::parse("-"), FactValue::Text("-".to_string()));
    }

    #[test]
    fn annual_forms_are_preferred() {
        assert!(FormType::from_form("10-K").preference() < FormType::from_form("10-q").preference());
        assert_eq!(FormType::from_form("8-K"), FormType::Other);
    }

    #[test]
    fn snippet_display_carries_provenance() {
        let snippet = Snippet {
            source: "aapl-20200926.htm".to_string(),
            offset_index: 3,
            distance: 0.5,
            text: "Net sales increased".to_string(),
        };
        assert_eq!(
            snippet.to_string(),
            "aapl-20200926.htm [chunk 3]\n\nNet sales increased"
        );
    }

    #[test]
    fn metric_names_parse() {
        assert_eq!(Metric::parse("Net_Income"), Some(Metric::NetIncome));
        assert_eq!(Metric::parse("revenues"), Some(Metric::Revenue));
        assert_eq!(Metric::parse("assets"), None);
    }
}
