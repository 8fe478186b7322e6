use crate::router::{AskContext, AskHandler};
use crate::{Answer, CompletionRequest, Metric, RagError, Snippet, StructuredFact};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use tokio::runtime::{Handle, RuntimeFlavor};

const SNIPPET_SEPARATOR: &str = "\n\n---\n\n";

/// Handlers in priority order; comparisons and year-scoped lookups come before the
/// "latest" lookups they overlap with, and the generic fallback is last.
pub fn default_handlers() -> Result<Vec<Box<dyn AskHandler>>, RagError> {
    Ok(vec![
        Box::new(ProfitMarginComparisonHandler::new()?),
        Box::new(ProfitComparisonHandler::new()?),
        Box::new(MetricByYearHandler::new(Metric::NetIncome)?),
        Box::new(MetricByYearHandler::new(Metric::Revenue)?),
        Box::new(FormFieldExtractionHandler::new()?),
        Box::new(LatestMetricHandler::new(Metric::NetIncome)?),
        Box::new(LatestMetricHandler::new(Metric::Revenue)?),
        Box::new(NewsRagHandler::new()?),
        Box::new(GenericFallbackHandler),
    ])
}

fn year_pattern() -> Result<Regex, RagError> {
    Ok(Regex::new(r"\b((?:19|20)\d{2})\b")?)
}

/// Distinct year-like tokens in `text`.
fn years_in(pattern: &Regex, text: &str) -> BTreeSet<i32> {
    pattern
        .captures_iter(text)
        .filter_map(|captures| captures.get(1)?.as_str().parse().ok())
        .collect()
}

fn single_year(pattern: &Regex, text: &str) -> Option<i32> {
    let years = years_in(pattern, text);
    if years.len() == 1 {
        years.into_iter().next()
    } else {
        None
    }
}

fn metric_pattern(metric: Metric) -> Result<Regex, RagError> {
    let pattern = match metric {
        Metric::NetIncome => r"(?i)\bnet\s+(?:income|earnings)\b",
        Metric::Revenue => r"(?i)\b(?:revenues?|net\s+sales)\b",
    };
    Ok(Regex::new(pattern)?)
}

fn require_entity<'a>(entities: &'a [String], what: &str) -> Result<&'a [String], RagError> {
    if entities.is_empty() {
        return Err(RagError::Ambiguous(format!(
            "{what} needs a company or ticker symbol"
        )));
    }
    Ok(entities)
}

fn require_pair<'a>(entities: &'a [String], what: &str) -> Result<(&'a str, &'a str), RagError> {
    match entities {
        [first, second, ..] => Ok((first.as_str(), second.as_str())),
        _ => Err(RagError::Ambiguous(format!(
            "{what} needs two companies, found {}",
            entities.len()
        ))),
    }
}

/// Fact and index lookups are blocking file I/O; keep them off the async workers.
/// `block_in_place` only exists on the multi-thread runtime, so a current-thread runtime
/// runs the work on a scoped thread instead.
fn blocking<T: Send>(work: impl FnOnce() -> T + Send) -> T {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(work),
        Ok(_) => std::thread::scope(|scope| match scope.spawn(work).join() {
            Ok(value) => value,
            Err(panic) => std::panic::resume_unwind(panic),
        }),
        Err(_) => work(),
    }
}

fn fact_lines(facts: &[StructuredFact], label: &str) -> String {
    facts
        .iter()
        .map(|fact| format!("{} {} {}: ${}", fact.entity, label, fact.fiscal_year, fact.value))
        .collect::<Vec<_>>()
        .join("\n")
}

/// "What was AAPL's net income in 2022?"
pub struct MetricByYearHandler {
    metric: Metric,
    metric_pattern: Regex,
    year_pattern: Regex,
}

impl MetricByYearHandler {
    pub fn new(metric: Metric) -> Result<Self, RagError> {
        Ok(Self {
            metric,
            metric_pattern: metric_pattern(metric)?,
            year_pattern: year_pattern()?,
        })
    }
}

#[async_trait]
impl AskHandler for MetricByYearHandler {
    fn name(&self) -> &'static str {
        match self.metric {
            Metric::NetIncome => "net_income_by_year",
            Metric::Revenue => "revenue_by_year",
        }
    }

    fn matches(&self, question: &str) -> bool {
        self.metric_pattern.is_match(question) && single_year(&self.year_pattern, question).is_some()
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        question: &str,
    ) -> Result<Answer, RagError> {
        let entities = require_entity(entities, self.metric.label())?;
        let year = single_year(&self.year_pattern, question)
            .ok_or_else(|| RagError::Ambiguous("expected exactly one fiscal year".to_string()))?;

        let facts = blocking(|| {
            entities
                .iter()
                .map(|entity| context.facts.metric_for_year(entity, self.metric, year))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let text = fact_lines(&facts, self.metric.label());
        Ok(Answer::text(self.name(), entities, text).with_facts(facts))
    }
}

/// "What is Apple's latest net income?" with no year in the question.
pub struct LatestMetricHandler {
    metric: Metric,
    metric_pattern: Regex,
    year_pattern: Regex,
    forward_looking: Regex,
}

impl LatestMetricHandler {
    pub fn new(metric: Metric) -> Result<Self, RagError> {
        Ok(Self {
            metric,
            metric_pattern: metric_pattern(metric)?,
            year_pattern: year_pattern()?,
            forward_looking: Regex::new(r"(?i)\b(?:stocks?|shares?|news|outlook|forecast|will)\b")?,
        })
    }
}

#[async_trait]
impl AskHandler for LatestMetricHandler {
    fn name(&self) -> &'static str {
        match self.metric {
            Metric::NetIncome => "latest_net_income",
            Metric::Revenue => "latest_revenue",
        }
    }

    fn matches(&self, question: &str) -> bool {
        self.metric_pattern.is_match(question)
            && years_in(&self.year_pattern, question).is_empty()
            && !self.forward_looking.is_match(question)
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        _question: &str,
    ) -> Result<Answer, RagError> {
        let entities = require_entity(entities, self.metric.label())?;
        let facts = blocking(|| {
            entities
                .iter()
                .map(|entity| context.facts.latest(entity, self.metric))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let text = facts
            .iter()
            .map(|fact| {
                format!(
                    "{} latest {} (fiscal {}): ${}",
                    fact.entity,
                    self.metric.label(),
                    fact.fiscal_year,
                    fact.value
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(Answer::text(self.name(), entities, text).with_facts(facts))
    }
}

/// "When did AAPL have more profits than MSFT?"
pub struct ProfitComparisonHandler {
    pattern: Regex,
    year_pattern: Regex,
}

impl ProfitComparisonHandler {
    pub fn new() -> Result<Self, RagError> {
        Ok(Self {
            pattern: Regex::new(
                r"(?i)\b(?:profits?|net\s+income|earnings)\b.*\bthan\b|\b(?:more|higher|greater)\s+(?:profits?|net\s+income|earnings)\b",
            )?,
            year_pattern: year_pattern()?,
        })
    }
}

#[async_trait]
impl AskHandler for ProfitComparisonHandler {
    fn name(&self) -> &'static str {
        "profit_comparison"
    }

    fn matches(&self, question: &str) -> bool {
        self.pattern.is_match(question)
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        question: &str,
    ) -> Result<Answer, RagError> {
        let (first, second) = require_pair(entities, "a profit comparison")?;
        let asked_year = single_year(&self.year_pattern, question);
        let comparison = blocking(|| context.facts.compare(first, second, Metric::NetIncome))?;

        let years = comparison
            .iter()
            .filter(|(year, _)| asked_year.map_or(true, |asked| asked == **year))
            .collect::<Vec<_>>();
        if years.is_empty() {
            return Err(RagError::not_found(
                format!("{first}/{second}"),
                match asked_year {
                    Some(year) => format!("no net income reported by both for {year}"),
                    None => "no fiscal year with net income reported by both".to_string(),
                },
            ));
        }

        let text = match years.iter().rev().find(|(_, (left, right))| left > right) {
            Some((year, (left, right))) => format!(
                "{first} had higher net income than {second} in {year}: ${left} vs ${right}"
            ),
            None => format!(
                "{first} did not have higher net income than {second} in any of {} compared year(s)",
                years.len()
            ),
        };

        Ok(Answer::text(self.name(), entities, text))
    }
}

/// "When did MSFT have a higher profit percentage than CRM?"
pub struct ProfitMarginComparisonHandler {
    pattern: Regex,
}

impl ProfitMarginComparisonHandler {
    pub fn new() -> Result<Self, RagError> {
        Ok(Self {
            pattern: Regex::new(
                r"(?i)\b(?:profit\s+(?:percentage|margin)s?|net\s+margins?|profitability)\b.*\bthan\b",
            )?,
        })
    }
}

#[async_trait]
impl AskHandler for ProfitMarginComparisonHandler {
    fn name(&self) -> &'static str {
        "profit_margin_comparison"
    }

    fn matches(&self, question: &str) -> bool {
        self.pattern.is_match(question)
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        _question: &str,
    ) -> Result<Answer, RagError> {
        let (first, second) = require_pair(entities, "a profit margin comparison")?;
        let (left, right) = blocking(|| {
            Ok::<_, RagError>((
                context.facts.profit_margins(first)?,
                context.facts.profit_margins(second)?,
            ))
        })?;

        let shared = left
            .iter()
            .filter_map(|(year, margin)| Some((*year, *margin, *right.get(year)?)))
            .collect::<Vec<_>>();
        if shared.is_empty() {
            return Err(RagError::not_found(
                format!("{first}/{second}"),
                "no fiscal year with revenue and net income reported by both",
            ));
        }

        let text = match shared.iter().rev().find(|(_, mine, theirs)| mine > theirs) {
            Some((year, mine, theirs)) => format!(
                "{first} had a higher profit percentage than {second} in {year}: {mine:.2}% vs {theirs:.2}%"
            ),
            None => format!(
                "{first} did not have a higher profit percentage than {second} in any of {} compared year(s)",
                shared.len()
            ),
        };

        Ok(Answer::text(self.name(), entities, text))
    }
}

/// Any XBRL element named verbatim, e.g. "EntityCommonStockSharesOutstanding for AAPL in 2021".
pub struct FormFieldExtractionHandler {
    tag_pattern: Regex,
    year_pattern: Regex,
}

impl FormFieldExtractionHandler {
    pub fn new() -> Result<Self, RagError> {
        Ok(Self {
            tag_pattern: Regex::new(r"\b((?:[A-Z][a-z0-9]+){3,})\b")?,
            year_pattern: year_pattern()?,
        })
    }

    fn tag<'a>(&self, question: &'a str) -> Option<&'a str> {
        self.tag_pattern
            .captures(question)
            .and_then(|captures| captures.get(1))
            .map(|tag| tag.as_str())
    }
}

#[async_trait]
impl AskHandler for FormFieldExtractionHandler {
    fn name(&self) -> &'static str {
        "form_field_extraction"
    }

    fn matches(&self, question: &str) -> bool {
        self.tag(question).is_some() && single_year(&self.year_pattern, question).is_some()
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        question: &str,
    ) -> Result<Answer, RagError> {
        let entities = require_entity(entities, "a filing field lookup")?;
        let (Some(tag), Some(year)) = (self.tag(question), single_year(&self.year_pattern, question))
        else {
            return Err(RagError::Ambiguous(
                "expected one XBRL element name and one fiscal year".to_string(),
            ));
        };

        let facts = blocking(|| {
            entities
                .iter()
                .map(|entity| context.facts.extract(entity, &[tag], year))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let text = facts
            .iter()
            .map(|fact| format!("{} {} {}: {}", fact.entity, fact.tag_name, fact.fiscal_year, fact.value))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Answer::text(self.name(), entities, text).with_facts(facts))
    }
}

/// Stock and news questions: latest revenue plus retrieved passages, answered by the
/// completion service.
pub struct NewsRagHandler {
    pattern: Regex,
}

impl NewsRagHandler {
    pub fn new() -> Result<Self, RagError> {
        Ok(Self {
            pattern: Regex::new(r"(?i)\b(?:stocks?|shares?|news|headlines?|outlook)\b")?,
        })
    }
}

#[async_trait]
impl AskHandler for NewsRagHandler {
    fn name(&self) -> &'static str {
        "news_rag"
    }

    fn matches(&self, question: &str) -> bool {
        self.pattern.is_match(question)
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        question: &str,
    ) -> Result<Answer, RagError> {
        let entities = require_entity(entities, "a news question")?;

        let (revenue_lines, snippets) = blocking(|| {
            let mut revenue_lines = Vec::new();
            for entity in entities {
                match context.facts.latest(entity, Metric::Revenue) {
                    Ok(fact) => revenue_lines.push(format!(
                        "{}'s most recent reported revenue (fiscal {}) was ${}.",
                        fact.entity, fact.fiscal_year, fact.value
                    )),
                    Err(RagError::NotFound { .. }) => {
                        revenue_lines.push(format!("No reported revenue is on file for {entity}."))
                    }
                    Err(error) => return Err(error),
                }
            }
            let snippets = retrieve_for_all(context, entities, question)?;
            Ok::<_, RagError>((revenue_lines, snippets))
        })?;

        let prompt = format!(
            "You are an equity research assistant. {}\nBelow are recent news and filing excerpts relevant to {}:\n\n{}\n\nQuestion: {}\n",
            revenue_lines.join(" "),
            entities.join(", "),
            join_snippets(&snippets),
            question
        );
        let text = context
            .completion
            .complete(&CompletionRequest {
                system: "You are a financial analyst.".to_string(),
                prompt,
                temperature: 0.2,
                max_tokens: 200,
            })
            .await?;

        Ok(Answer::text(self.name(), entities, text.trim()).with_snippets(snippets))
    }
}

/// Retrieval plus generation for anything no other handler claims.
pub struct GenericFallbackHandler;

#[async_trait]
impl AskHandler for GenericFallbackHandler {
    fn name(&self) -> &'static str {
        "generic_fallback"
    }

    fn matches(&self, _question: &str) -> bool {
        true
    }

    fn is_fallback(&self) -> bool {
        true
    }

    async fn handle(
        &self,
        context: &AskContext,
        entities: &[String],
        question: &str,
    ) -> Result<Answer, RagError> {
        let entities = require_entity(entities, "this question")?;
        let snippets = blocking(|| retrieve_for_all(context, entities, question))?;
        if snippets.is_empty() {
            return Err(RagError::not_found(
                entities.join(","),
                "no indexed passages could be read back for this question",
            ));
        }

        let prompt = format!(
            "You are a financial analyst assistant. Use the following document excerpts to answer the question.\nExcerpts:\n{}\n\nQuestion: {}\n",
            join_snippets(&snippets),
            question
        );
        let text = context
            .completion
            .complete(&CompletionRequest {
                system: "You answer financial queries based on provided context.".to_string(),
                prompt,
                temperature: 0.0,
                max_tokens: 300,
            })
            .await?;

        Ok(Answer::text(self.name(), entities, text.trim()).with_snippets(snippets))
    }
}

/// Top snippets across all entities, closest first, capped at the context's `top_k`.
fn retrieve_for_all(
    context: &AskContext,
    entities: &[String],
    question: &str,
) -> Result<Vec<Snippet>, RagError> {
    let mut snippets = Vec::new();
    for entity in entities {
        snippets.extend(context.retrieval.retrieve(entity, question, context.top_k)?);
    }
    snippets.sort_by(|left, right| left.distance.total_cmp(&right.distance));
    snippets.truncate(context.top_k);
    Ok(snippets)
}

fn join_snippets(snippets: &[Snippet]) -> String {
    snippets
        .iter()
        .map(Snippet::to_string)
        .collect::<Vec<_>>()
        .join(SNIPPET_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::{CharacterNgramEmbedder, EmbeddingProvider};
    use crate::index::VectorIndexManager;
    use crate::retrieval::RetrievalService;
    use crate::router::IntentRouter;
    use crate::store::DocumentStore;
    use crate::traits::CompletionService;
    use crate::xbrl::FactExtractor;
    use crate::FactValue;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingCompletion {
        prompts: Mutex<Vec<CompletionRequest>>,
    }

    #[async_trait]
    impl CompletionService for RecordingCompletion {
        async fn complete(&self, request: &CompletionRequest) -> Result<String, RagError> {
            self.prompts
                .lock()
                .map_err(|_| RagError::InvalidArgument("poisoned".to_string()))?
                .push(request.clone());
            Ok(" generated answer ".to_string())
        }
    }

    fn seeded_context(root: &Path, completion: Arc<RecordingCompletion>) -> Result<AskContext, RagError> {
        let store = DocumentStore::new(root, vec!["xml".to_string(), "txt".to_string()]);
        store.write_document(
            "AAPL",
            "aapl-20200926.xml",
            b"<xbrl xmlns:us-gaap=\"http://fasb.org/us-gaap/2020-01-31\"><us-gaap:Revenues>274515000000</us-gaap:Revenues><us-gaap:NetIncomeLoss>57411000000</us-gaap:NetIncomeLoss><dei:EntityCommonStockSharesOutstanding>17001802000</dei:EntityCommonStockSharesOutstanding></xbrl>",
        )?;
        store.write_document(
            "AAPL",
            "aapl-20210925.xml",
            b"<xbrl><Revenues>365817000000</Revenues><NetIncomeLoss>94680000000</NetIncomeLoss></xbrl>",
        )?;
        store.write_document(
            "AAPL",
            "news/news-20240510.txt",
            b"Apple shares climbed after the company announced a record buyback.",
        )?;
        store.write_document(
            "MSFT",
            "msft-20200630.xml",
            b"<xbrl><Revenues>143015000000</Revenues><NetIncomeLoss>44281000000</NetIncomeLoss></xbrl>",
        )?;
        store.write_document(
            "MSFT",
            "msft-20210630.xml",
            b"<xbrl><Revenues>168088000000</Revenues><NetIncomeLoss>61271000000</NetIncomeLoss></xbrl>",
        )?;

        let embeddings = Arc::new(EmbeddingProvider::from_embedder(Arc::new(
            CharacterNgramEmbedder::default(),
        )));
        let indexes = Arc::new(VectorIndexManager::new(
            store.clone(),
            embeddings,
            ChunkingConfig { chunk_size: 64 },
        ));
        Ok(AskContext {
            facts: FactExtractor::new(store)?,
            retrieval: Arc::new(RetrievalService::new(indexes)),
            completion,
            top_k: 3,
        })
    }

    fn tickers(symbols: &[&str]) -> Vec<String> {
        symbols.iter().map(|symbol| symbol.to_string()).collect()
    }

    #[test]
    fn year_scoped_handler_precedes_latest() -> Result<(), RagError> {
        let router = IntentRouter::with_default_handlers()?;
        assert_eq!(
            router.select("What was the latest AAPL net income in 2020?").name(),
            "net_income_by_year"
        );
        assert_eq!(
            router.select("What is AAPL's latest net income?").name(),
            "latest_net_income"
        );
        assert_eq!(router.select("AAPL revenue 2021").name(), "revenue_by_year");
        assert_eq!(
            router.select("Compare AAPL revenue in 2020 and 2021").name(),
            "generic_fallback"
        );
        Ok(())
    }

    #[test]
    fn specific_comparisons_precede_general_ones() -> Result<(), RagError> {
        let router = IntentRouter::with_default_handlers()?;
        assert_eq!(
            router
                .select("When did MSFT have a higher profit percentage than CRM?")
                .name(),
            "profit_margin_comparison"
        );
        assert_eq!(
            router.select("When did AAPL have more profits than MSFT?").name(),
            "profit_comparison"
        );
        assert_eq!(
            router
                .select("Based on AAPL's recent revenue, will their stocks go higher?")
                .name(),
            "news_rag"
        );
        assert_eq!(
            router
                .select("What was EntityCommonStockSharesOutstanding for AAPL in 2020?")
                .name(),
            "form_field_extraction"
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn net_income_for_year_uses_structured_facts() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let completion = Arc::new(RecordingCompletion::default());
        let context = seeded_context(dir.path(), Arc::clone(&completion))?;
        let router = IntentRouter::with_default_handlers()?;

        let answer = router
            .route(&context, &tickers(&["AAPL"]), "What was AAPL net income in 2020?")
            .await?;
        assert_eq!(answer.handler, "net_income_by_year");
        assert_eq!(answer.facts[0].value, FactValue::Integer(57_411_000_000));
        assert_eq!(answer.text, "AAPL net income 2020: $57411000000");
        assert!(completion.prompts.lock().map_err(|_| "poisoned")?.is_empty());

        let missing = router
            .route(&context, &tickers(&["AAPL"]), "What was AAPL net income in 2019?")
            .await;
        assert!(matches!(missing, Err(RagError::NotFound { .. })));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn comparison_with_one_entity_is_ambiguous() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let context = seeded_context(dir.path(), Arc::new(RecordingCompletion::default()))?;
        let router = IntentRouter::with_default_handlers()?;

        let result = router
            .route(&context, &tickers(&["AAPL"]), "When did AAPL have more profits than MSFT?")
            .await;
        assert!(matches!(result, Err(RagError::Ambiguous(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn profit_comparison_finds_latest_winning_year() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let context = seeded_context(dir.path(), Arc::new(RecordingCompletion::default()))?;
        let router = IntentRouter::with_default_handlers()?;

        let answer = router
            .route(
                &context,
                &tickers(&["AAPL", "MSFT"]),
                "When did AAPL have more profits than MSFT?",
            )
            .await?;
        assert_eq!(
            answer.text,
            "AAPL had higher net income than MSFT in 2021: $94680000000 vs $61271000000"
        );

        let margins = router
            .route(
                &context,
                &tickers(&["MSFT", "AAPL"]),
                "When did MSFT have a higher profit percentage than AAPL?",
            )
            .await?;
        assert!(margins.text.starts_with("MSFT had a higher profit percentage than AAPL in 2021"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn latest_metric_picks_newest_year() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let context = seeded_context(dir.path(), Arc::new(RecordingCompletion::default()))?;
        let router = IntentRouter::with_default_handlers()?;

        let answer = router
            .route(&context, &tickers(&["AAPL"]), "What is the latest revenue?")
            .await?;
        assert_eq!(answer.handler, "latest_revenue");
        assert_eq!(answer.facts[0].fiscal_year, 2021);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn form_field_extraction_reads_any_tag() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let context = seeded_context(dir.path(), Arc::new(RecordingCompletion::default()))?;
        let router = IntentRouter::with_default_handlers()?;

        let answer = router
            .route(
                &context,
                &tickers(&["AAPL"]),
                "What was EntityCommonStockSharesOutstanding in 2020?",
            )
            .await?;
        assert_eq!(answer.facts[0].value, FactValue::Integer(17_001_802_000));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn news_question_assembles_prompt() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let completion = Arc::new(RecordingCompletion::default());
        let context = seeded_context(dir.path(), Arc::clone(&completion))?;
        let router = IntentRouter::with_default_handlers()?;

        let answer = router
            .route(
                &context,
                &tickers(&["AAPL"]),
                "What does the recent news say about Apple stock?",
            )
            .await?;
        assert_eq!(answer.handler, "news_rag");
        assert_eq!(answer.text, "generated answer");
        assert!(!answer.snippets.is_empty());

        let prompts = completion.prompts.lock().map_err(|_| "poisoned")?;
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].prompt.contains("$365817000000"));
        assert!(prompts[0].prompt.contains("Question: What does the recent news say about Apple stock?"));
        assert_eq!(prompts[0].max_tokens, 200);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fallback_retrieves_and_generates() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let completion = Arc::new(RecordingCompletion::default());
        let context = seeded_context(dir.path(), Arc::clone(&completion))?;
        let router = IntentRouter::with_default_handlers()?;

        let answer = router
            .route(&context, &tickers(&["AAPL"]), "Summarize the buyback program")
            .await?;
        assert_eq!(answer.handler, "generic_fallback");
        assert!(answer.snippets.len() <= 3);
        assert!(answer.snippets.iter().all(|snippet| !snippet.text.is_empty()));

        let no_entity = router.route(&context, &[], "qwerty ???").await;
        assert!(matches!(no_entity, Err(RagError::Ambiguous(_))));
        Ok(())
    }

    #[tokio::test]
    async fn retrieval_handlers_work_on_a_current_thread_runtime() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let completion = Arc::new(RecordingCompletion::default());
        let context = seeded_context(dir.path(), Arc::clone(&completion))?;
        let router = IntentRouter::with_default_handlers()?;

        let answer = router
            .route(&context, &tickers(&["AAPL"]), "Summarize the buyback program")
            .await?;
        assert_eq!(answer.handler, "generic_fallback");
        assert!(!answer.snippets.is_empty());

        let latest = router
            .route(&context, &tickers(&["AAPL"]), "What is the latest revenue?")
            .await?;
        assert_eq!(latest.facts[0].fiscal_year, 2021);
        Ok(())
    }
}
