use crate::error::RagError;
use crate::models::{ArticleSentiment, SentimentLabel, SentimentScore};
use crate::store::{normalize_entity, DocumentStore};
use crate::traits::SentimentScorer;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Only the opening words of a text are scored.
pub const MAX_SCORED_WORDS: usize = 512;

/// Below this share of net polarity a text counts as neutral.
const NEUTRAL_MARGIN: f32 = 0.2;

const POSITIVE_WORDS: &[&str] = &[
    "beat", "beats", "boost", "boosted", "bullish", "buyback", "climb", "climbed", "exceed",
    "exceeded", "gain", "gained", "gains", "growth", "grew", "improve", "improved", "outperform",
    "outperformed", "profitable", "rallied", "rally", "record", "rise", "rises", "rose", "strong",
    "stronger", "surge", "surged", "upgrade", "upgraded",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bearish", "decline", "declined", "declines", "downgrade", "downgraded", "drop", "dropped",
    "fall", "falls", "fell", "impairment", "investigation", "lawsuit", "layoffs", "loss", "losses",
    "miss", "missed", "plunge", "plunged", "recall", "slump", "slumped", "weak", "weaker",
    "writedown",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "without", "nor"];

/// Word-list scorer for financial news tone. A negation flips the word right after it.
#[derive(Debug, Clone)]
pub struct LexiconSentimentScorer {
    word: Regex,
    positive: HashSet<&'static str>,
    negative: HashSet<&'static str>,
}

impl LexiconSentimentScorer {
    pub fn new() -> Result<Self, RagError> {
        Ok(Self {
            word: Regex::new(r"[A-Za-z][A-Za-z'-]*")?,
            positive: POSITIVE_WORDS.iter().copied().collect(),
            negative: NEGATIVE_WORDS.iter().copied().collect(),
        })
    }
}

impl SentimentScorer for LexiconSentimentScorer {
    fn score(&self, text: &str) -> Result<SentimentScore, RagError> {
        let mut positive = 0usize;
        let mut negative = 0usize;
        let mut negated = false;

        for token in self.word.find_iter(text).take(MAX_SCORED_WORDS) {
            let word = token.as_str().to_ascii_lowercase();
            let polarity = if self.positive.contains(word.as_str()) {
                Some(true)
            } else if self.negative.contains(word.as_str()) {
                Some(false)
            } else {
                None
            };
            match polarity {
                Some(is_positive) if is_positive != negated => positive += 1,
                Some(_) => negative += 1,
                None => {}
            }
            negated = NEGATIONS.contains(&word.as_str());
        }

        Ok(score_counts(positive, negative))
    }
}

fn score_counts(positive: usize, negative: usize) -> SentimentScore {
    let total = positive + negative;
    if total == 0 {
        return SentimentScore {
            label: SentimentLabel::Neutral,
            score: 1.0,
        };
    }

    let margin = positive.abs_diff(negative) as f32 / total as f32;
    if margin < NEUTRAL_MARGIN {
        return SentimentScore {
            label: SentimentLabel::Neutral,
            score: 1.0 - margin,
        };
    }
    SentimentScore {
        label: if positive > negative {
            SentimentLabel::Positive
        } else {
            SentimentLabel::Negative
        },
        score: 0.5 + margin / 2.0,
    }
}

/// News articles are stored as `news-<timestamp>.txt`, possibly under a subdirectory.
pub fn is_news_article(name: &str) -> bool {
    name.rsplit('/')
        .next()
        .is_some_and(|file_name| file_name.starts_with("news-"))
}

/// Scores every stored news article of `entity` in document order. Articles that can no
/// longer be read are skipped.
pub fn score_news(
    store: &DocumentStore,
    scorer: &dyn SentimentScorer,
    entity: &str,
) -> Result<Vec<ArticleSentiment>, RagError> {
    let entity = normalize_entity(entity)?;
    let articles = store
        .documents(&entity)?
        .into_iter()
        .filter(|document| is_news_article(&document.name))
        .collect::<Vec<_>>();
    if articles.is_empty() {
        return Err(RagError::not_found(&entity, "no news articles stored"));
    }

    let mut scored = Vec::with_capacity(articles.len());
    for article in articles {
        let text = match store.read_document(&entity, &article.name) {
            Ok(text) => text,
            Err(error) => {
                warn!(entity = %entity, source = %article.name, reason = %error, "skipped article");
                continue;
            }
        };
        let sentiment = scorer.score(&text)?;
        debug!(entity = %entity, source = %article.name, label = %sentiment.label, score = sentiment.score, "scored article");
        scored.push(ArticleSentiment {
            source: article.name,
            sentiment,
        });
    }
    Ok(scored)
}

/// Majority label across articles; its score is the share of articles carrying it.
/// A tie between the two leading labels is reported as neutral with the leaders' share.
pub fn overall_sentiment(articles: &[ArticleSentiment]) -> Option<SentimentScore> {
    if articles.is_empty() {
        return None;
    }

    let count = |label: SentimentLabel| {
        articles
            .iter()
            .filter(|article| article.sentiment.label == label)
            .count()
    };
    let mut tally = [
        (SentimentLabel::Positive, count(SentimentLabel::Positive)),
        (SentimentLabel::Negative, count(SentimentLabel::Negative)),
        (SentimentLabel::Neutral, count(SentimentLabel::Neutral)),
    ];
    tally.sort_by(|left, right| right.1.cmp(&left.1));

    let (label, votes) = if tally[0].1 == tally[1].1 {
        (SentimentLabel::Neutral, tally[0].1)
    } else {
        tally[0]
    };
    Some(SentimentScore {
        label,
        score: votes as f32 / articles.len() as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn label(text: &str) -> Result<SentimentLabel, RagError> {
        Ok(LexiconSentimentScorer::new()?.score(text)?.label)
    }

    #[test]
    fn tone_follows_financial_vocabulary() -> Result<(), RagError> {
        assert_eq!(
            label("Apple shares surged after earnings beat estimates and services revenue hit a record.")?,
            SentimentLabel::Positive
        );
        assert_eq!(
            label("The stock plunged as iPhone sales declined and the company missed guidance.")?,
            SentimentLabel::Negative
        );
        assert_eq!(label("The annual meeting is scheduled for March.")?, SentimentLabel::Neutral);
        Ok(())
    }

    #[test]
    fn negation_flips_the_next_word() -> Result<(), RagError> {
        assert_eq!(label("Margins did not improve.")?, SentimentLabel::Negative);
        assert_eq!(label("No decline in demand.")?, SentimentLabel::Positive);
        Ok(())
    }

    #[test]
    fn scores_stay_in_unit_range() -> Result<(), RagError> {
        let scorer = LexiconSentimentScorer::new()?;
        for text in ["", "gain", "gain loss", "gain gain loss", "loss loss loss"] {
            let score = scorer.score(text)?.score;
            assert!((0.0..=1.0).contains(&score), "{text:?} scored {score}");
        }
        assert_eq!(scorer.score("gain loss")?.label, SentimentLabel::Neutral);
        Ok(())
    }

    #[test]
    fn only_the_opening_words_count() -> Result<(), RagError> {
        let text = format!("{} {}", "quarterly ".repeat(MAX_SCORED_WORDS), "surged ".repeat(20));
        assert_eq!(label(&text)?, SentimentLabel::Neutral);
        Ok(())
    }

    #[test]
    fn stored_news_is_scored_per_article() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = DocumentStore::new(dir.path(), vec!["txt".to_string(), "xml".to_string()]);
        store.write_document("AAPL", "news-20240510T143212.txt", b"Shares rallied to a record high.")?;
        store.write_document("AAPL", "news-20240511T090000.txt", b"Analysts upgraded the stock on strong growth.")?;
        store.write_document("AAPL", "news-20240512T090000.txt", b"Regulators opened an investigation; shares fell.")?;
        store.write_document("AAPL", "aapl-20200926.xml", b"<xbrl>loss loss loss</xbrl>")?;

        let scorer = LexiconSentimentScorer::new()?;
        let articles = score_news(&store, &scorer, "aapl")?;
        let labels = articles
            .iter()
            .map(|article| (article.source.as_str(), article.sentiment.label))
            .collect::<Vec<_>>();
        assert_eq!(
            labels,
            vec![
                ("news-20240510T143212.txt", SentimentLabel::Positive),
                ("news-20240511T090000.txt", SentimentLabel::Positive),
                ("news-20240512T090000.txt", SentimentLabel::Negative),
            ]
        );

        let overall = overall_sentiment(&articles).ok_or("no articles")?;
        assert_eq!(overall.label, SentimentLabel::Positive);
        assert!((overall.score - 2.0 / 3.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn entity_without_news_is_not_found() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let store = DocumentStore::new(dir.path(), vec!["txt".to_string()]);
        store.write_document("MSFT", "msft-10k.txt", b"Annual report")?;
        let scorer = LexiconSentimentScorer::new()?;
        assert!(matches!(
            score_news(&store, &scorer, "MSFT"),
            Err(RagError::NotFound { .. })
        ));
        assert!(overall_sentiment(&[]).is_none());
        Ok(())
    }
}
