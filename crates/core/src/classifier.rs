use crate::error::RagError;
use crate::traits::Classifier;
use regex::Regex;

pub const UNCLASSIFIED: &str = "UNCLASSIFIED";

/// Labels text by counting characteristic phrases of each document kind. Ties and texts
/// without any hit are `UNCLASSIFIED`.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<(&'static str, Regex)>,
}

impl KeywordClassifier {
    pub fn new() -> Result<Self, RagError> {
        let rules = [
            (
                "10-K",
                r"(?i)\b(?:form\s+10-k|annual\s+report|fiscal\s+year\s+ended|item\s+7a?\b)",
            ),
            (
                "10-Q",
                r"(?i)\b(?:form\s+10-q|quarterly\s+report|three\s+months\s+ended|six\s+months\s+ended|nine\s+months\s+ended)",
            ),
            (
                "8-K",
                r"(?i)\b(?:form\s+8-k|current\s+report|item\s+[1-9]\.\d{2}|date\s+of\s+report)",
            ),
            (
                "NEWS",
                r"(?i)\b(?:according\s+to|analysts?|reported\s+on|shares\s+(?:rose|fell|climbed|dropped)|told\s+reporters|headline)",
            ),
        ];

        Ok(Self {
            rules: rules
                .into_iter()
                .map(|(label, pattern)| Regex::new(pattern).map(|regex| (label, regex)))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.rules.iter().map(|(label, _)| *label).collect()
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Result<String, RagError> {
        let mut best: Option<(&str, usize)> = None;
        let mut tied = false;

        for (label, pattern) in &self.rules {
            let hits = pattern.find_iter(text).count();
            if hits == 0 {
                continue;
            }
            match best {
                Some((_, top)) if hits < top => {}
                Some((_, top)) if hits == top => tied = true,
                _ => {
                    best = Some((*label, hits));
                    tied = false;
                }
            }
        }

        Ok(match best {
            Some((label, _)) if !tied => label.to_string(),
            _ => UNCLASSIFIED.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annual_report_language_is_10k() -> Result<(), RagError> {
        let classifier = KeywordClassifier::new()?;
        let text = "ANNUAL REPORT PURSUANT TO SECTION 13. For the fiscal year ended September 26, 2020. Form 10-K";
        assert_eq!(classifier.classify(text)?, "10-K");
        Ok(())
    }

    #[test]
    fn quarterly_and_news_texts() -> Result<(), RagError> {
        let classifier = KeywordClassifier::new()?;
        assert_eq!(
            classifier.classify("Quarterly report for the three months ended June 27, 2020")?,
            "10-Q"
        );
        assert_eq!(
            classifier.classify("Shares rose 4% after analysts raised targets, according to Reuters.")?,
            "NEWS"
        );
        Ok(())
    }

    #[test]
    fn unknown_or_tied_text_is_unclassified() -> Result<(), RagError> {
        let classifier = KeywordClassifier::new()?;
        assert_eq!(classifier.classify("lorem ipsum")?, UNCLASSIFIED);
        assert_eq!(classifier.classify("")?, UNCLASSIFIED);
        assert_eq!(classifier.classify("annual report; quarterly report")?, UNCLASSIFIED);
        Ok(())
    }
}
