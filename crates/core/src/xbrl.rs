use crate::error::RagError;
use crate::models::{FactValue, FilingRecord, FormType, Metric, StructuredFact, YearComparison};
use crate::store::{normalize_entity, DocumentStore};
use chrono::{Datelike, NaiveDate};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

const LINKBASE_SUFFIXES: [&str; 5] = ["_cal.xml", "_def.xml", "_lab.xml", "_pre.xml", "_htm.xml"];

/// Text of the first element whose local name (namespace prefix stripped) is `tag_name`.
/// Elements with no text are skipped. Returns `Ok(None)` when nothing matches.
pub fn extract_fact(document: &str, tag_name: &str) -> Result<Option<FactValue>, RagError> {
    let mut reader = Reader::from_str(document);
    reader.trim_text(true);

    loop {
        match reader.read_event()? {
            Event::Start(element) if element.local_name().as_ref() == tag_name.as_bytes() => {
                let text = read_element_text(&mut reader)?;
                if !text.trim().is_empty() {
                    return Ok(Some(FactValue::parse(&text)));
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn read_element_text(reader: &mut Reader<&[u8]>) -> Result<String, RagError> {
    let mut depth = 1usize;
    let mut text = String::new();

    while depth > 0 {
        match reader.read_event()? {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth -= 1,
            Event::Text(content) => text.push_str(&content.unescape()?),
            Event::CData(content) => text.push_str(&String::from_utf8_lossy(&content.into_inner())),
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(text)
}

#[derive(Debug, Clone)]
struct Candidate {
    name: String,
    fiscal_year: i32,
    form_type: FormType,
    filing_date: NaiveDate,
}

/// Looks up single XBRL facts straight from an entity's instance documents.
#[derive(Debug, Clone)]
pub struct FactExtractor {
    store: DocumentStore,
    date_pattern: Regex,
}

impl FactExtractor {
    pub fn new(store: DocumentStore) -> Result<Self, RagError> {
        Ok(Self {
            store,
            date_pattern: Regex::new(r"(?:^|[^0-9])((?:19|20)\d{2})(\d{2})(\d{2})(?:[^0-9]|$)")?,
        })
    }

    /// First value for any of `tags` in the preferred filing covering `fiscal_year`:
    /// annual reports before quarterly ones, newer filings before older ones.
    pub fn extract(
        &self,
        entity: &str,
        tags: &[&str],
        fiscal_year: i32,
    ) -> Result<StructuredFact, RagError> {
        let entity = normalize_entity(entity)?;
        let candidates = self
            .candidates(&entity)?
            .into_iter()
            .filter(|candidate| candidate.fiscal_year == fiscal_year)
            .collect::<Vec<_>>();

        self.first_value(&entity, &candidates, tags)?.ok_or_else(|| {
            RagError::not_found(
                &entity,
                format!("no {} value for fiscal year {}", tags.join("/"), fiscal_year),
            )
        })
    }

    pub fn metric_for_year(
        &self,
        entity: &str,
        metric: Metric,
        fiscal_year: i32,
    ) -> Result<StructuredFact, RagError> {
        self.extract(entity, metric.tags(), fiscal_year)
    }

    /// Value from the most recent fiscal year that reports the metric.
    pub fn latest(&self, entity: &str, metric: Metric) -> Result<StructuredFact, RagError> {
        let entity = normalize_entity(entity)?;
        let candidates = self.candidates(&entity)?;

        self.first_value(&entity, &candidates, metric.tags())?
            .ok_or_else(|| RagError::not_found(&entity, format!("no {} data available", metric.label())))
    }

    pub fn by_year(
        &self,
        entity: &str,
        metric: Metric,
    ) -> Result<BTreeMap<i32, StructuredFact>, RagError> {
        let entity = normalize_entity(entity)?;
        let years = self
            .candidates(&entity)?
            .into_iter()
            .map(|candidate| candidate.fiscal_year)
            .collect::<BTreeSet<_>>();

        let mut values = BTreeMap::new();
        for year in years {
            match self.metric_for_year(&entity, metric, year) {
                Ok(fact) => {
                    values.insert(year, fact);
                }
                Err(RagError::NotFound { .. }) => {}
                Err(error) => return Err(error),
            }
        }
        Ok(values)
    }

    /// Integer values of `metric` for the fiscal years both entities report.
    pub fn compare(
        &self,
        first: &str,
        second: &str,
        metric: Metric,
    ) -> Result<YearComparison, RagError> {
        let left = self.by_year(first, metric)?;
        let right = self.by_year(second, metric)?;
        Ok(left
            .iter()
            .filter_map(|(year, fact)| {
                let other = right.get(year)?;
                Some((*year, (fact.value.as_i64()?, other.value.as_i64()?)))
            })
            .collect())
    }

    /// Net income as a percentage of revenue, per fiscal year where both are reported.
    pub fn profit_margins(&self, entity: &str) -> Result<BTreeMap<i32, f64>, RagError> {
        let income = self.by_year(entity, Metric::NetIncome)?;
        let revenue = self.by_year(entity, Metric::Revenue)?;
        Ok(income
            .iter()
            .filter_map(|(year, fact)| {
                let net = fact.value.as_i64()?;
                let sales = revenue.get(year)?.value.as_i64()?;
                (sales != 0).then(|| (*year, net as f64 / sales as f64 * 100.0))
            })
            .collect())
    }

    fn first_value(
        &self,
        entity: &str,
        candidates: &[Candidate],
        tags: &[&str],
    ) -> Result<Option<StructuredFact>, RagError> {
        let mut ordered = candidates.to_vec();
        ordered.sort_by(|left, right| {
            right
                .fiscal_year
                .cmp(&left.fiscal_year)
                .then(left.form_type.preference().cmp(&right.form_type.preference()))
                .then(right.filing_date.cmp(&left.filing_date))
        });

        for candidate in &ordered {
            let document = self.store.read_document(entity, &candidate.name)?;
            for tag in tags {
                match extract_fact(&document, tag) {
                    Ok(Some(value)) => {
                        return Ok(Some(StructuredFact {
                            entity: entity.to_string(),
                            tag_name: (*tag).to_string(),
                            fiscal_year: candidate.fiscal_year,
                            period: candidate.form_type,
                            value,
                            source: candidate.name.clone(),
                        }))
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(entity = %entity, document = %candidate.name, reason = %error, "unparseable instance document");
                        break;
                    }
                }
            }
        }

        Ok(None)
    }

    fn candidates(&self, entity: &str) -> Result<Vec<Candidate>, RagError> {
        let manifest = self.store.manifest(entity)?;
        let mut candidates = Vec::new();

        for document in self.store.documents(entity)? {
            if !is_instance_document(&document.name) {
                continue;
            }

            let record = manifest
                .iter()
                .find(|record| record.file_name.eq_ignore_ascii_case(&document.name));
            let name_date = self.date_from_name(&document.name);

            let Some(period_end) = record
                .and_then(|record| record.report_date)
                .or(name_date)
                .or_else(|| record.map(|record| record.filing_date))
            else {
                continue;
            };

            candidates.push(Candidate {
                name: document.name.clone(),
                fiscal_year: period_end.year(),
                form_type: record.map(FilingRecord::form_type).unwrap_or(FormType::Other),
                filing_date: record.map(|record| record.filing_date).unwrap_or(period_end),
            });
        }

        Ok(candidates)
    }

    fn date_from_name(&self, name: &str) -> Option<NaiveDate> {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        let captures = self.date_pattern.captures(file_name)?;
        let year = captures.get(1)?.as_str().parse().ok()?;
        let month = captures.get(2)?.as_str().parse().ok()?;
        let day = captures.get(3)?.as_str().parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    }
}

/// XBRL instance documents: `.xml` files that are not linkbases or the filing summary.
pub fn is_instance_document(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    let file_name = lower.rsplit('/').next().unwrap_or(&lower);
    file_name.ends_with(".xml")
        && file_name != "filingsummary.xml"
        && !LINKBASE_SUFFIXES.iter().any(|suffix| file_name.ends_with(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    const AAPL_2020: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xbrl xmlns:us-gaap="http://fasb.org/us-gaap/2020-01-31">
  <us-gaap:Revenues contextRef="FY2020">274515000000</us-gaap:Revenues>
  <us-gaap:NetIncomeLoss contextRef="FY2020">57411000000</us-gaap:NetIncomeLoss>
</xbrl>"#;

    fn extractor(root: &Path) -> Result<FactExtractor, RagError> {
        FactExtractor::new(DocumentStore::new(root, vec!["xml".to_string()]))
    }

    fn record(form: &str, filed: (i32, u32, u32), file_name: &str) -> FilingRecord {
        FilingRecord {
            accession: file_name.to_string(),
            form: form.to_string(),
            filing_date: NaiveDate::from_ymd_opt(filed.0, filed.1, filed.2).unwrap(),
            report_date: None,
            file_name: file_name.to_string(),
        }
    }

    #[test]
    fn namespace_prefix_is_stripped() -> Result<(), RagError> {
        assert_eq!(
            extract_fact(AAPL_2020, "NetIncomeLoss")?,
            Some(FactValue::Integer(57_411_000_000))
        );
        assert_eq!(extract_fact(AAPL_2020, "Assets")?, None);
        Ok(())
    }

    #[test]
    fn non_numeric_text_is_kept_as_text() -> Result<(), RagError> {
        let doc = "<xbrl><dei:EntityRegistrantName>Apple Inc.</dei:EntityRegistrantName></xbrl>";
        assert_eq!(
            extract_fact(doc, "EntityRegistrantName")?,
            Some(FactValue::Text("Apple Inc.".to_string()))
        );
        Ok(())
    }

    #[test]
    fn annual_net_income_scenario() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let extractor = extractor(dir.path())?;
        let store = DocumentStore::new(dir.path(), vec!["xml".to_string()]);
        store.write_document("AAPL", "aapl-20200926.xml", AAPL_2020.as_bytes())?;
        store.record_filings("AAPL", &[record("10-K", (2020, 10, 30), "aapl-20200926.xml")])?;

        let fact = extractor.metric_for_year("AAPL", Metric::NetIncome, 2020)?;
        assert_eq!(fact.value, FactValue::Integer(57_411_000_000));
        assert_eq!(fact.period, FormType::Annual);
        assert_eq!(fact.tag_name, "NetIncomeLoss");

        assert!(matches!(
            extractor.metric_for_year("AAPL", Metric::NetIncome, 2019),
            Err(RagError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn annual_report_beats_newer_quarterly() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let extractor = extractor(dir.path())?;
        let store = DocumentStore::new(dir.path(), vec!["xml".to_string()]);
        store.write_document(
            "AAPL",
            "aapl-20201226.xml",
            b"<xbrl><NetIncomeLoss>28755000000</NetIncomeLoss></xbrl>",
        )?;
        store.write_document("AAPL", "aapl-20200926.xml", AAPL_2020.as_bytes())?;
        store.record_filings(
            "AAPL",
            &[
                record("10-Q", (2021, 1, 28), "aapl-20201226.xml"),
                record("10-K", (2020, 10, 30), "aapl-20200926.xml"),
            ],
        )?;

        let fact = extractor.metric_for_year("AAPL", Metric::NetIncome, 2020)?;
        assert_eq!(fact.source, "aapl-20200926.xml");
        Ok(())
    }

    #[test]
    fn newer_filing_wins_among_same_form() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let extractor = extractor(dir.path())?;
        let store = DocumentStore::new(dir.path(), vec!["xml".to_string()]);
        store.write_document("MSFT", "msft-20200331.xml", b"<xbrl><Revenues>35021000000</Revenues></xbrl>")?;
        store.write_document("MSFT", "msft-20201231.xml", b"<xbrl><Revenues>43076000000</Revenues></xbrl>")?;

        let fact = extractor.metric_for_year("MSFT", Metric::Revenue, 2020)?;
        assert_eq!(fact.value, FactValue::Integer(43_076_000_000));
        Ok(())
    }

    #[test]
    fn latest_and_comparison() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let extractor = extractor(dir.path())?;
        let store = DocumentStore::new(dir.path(), vec!["xml".to_string()]);
        store.write_document("AAPL", "aapl-20200926.xml", AAPL_2020.as_bytes())?;
        store.write_document(
            "AAPL",
            "aapl-20210925.xml",
            b"<xbrl><Revenues>365817000000</Revenues><NetIncomeLoss>94680000000</NetIncomeLoss></xbrl>",
        )?;
        store.write_document(
            "MSFT",
            "msft-20200630.xml",
            b"<xbrl><Revenues>143015000000</Revenues><NetIncomeLoss>44281000000</NetIncomeLoss></xbrl>",
        )?;

        let latest = extractor.latest("AAPL", Metric::Revenue)?;
        assert_eq!(latest.fiscal_year, 2021);

        let comparison = extractor.compare("AAPL", "MSFT", Metric::NetIncome)?;
        assert_eq!(comparison.len(), 1);
        assert_eq!(comparison.get(&2020), Some(&(57_411_000_000, 44_281_000_000)));

        let margins = extractor.profit_margins("AAPL")?;
        assert!((margins[&2020] - 20.913).abs() < 0.01);
        Ok(())
    }

    #[test]
    fn linkbases_are_not_instances() {
        assert!(is_instance_document("aapl-20200926.xml"));
        assert!(!is_instance_document("aapl-20200926_cal.xml"));
        assert!(!is_instance_document("FilingSummary.xml"));
        assert!(!is_instance_document("aapl-20200926.htm"));
    }
}
