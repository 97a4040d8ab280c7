//! Free-text location to ISO3 resolution.
//!
//! Cascade: exact name/ISO2/ISO3 lookup, fuzzy name search, fuzzy search
//! again with qualifiers stripped, then the hand-maintained exception table.
//! Whatever is left is unmatched and stays that way until the table grows.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use giatar_sources::LocationHint;
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

const EMBEDDED_COUNTRIES: &str = include_str!("../data/countries.csv");

/// Minimum Jaro-Winkler similarity per word for a fuzzy country hit.
pub const FUZZY_THRESHOLD: f64 = 0.92;
const MIN_FRAGMENT_LEN: usize = 4;

static PARENTHETICAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s*\([^)]*\)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Country {
    pub iso2: String,
    pub iso3: String,
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CountryCsvRow {
    iso2: String,
    iso3: String,
    name: String,
    #[serde(default)]
    aliases: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CountryTable {
    countries: Vec<Country>,
    /// Folded name, alias, ISO2 and ISO3 to an index into `countries`.
    by_key: HashMap<String, usize>,
    /// Folded labels for fuzzy search, with the country index.
    labels: Vec<(String, usize)>,
}

/// Lowercase, punctuation to spaces, whitespace collapsed.
pub fn fold(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn exception_key(text: &str) -> String {
    text.to_lowercase().chars().filter(|c| c.is_alphanumeric()).collect()
}

/// Drop a leading "the " and any parenthetical qualifiers.
pub fn strip_qualifiers(text: &str) -> String {
    let without_parens = PARENTHETICAL.replace_all(text, "");
    let trimmed = without_parens.trim();
    let lower = trimmed.to_lowercase();
    let rest = if lower.starts_with("the ") { &trimmed[4..] } else { trimmed };
    rest.trim().to_string()
}

impl CountryTable {
    pub fn embedded() -> Result<Self> {
        Self::from_csv(EMBEDDED_COUNTRIES.as_bytes()).context("parsing embedded country table")
    }

    pub fn from_csv(bytes: &[u8]) -> Result<Self> {
        let mut reader = csv::Reader::from_reader(bytes);
        let mut countries = Vec::new();
        for row in reader.deserialize::<CountryCsvRow>() {
            let row = row.context("decoding country row")?;
            let aliases = row
                .aliases
                .unwrap_or_default()
                .split('|')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string)
                .collect();
            countries.push(Country {
                iso2: row.iso2.trim().to_ascii_uppercase(),
                iso3: row.iso3.trim().to_ascii_uppercase(),
                name: row.name.trim().to_string(),
                aliases,
            });
        }

        let mut by_key = HashMap::new();
        let mut labels = Vec::new();
        for (idx, country) in countries.iter().enumerate() {
            for label in std::iter::once(&country.name).chain(country.aliases.iter()) {
                let folded = fold(label);
                by_key.entry(folded.clone()).or_insert(idx);
                labels.push((folded, idx));
            }
            by_key.entry(fold(&country.iso2)).or_insert(idx);
            by_key.entry(fold(&country.iso3)).or_insert(idx);
        }
        Ok(Self {
            countries,
            by_key,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.countries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }

    pub fn by_iso2(&self, code: &str) -> Option<&Country> {
        let code = code.trim();
        self.countries.iter().find(|c| c.iso2.eq_ignore_ascii_case(code))
    }

    pub fn by_iso3(&self, code: &str) -> Option<&Country> {
        let code = code.trim();
        self.countries.iter().find(|c| c.iso3.eq_ignore_ascii_case(code))
    }

    pub fn exact(&self, text: &str) -> Option<&Country> {
        self.by_key.get(&fold(text)).map(|&idx| &self.countries[idx])
    }

    /// Labels containing the query as whole words rank first, then labels whose
    /// words each score over the threshold. Ties go to the lower ISO3.
    pub fn fuzzy(&self, text: &str) -> Option<&Country> {
        let query = fold(text);
        if query.is_empty() {
            return None;
        }
        let padded = format!(" {query} ");
        let long_enough = query.chars().count() >= MIN_FRAGMENT_LEN;
        let mut best: Option<(bool, f64, &Country)> = None;
        for (label, idx) in &self.labels {
            let fragment = long_enough && format!(" {label} ").contains(&padded);
            let score = if fragment {
                jaro_winkler(&query, label)
            } else {
                match word_similarity(&query, label) {
                    Some(score) => score,
                    None => continue,
                }
            };
            let country = &self.countries[*idx];
            let better = match best {
                None => true,
                Some((best_fragment, best_score, best_country)) => {
                    (fragment, score) > (best_fragment, best_score)
                        || ((fragment, score) == (best_fragment, best_score) && country.iso3 < best_country.iso3)
                }
            };
            if better {
                best = Some((fragment, score, country));
            }
        }
        best.map(|(_, _, country)| country)
    }
}

/// Mean per-word similarity, if both have the same word count and every pair clears the threshold.
fn word_similarity(query: &str, label: &str) -> Option<f64> {
    let a = query.split(' ').collect::<Vec<_>>();
    let b = label.split(' ').collect::<Vec<_>>();
    if a.len() != b.len() {
        return None;
    }
    let mut total = 0.0;
    for (x, y) in a.iter().zip(&b) {
        let score = jaro_winkler(x, y);
        if score < FUZZY_THRESHOLD {
            return None;
        }
        total += score;
    }
    Some(total / a.len() as f64)
}

#[derive(Debug, Clone, Deserialize)]
struct ExceptionsFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    exceptions: Vec<ExceptionRule>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExceptionRule {
    names: Vec<String>,
    codes: Vec<String>,
}

/// Historical and colloquial place names keyed by their letters and digits only.
#[derive(Debug, Clone, Default)]
pub struct CountryExceptions {
    entries: HashMap<String, Vec<String>>,
}

impl CountryExceptions {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: ExceptionsFile = serde_yaml::from_str(text)?;
        let mut entries = HashMap::new();
        for rule in file.exceptions {
            let codes = rule
                .codes
                .iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .collect::<Vec<_>>();
            if let Some(bad) = codes.iter().find(|c| c.len() != 3 || !c.chars().all(|ch| ch.is_ascii_uppercase())) {
                anyhow::bail!("exception for {:?} maps to {bad:?}, which is not an ISO3 code", rule.names);
            }
            for name in &rule.names {
                entries.insert(exception_key(name), codes.clone());
            }
        }
        Ok(Self { entries })
    }

    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let path = root.join("rules").join("country_exceptions.yaml");
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn lookup(&self, text: &str) -> Option<&[String]> {
        self.entries.get(&exception_key(text)).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoResolution {
    ExactMatched(String),
    FuzzyMatched(String),
    /// One row per code; historical names can cover several countries.
    ExceptionMatched(Vec<String>),
    Unmatched,
}

impl GeoResolution {
    pub fn codes(&self) -> Vec<String> {
        match self {
            GeoResolution::ExactMatched(code) | GeoResolution::FuzzyMatched(code) => vec![code.clone()],
            GeoResolution::ExceptionMatched(codes) => codes.clone(),
            GeoResolution::Unmatched => Vec::new(),
        }
    }

    pub fn is_unmatched(&self) -> bool {
        matches!(self, GeoResolution::Unmatched)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeoStats {
    pub exact: usize,
    pub fuzzy: usize,
    pub exception: usize,
    pub unmatched: usize,
    pub cache_hits: usize,
}

/// One per run; the cache never outlives it.
pub struct GeoNormalizer {
    table: CountryTable,
    exceptions: CountryExceptions,
    cache: HashMap<String, GeoResolution>,
    stats: GeoStats,
}

impl GeoNormalizer {
    pub fn new(table: CountryTable, exceptions: CountryExceptions) -> Self {
        Self {
            table,
            exceptions,
            cache: HashMap::new(),
            stats: GeoStats::default(),
        }
    }

    pub fn table(&self) -> &CountryTable {
        &self.table
    }

    pub fn stats(&self) -> GeoStats {
        self.stats
    }

    /// Code hints from the source win over the text when they name a known country.
    pub fn resolve_hint(&mut self, hint: &LocationHint) -> GeoResolution {
        if let Some(country) = hint.iso3.as_deref().and_then(|c| self.table.by_iso3(c)) {
            self.stats.exact += 1;
            return GeoResolution::ExactMatched(country.iso3.clone());
        }
        if let Some(country) = hint.iso2.as_deref().and_then(|c| self.table.by_iso2(c)) {
            self.stats.exact += 1;
            return GeoResolution::ExactMatched(country.iso3.clone());
        }
        self.resolve_country(&hint.text)
    }

    pub fn resolve_country(&mut self, text: &str) -> GeoResolution {
        let text = text.trim();
        if let Some(hit) = self.cache.get(text) {
            self.stats.cache_hits += 1;
            return hit.clone();
        }
        let resolution = self.cascade(text);
        match &resolution {
            GeoResolution::ExactMatched(_) => self.stats.exact += 1,
            GeoResolution::FuzzyMatched(_) => self.stats.fuzzy += 1,
            GeoResolution::ExceptionMatched(_) => self.stats.exception += 1,
            GeoResolution::Unmatched => self.stats.unmatched += 1,
        }
        self.cache.insert(text.to_string(), resolution.clone());
        resolution
    }

    fn cascade(&self, text: &str) -> GeoResolution {
        if text.is_empty() {
            return GeoResolution::Unmatched;
        }
        if let Some(country) = self.table.exact(text) {
            return GeoResolution::ExactMatched(country.iso3.clone());
        }
        if let Some(country) = self.table.fuzzy(text) {
            return GeoResolution::FuzzyMatched(country.iso3.clone());
        }
        let stripped = strip_qualifiers(text);
        if !stripped.is_empty() && stripped != text {
            if let Some(country) = self.table.exact(&stripped).or_else(|| self.table.fuzzy(&stripped)) {
                return GeoResolution::FuzzyMatched(country.iso3.clone());
            }
        }
        if let Some(codes) = self.exceptions.lookup(text).or_else(|| self.exceptions.lookup(&stripped)) {
            return GeoResolution::ExceptionMatched(codes.to_vec());
        }
        GeoResolution::Unmatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXCEPTIONS: &str = r#"
version: 1
exceptions:
  - names: ["USACanada", "USA and Canada"]
    codes: [USA, CAN]
  - names: [Czechoslovakia]
    codes: [CZE, SVK]
  - names: [Canary Islands]
    codes: [ESP]
"#;

    fn normalizer() -> GeoNormalizer {
        GeoNormalizer::new(
            CountryTable::embedded().expect("countries"),
            CountryExceptions::from_yaml(EXCEPTIONS).expect("exceptions"),
        )
    }

    #[test]
    fn embedded_table_is_complete_and_indexed() {
        let table = CountryTable::embedded().expect("countries");
        assert!(table.len() > 240);
        assert_eq!(table.by_iso2("fr").map(|c| c.iso3.as_str()), Some("FRA"));
        assert_eq!(table.exact("Russian Federation").map(|c| c.iso3.as_str()), Some("RUS"));
        assert_eq!(table.exact("DEU").map(|c| c.name.as_str()), Some("Germany"));
    }

    #[test]
    fn exact_names_and_codes_resolve_first() {
        let mut geo = normalizer();
        assert_eq!(geo.resolve_country("france"), GeoResolution::ExactMatched("FRA".into()));
        assert_eq!(geo.resolve_country("GB"), GeoResolution::ExactMatched("GBR".into()));
        assert_eq!(geo.resolve_country("Niger"), GeoResolution::ExactMatched("NER".into()));
    }

    #[test]
    fn misspellings_fall_through_to_fuzzy() {
        let mut geo = normalizer();
        assert_eq!(geo.resolve_country("Frnace"), GeoResolution::FuzzyMatched("FRA".into()));
        assert_eq!(geo.resolve_country("Bosnia"), GeoResolution::FuzzyMatched("BIH".into()));
        assert_eq!(geo.resolve_country("Untied Kingdom"), GeoResolution::FuzzyMatched("GBR".into()));
    }

    #[test]
    fn similar_multi_word_names_do_not_cross_match() {
        let table = CountryTable::embedded().expect("countries");
        assert_eq!(table.fuzzy("Canary Islands"), None);
        assert_eq!(word_similarity("frnace", "france").map(|s| s > FUZZY_THRESHOLD), Some(true));
        assert_eq!(word_similarity("canary islands", "cayman islands"), None);
    }

    #[test]
    fn qualifiers_are_stripped_before_the_second_attempt() {
        assert_eq!(strip_qualifiers("The Netherlands (mainland)"), "Netherlands");
        let mut geo = normalizer();
        assert_eq!(geo.resolve_country("the Netherlands"), GeoResolution::FuzzyMatched("NLD".into()));
        assert_eq!(geo.resolve_country("Italy (Sicily)"), GeoResolution::FuzzyMatched("ITA".into()));
    }

    #[test]
    fn exceptions_match_regardless_of_case_and_spacing() {
        let mut geo = normalizer();
        assert_eq!(
            geo.resolve_country("USACanada"),
            GeoResolution::ExceptionMatched(vec!["USA".into(), "CAN".into()])
        );
        assert_eq!(
            geo.resolve_country("usa-canada"),
            GeoResolution::ExceptionMatched(vec!["USA".into(), "CAN".into()])
        );
        assert_eq!(geo.resolve_country("CZECHOSLOVAKIA").codes(), vec!["CZE", "SVK"]);
        assert_eq!(geo.resolve_country("Canary Islands (Tenerife)").codes(), vec!["ESP"]);
    }

    #[test]
    fn unresolvable_text_is_unmatched_and_cached() {
        let mut geo = normalizer();
        assert!(geo.resolve_country("Palearctic").is_unmatched());
        assert!(geo.resolve_country("Palearctic").is_unmatched());
        assert!(geo.resolve_country("").is_unmatched());
        let stats = geo.stats();
        assert_eq!(stats.unmatched, 2);
        assert_eq!(stats.cache_hits, 1);
    }

    #[test]
    fn code_hints_beat_the_text() {
        let mut geo = normalizer();
        let hint = LocationHint::named("Somewhere odd").with_iso3(Some("ESP".into()));
        assert_eq!(geo.resolve_hint(&hint), GeoResolution::ExactMatched("ESP".into()));
        let hint = LocationHint::named("FR").with_iso2(Some("FR".into()));
        assert_eq!(geo.resolve_hint(&hint), GeoResolution::ExactMatched("FRA".into()));
        let hint = LocationHint::named("ZZ").with_iso2(Some("ZZ".into()));
        assert!(geo.resolve_hint(&hint).is_unmatched());
    }

    #[test]
    fn shipped_exceptions_cover_historical_names() {
        let exceptions = CountryExceptions::from_yaml(include_str!("../../../rules/country_exceptions.yaml"))
            .expect("shipped exceptions");
        assert_eq!(exceptions.lookup("USA & Canada"), Some(&["USA".to_string(), "CAN".to_string()][..]));
        assert_eq!(exceptions.lookup("czechoslovakia").map(<[String]>::len), Some(2));
        assert_eq!(exceptions.lookup("Northern-Ireland"), Some(&["GBR".to_string()][..]));
    }

    #[test]
    fn malformed_exception_codes_are_refused() {
        let bad = "version: 1\nexceptions:\n  - names: [Nowhere]\n    codes: [XY]\n";
        assert!(CountryExceptions::from_yaml(bad).is_err());
    }
}
