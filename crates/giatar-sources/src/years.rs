//! Year extraction from the free-text date fields the sources publish.

use std::sync::LazyLock;

use regex::Regex;

/// Year the continental checklist snapshot was taken; stands in for undatable records.
pub const CHECKLIST_SNAPSHOT_YEAR: i32 = 2019;

static FOUR_DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]{4}").expect("valid regex"));
static CITATION_YEAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([0-9]{4})[a-e]?\)").expect("valid regex"));

/// `"1990"` and `"1990.0"` both parse; anything else is `None`.
pub fn parse_year(text: &str) -> Option<i32> {
    let value = text.trim().parse::<f64>().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.floor() as i32)
}

pub fn parse_optional_year(text: Option<&str>) -> Option<i32> {
    text.and_then(parse_year)
}

/// Lowest bare four-digit run, as in `"1960-1970"` or `"around 1960"`.
pub fn lowest_four_digit_year(text: &str) -> Option<i32> {
    FOUR_DIGITS
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .min()
}

/// Earliest `(YYYY)` citation year in a reference list, `(1998b)` included.
pub fn earliest_citation_year(reference: &str) -> Option<i32> {
    CITATION_YEAR
        .captures_iter(reference)
        .filter_map(|caps| caps.get(1))
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .min()
}

fn irregular_phrase_year(text: &str) -> Option<Option<i32>> {
    match text.trim().to_ascii_lowercase().as_str() {
        "90`s" => Some(Some(1990)),
        "since long" => Some(Some(700)),
        "20. century" => Some(Some(1950)),
        "19th century" => Some(Some(1850)),
        "unknown" => Some(None),
        _ => None,
    }
}

/// Reduce a checklist date field to one year.
///
/// Short or missing text becomes the snapshot year, numbers parse directly,
/// ranges and descriptions yield their lowest four-digit year, and a handful of
/// irregular phrases map to fixed years. `None` means the text says "unknown".
pub fn clean_checklist_year(raw: Option<&str>) -> Option<i32> {
    let Some(text) = raw.map(str::trim) else {
        return Some(CHECKLIST_SNAPSHOT_YEAR);
    };
    if text.chars().count() <= 3 {
        return Some(CHECKLIST_SNAPSHOT_YEAR);
    }
    if let Some(year) = parse_year(text) {
        return Some(year);
    }
    if let Some(year) = lowest_four_digit_year(text) {
        return Some(year);
    }
    irregular_phrase_year(text).unwrap_or(Some(CHECKLIST_SNAPSHOT_YEAR))
}
