//! Regulatory taxonomy: names export, reporting-service articles and the country distribution table.

use std::collections::HashSet;

use giatar_core::{Nativity, RecordType, SourceId};
use serde::Deserialize;

use crate::years::{earliest_citation_year, parse_optional_year, parse_year};
use crate::{
    non_empty, read_export, unsupported, FeedKind, LocationHint, NormalizeError, Normalized, NormalizedTaxon,
    SourceExport, SourceNormalizer, SourceOccurrence, SourceSchema, TaxonLink,
};

pub const NAMES_SCHEMA: SourceSchema = SourceSchema {
    name: "eppo.names",
    version: 1,
    required: &["code", "fullname"],
    optional: &["preferred"],
};

pub const REPORTING_SCHEMA: SourceSchema = SourceSchema {
    name: "eppo.reporting",
    version: 1,
    required: &["codeEPPO", "location", "year"],
    optional: &["Num.", "Title", "links", "ISO3"],
};

pub const DISTRIBUTION_SCHEMA: SourceSchema = SourceSchema {
    name: "eppo.distribution",
    version: 1,
    required: &["codeEPPO", "Country", "Status"],
    optional: &["ISO2", "ISO3", "First date", "First date type", "First reference", "References"],
};

pub const REPORTING_LABEL: &str = "EPPO Reporting";
pub const DISTRIBUTION_LABEL: &str = "EPPO Distribution";

#[derive(Debug, Deserialize)]
struct NameRow {
    code: String,
    fullname: String,
    #[serde(default)]
    preferred: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReportingRow {
    #[serde(rename = "codeEPPO")]
    code: String,
    location: String,
    #[serde(default)]
    year: Option<String>,
    #[serde(rename = "Num.", default)]
    number: Option<String>,
    #[serde(rename = "Title", default)]
    title: Option<String>,
    #[serde(default)]
    links: Option<String>,
    #[serde(rename = "ISO3", default)]
    iso3: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DistributionRow {
    #[serde(rename = "codeEPPO")]
    code: String,
    #[serde(rename = "Country")]
    country: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ISO2", default)]
    iso2: Option<String>,
    #[serde(rename = "ISO3", default)]
    iso3: Option<String>,
    #[serde(rename = "First date", default)]
    first_date: Option<String>,
    #[serde(rename = "First date type", default)]
    first_date_type: Option<String>,
    #[serde(rename = "First reference", default)]
    first_reference: Option<String>,
    #[serde(rename = "References", default)]
    references: Option<String>,
}

/// Missing or blank counts as preferred; the export only marks the exceptions.
fn is_preferred(flag: Option<&str>) -> bool {
    match flag.map(|f| f.trim().to_ascii_lowercase()) {
        None => true,
        Some(f) => !matches!(f.as_str(), "false" | "0" | "no" | "f" | "n"),
    }
}

/// `"{Num.}. {Title} {links}"` with the missing parts left out.
pub fn reporting_reference(number: Option<&str>, title: Option<&str>, links: Option<&str>) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(num) = number.map(str::trim).filter(|n| !n.is_empty()) {
        parts.push(format!("{num}."));
    }
    for part in [title, links].into_iter().flatten() {
        let part = part.trim();
        if !part.is_empty() {
            parts.push(part.to_string());
        }
    }
    (!parts.is_empty()).then(|| parts.join(" "))
}

fn reference_year(text: Option<&str>) -> Option<i32> {
    let text = text?;
    parse_year(text).or_else(|| earliest_citation_year(text))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EppoNormalizer;

impl EppoNormalizer {
    fn normalize_reporting(&self, export: &SourceExport) -> Result<Normalized<SourceOccurrence>, NormalizeError> {
        let (rows, rejected) = read_export::<ReportingRow>(export, &REPORTING_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        for row in rows {
            let code = row.code.trim();
            let location = row.location.trim();
            if code.is_empty() || location.is_empty() {
                out.dropped += 1;
                continue;
            }
            out.rows.push(SourceOccurrence {
                taxon: TaxonLink::Local {
                    source: SourceId::Eppo,
                    code: code.to_string(),
                },
                location: LocationHint::named(location).with_iso3(non_empty(row.iso3)),
                year: parse_optional_year(row.year.as_deref()),
                record_type: RecordType::FirstReport,
                native: Nativity::Introduced,
                source_label: REPORTING_LABEL.to_string(),
                reference: reporting_reference(row.number.as_deref(), row.title.as_deref(), row.links.as_deref()),
            });
        }
        Ok(out)
    }

    fn normalize_distribution(&self, export: &SourceExport) -> Result<Normalized<SourceOccurrence>, NormalizeError> {
        let (rows, rejected) = read_export::<DistributionRow>(export, &DISTRIBUTION_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        for row in rows {
            let iso2 = non_empty(row.iso2);
            let iso3 = non_empty(row.iso3);
            // Rows without a country code are states and provinces.
            if row.status.contains("Absent") || (iso2.is_none() && iso3.is_none()) {
                out.dropped += 1;
                continue;
            }
            let code = row.code.trim();
            if code.is_empty() {
                out.rejected += 1;
                continue;
            }

            let first_date = parse_optional_year(row.first_date.as_deref());
            let date_type = non_empty(row.first_date_type).unwrap_or_default();
            let (year, record_type, native) = match date_type.as_str() {
                "First report" => (first_date, RecordType::FirstReport, Nativity::Introduced),
                "First year listed" => {
                    let listed = reference_year(row.first_reference.as_deref());
                    match (first_date, listed) {
                        (_, Some(reference)) if first_date.map_or(true, |date| reference <= date) => {
                            (Some(reference), RecordType::FirstReference, Nativity::Unknown)
                        }
                        (date, _) => (date, RecordType::FirstYearListed, Nativity::Unknown),
                    }
                }
                _ => {
                    let record_type = if first_date.is_some() {
                        RecordType::FirstReport
                    } else {
                        RecordType::NotDated
                    };
                    (first_date, record_type, Nativity::Unknown)
                }
            };

            out.rows.push(SourceOccurrence {
                taxon: TaxonLink::Local {
                    source: SourceId::Eppo,
                    code: code.to_string(),
                },
                location: LocationHint::named(row.country.trim()).with_iso2(iso2).with_iso3(iso3),
                year,
                record_type,
                native,
                source_label: DISTRIBUTION_LABEL.to_string(),
                reference: non_empty(row.references),
            });
        }
        Ok(out)
    }
}

impl SourceNormalizer for EppoNormalizer {
    fn source(&self) -> SourceId {
        SourceId::Eppo
    }

    fn species_schema(&self) -> &'static SourceSchema {
        &NAMES_SCHEMA
    }

    fn normalize_species(&self, export: &SourceExport) -> Result<Normalized<NormalizedTaxon>, NormalizeError> {
        let (rows, rejected) = read_export::<NameRow>(export, &NAMES_SCHEMA)?;
        let mut out = Normalized {
            rejected,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        for row in rows {
            if !is_preferred(row.preferred.as_deref()) {
                out.dropped += 1;
                continue;
            }
            let code = row.code.trim();
            let name = row.fullname.trim();
            if code.is_empty() || name.is_empty() {
                out.rejected += 1;
                continue;
            }
            if !seen.insert(code.to_string()) {
                out.dropped += 1;
                continue;
            }
            out.rows.push(NormalizedTaxon {
                source: SourceId::Eppo,
                orig_taxon: name.to_string(),
                local_code: code.to_string(),
            });
        }
        Ok(out)
    }

    fn feeds(&self) -> &'static [FeedKind] {
        &[FeedKind::Reporting, FeedKind::Distribution]
    }

    fn normalize_feed(
        &self,
        feed: FeedKind,
        export: &SourceExport,
    ) -> Result<Normalized<SourceOccurrence>, NormalizeError> {
        match feed {
            FeedKind::Reporting => self.normalize_reporting(export),
            FeedKind::Distribution => self.normalize_distribution(export),
            other => Err(unsupported(SourceId::Eppo, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_preferred_names_are_kept() {
        let export = "\
code,fullname,preferred
VESPVE,Vespa velutina,true
VESPVE,Vespa velutina nigrithorax,false
HARMAX,Harmonia axyridis,
HARMAX,Harmonia axyridis,1
";
        let out = EppoNormalizer
            .normalize_species(&SourceExport::new("names.csv", export))
            .expect("normalize");
        let codes = out.rows.iter().map(|t| (t.local_code.as_str(), t.orig_taxon.as_str())).collect::<Vec<_>>();
        assert_eq!(codes, vec![("VESPVE", "Vespa velutina"), ("HARMAX", "Harmonia axyridis")]);
        assert_eq!(out.dropped, 2);
    }

    #[test]
    fn names_without_the_preferred_column_are_all_preferred() {
        let export = "code,fullname\nVESPVE,Vespa velutina\n";
        let out = EppoNormalizer
            .normalize_species(&SourceExport::new("names.csv", export))
            .expect("normalize");
        assert_eq!(out.rows.len(), 1);
    }

    #[test]
    fn reporting_articles_build_their_reference() {
        let export = "\
codeEPPO,location,year,Num.,Title,links,ISO3
VESPVE,France,2005,2005/012,First report of Vespa velutina in France,https://gd.eppo.int/reporting/article-1,FRA
VESPVE,,2006,,,,
";
        let out = EppoNormalizer
            .normalize_feed(FeedKind::Reporting, &SourceExport::new("reporting.csv", export))
            .expect("normalize");
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.dropped, 1);
        let row = &out.rows[0];
        assert_eq!(row.location.iso3.as_deref(), Some("FRA"));
        assert_eq!(row.native, Nativity::Introduced);
        assert_eq!(row.source_label, "EPPO Reporting");
        assert_eq!(
            row.reference.as_deref(),
            Some("2005/012. First report of Vespa velutina in France https://gd.eppo.int/reporting/article-1")
        );
        assert_eq!(reporting_reference(None, Some("Title"), None).as_deref(), Some("Title"));
        assert_eq!(reporting_reference(None, None, Some("  ")), None);
    }

    #[test]
    fn distribution_date_types() {
        let export = "\
codeEPPO,Country,Status,ISO2,ISO3,First date,First date type,First reference,References
VESPVE,France,Present,FR,FRA,2004,First report,,EPPO RS 2005
VESPVE,Spain,\"Present, restricted distribution\",ES,ESP,2012,First year listed,2010,
VESPVE,Italy,Present,IT,ITA,2012,First year listed,2014,
VESPVE,Portugal,Present,PT,PRT,,,,
VESPVE,Germany,Present,DE,DEU,2014,,,
VESPVE,Belgium,Absent,BE,BEL,2016,First report,,
VESPVE,Jersey,Present,,,2016,First report,,
";
        let out = EppoNormalizer
            .normalize_feed(FeedKind::Distribution, &SourceExport::new("dist.csv", export))
            .expect("normalize");
        assert_eq!(out.dropped, 2);
        let got = out
            .rows
            .iter()
            .map(|r| (r.location.iso3.as_deref().unwrap_or(""), r.year, r.record_type, r.native))
            .collect::<Vec<_>>();
        assert_eq!(
            got,
            vec![
                ("FRA", Some(2004), RecordType::FirstReport, Nativity::Introduced),
                ("ESP", Some(2010), RecordType::FirstReference, Nativity::Unknown),
                ("ITA", Some(2012), RecordType::FirstYearListed, Nativity::Unknown),
                ("PRT", None, RecordType::NotDated, Nativity::Unknown),
                ("DEU", Some(2014), RecordType::FirstReport, Nativity::Unknown),
            ]
        );
        assert_eq!(out.rows[0].location.iso2.as_deref(), Some("FR"));
        assert_eq!(out.rows[0].reference.as_deref(), Some("EPPO RS 2005"));
    }
}
