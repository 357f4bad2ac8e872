//! Raw source rows and the cleaning stage that turns them into typed inputs.
//!
//! Reading files is left to the caller: any serde format that yields these
//! row types will do. Cleaning normalizes join keys, harmonizes metal tiers,
//! drops rows that cannot be keyed, and sums duplicate keys in every table.

use std::collections::{BTreeMap, BTreeSet};

use log::{info, warn};
use serde::de::IgnoredAny;
use serde::{Deserialize, Deserializer, Serialize};

use crate::data::{RatingArea, Year};
use crate::error::Result;
use crate::margins::MarginRow;
use crate::seeding::{CrosswalkEntry, EnrollmentObservation};
use crate::tier::MetalTier;

/// County spellings in the crosswalk that differ from the control tables.
const COUNTY_ALIASES: [(&str, &str); 1] = [("LA COUNTY", "LOS ANGELES")];

/// Plan-level enrollment row as exported by the exchange.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBaseRow {
    pub year: Option<Year>,
    pub rating_area: Option<RatingArea>,
    #[serde(alias = "issuer_name")]
    pub insurer: Option<String>,
    #[serde(alias = "plan_type")]
    pub plan: Option<String>,
    #[serde(alias = "metal_level")]
    pub metal_tier: Option<String>,
    #[serde(alias = "Enrollees", default, deserialize_with = "lenient_number")]
    pub enrollment: Option<f64>,
}

/// Insurer × county control-total row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInsurerTargetRow {
    pub year: Option<Year>,
    #[serde(alias = "issuer")]
    pub insurer: Option<String>,
    pub county: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub enrollees: Option<f64>,
}

/// Metal tier × county control-total row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMetalTargetRow {
    pub year: Option<Year>,
    pub metal_tier: Option<String>,
    pub county: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub enrollees: Option<f64>,
}

/// County to rating-area crosswalk row.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RawCrosswalkRow {
    #[serde(alias = "countyname")]
    pub county: Option<String>,
    #[serde(alias = "ratingarea")]
    pub rating_area: Option<RatingArea>,
}

/// Reads a numeric column that exports sometimes fill with text. Numbers and
/// numeric strings are kept; blanks, placeholders such as `"n/a"` and
/// non-finite values read as missing.
fn lenient_number<'de, D>(deserializer: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    #[allow(dead_code)]
    enum Cell {
        Number(f64),
        Text(String),
        Other(IgnoredAny),
    }

    let value = match Option::<Cell>::deserialize(deserializer)? {
        Some(Cell::Number(value)) => Some(value),
        Some(Cell::Text(text)) => text.trim().parse::<f64>().ok(),
        Some(Cell::Other(_)) | None => None,
    };
    Ok(value.filter(|value| value.is_finite()))
}

/// The four raw source tables.
#[derive(Clone, Debug, Default)]
pub struct SourceTables {
    pub base: Vec<RawBaseRow>,
    pub insurer_targets: Vec<RawInsurerTargetRow>,
    pub metal_targets: Vec<RawMetalTargetRow>,
    pub crosswalk: Vec<RawCrosswalkRow>,
}

/// Row counts from the cleaning stage.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CleaningSummary {
    pub base_rows: usize,
    /// Base rows dropped for a missing year, rating area, insurer, plan or tier.
    pub dropped_missing_keys: usize,
    /// Base rows dropped because their tier label has no harmonized form.
    pub dropped_unmapped_tier: usize,
    /// Distinct tier labels that could not be harmonized.
    pub unmapped_tier_labels: BTreeSet<String>,
    /// Observations left after aggregation.
    pub observations: usize,
    pub insurer_targets: usize,
    /// Insurer target rows dropped for a missing year, insurer or county.
    pub dropped_insurer_targets: usize,
    pub metal_targets: usize,
    /// Metal target rows dropped for a missing year, tier or county.
    pub dropped_metal_targets: usize,
    pub crosswalk_entries: usize,
    /// Crosswalk rows dropped for a missing county or rating area.
    pub dropped_crosswalk_rows: usize,
}

/// Typed, aggregated inputs ready for seeding and fitting.
#[derive(Clone, Debug, Default)]
pub struct CleanedInputs {
    pub observations: Vec<EnrollmentObservation>,
    pub insurer_targets: Vec<MarginRow<String>>,
    pub metal_targets: Vec<MarginRow<MetalTier>>,
    pub crosswalk: Vec<CrosswalkEntry>,
    pub summary: CleaningSummary,
}

/// Upper-cases and trims a county name and applies known aliases.
pub fn normalize_county(raw: &str) -> String {
    let name = raw.trim().to_uppercase();
    COUNTY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(name)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.is_empty())
}

/// Cleans plan-level rows into aggregated observations.
pub fn clean_base(
    rows: Vec<RawBaseRow>,
    summary: &mut CleaningSummary,
) -> Vec<EnrollmentObservation> {
    summary.base_rows = rows.len();
    let mut aggregated: BTreeMap<(Year, RatingArea, String, String, MetalTier), f64> =
        BTreeMap::new();

    for row in rows {
        let (Some(year), Some(rating_area), Some(insurer), Some(plan), Some(raw_tier)) = (
            row.year,
            row.rating_area,
            non_empty(row.insurer),
            row.plan,
            non_empty(row.metal_tier),
        ) else {
            summary.dropped_missing_keys += 1;
            continue;
        };

        let Some(metal_tier) = MetalTier::harmonize(&raw_tier) else {
            summary.dropped_unmapped_tier += 1;
            summary.unmapped_tier_labels.insert(raw_tier);
            continue;
        };

        *aggregated
            .entry((year, rating_area, insurer, plan, metal_tier))
            .or_insert(0.0) += row.enrollment.unwrap_or(0.0);
    }

    if summary.dropped_unmapped_tier > 0 {
        warn!(
            "dropped {} base rows with unmapped metal tiers: {:?}",
            summary.dropped_unmapped_tier, summary.unmapped_tier_labels
        );
    }

    let observations: Vec<EnrollmentObservation> = aggregated
        .into_iter()
        .map(
            |((year, rating_area, insurer, plan, metal_tier), enrollment)| EnrollmentObservation {
                year,
                rating_area,
                insurer,
                plan,
                metal_tier,
                enrollment,
            },
        )
        .collect();
    summary.observations = observations.len();
    observations
}

/// Cleans insurer × county rows. Missing or unparseable values count as zero.
pub fn clean_insurer_targets(
    rows: Vec<RawInsurerTargetRow>,
    summary: &mut CleaningSummary,
) -> Vec<MarginRow<String>> {
    let mut aggregated: BTreeMap<(Year, String, String), f64> = BTreeMap::new();
    for row in rows {
        let (Some(year), Some(insurer), Some(county)) = (row.year, row.insurer, row.county) else {
            summary.dropped_insurer_targets += 1;
            continue;
        };
        *aggregated
            .entry((year, insurer, normalize_county(&county)))
            .or_insert(0.0) += row.enrollees.unwrap_or(0.0);
    }

    let targets: Vec<MarginRow<String>> = aggregated
        .into_iter()
        .map(|((year, insurer, county), value)| {
            MarginRow::new(year, insurer, county, value)
        })
        .collect();
    summary.insurer_targets = targets.len();
    targets
}

/// Cleans metal × county rows. Tier labels must be canonical; missing or
/// unparseable values count as zero.
pub fn clean_metal_targets(
    rows: Vec<RawMetalTargetRow>,
    summary: &mut CleaningSummary,
) -> Result<Vec<MarginRow<MetalTier>>> {
    let mut aggregated: BTreeMap<(Year, MetalTier, String), f64> = BTreeMap::new();
    for row in rows {
        let (Some(year), Some(label), Some(county)) = (row.year, row.metal_tier, row.county) else {
            summary.dropped_metal_targets += 1;
            continue;
        };
        let metal_tier: MetalTier = label.parse()?;
        *aggregated
            .entry((year, metal_tier, normalize_county(&county)))
            .or_insert(0.0) += row.enrollees.unwrap_or(0.0);
    }

    let targets: Vec<MarginRow<MetalTier>> = aggregated
        .into_iter()
        .map(|((year, metal_tier, county), value)| {
            MarginRow::new(year, metal_tier, county, value)
        })
        .collect();
    summary.metal_targets = targets.len();
    Ok(targets)
}

/// Cleans crosswalk rows, keeping one entry per row with a county and rating area.
pub fn clean_crosswalk(
    rows: Vec<RawCrosswalkRow>,
    summary: &mut CleaningSummary,
) -> Vec<CrosswalkEntry> {
    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        match (row.county, row.rating_area) {
            (Some(county), Some(rating_area)) => {
                entries.push(CrosswalkEntry::new(normalize_county(&county), rating_area));
            }
            _ => summary.dropped_crosswalk_rows += 1,
        }
    }
    summary.crosswalk_entries = entries.len();
    entries
}

/// Runs every cleaning step over the raw tables.
pub fn clean(tables: SourceTables) -> Result<CleanedInputs> {
    let mut summary = CleaningSummary::default();
    let observations = clean_base(tables.base, &mut summary);
    let insurer_targets = clean_insurer_targets(tables.insurer_targets, &mut summary);
    let metal_targets = clean_metal_targets(tables.metal_targets, &mut summary)?;
    let crosswalk = clean_crosswalk(tables.crosswalk, &mut summary);

    info!(
        "cleaning: {} base rows -> {} observations ({} missing keys, {} unmapped tiers)",
        summary.base_rows,
        summary.observations,
        summary.dropped_missing_keys,
        summary.dropped_unmapped_tier
    );
    info!(
        "cleaning: {} insurer targets, {} metal targets, {} crosswalk entries",
        summary.insurer_targets, summary.metal_targets, summary.crosswalk_entries
    );
    let dropped = summary.dropped_insurer_targets
        + summary.dropped_metal_targets
        + summary.dropped_crosswalk_rows;
    if dropped > 0 {
        warn!(
            "dropped {} insurer target, {} metal target and {} crosswalk rows with missing keys",
            summary.dropped_insurer_targets,
            summary.dropped_metal_targets,
            summary.dropped_crosswalk_rows
        );
    }

    Ok(CleanedInputs {
        observations,
        insurer_targets,
        metal_targets,
        crosswalk,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AllocError;

    fn base_row(tier: &str, enrollment: Option<f64>) -> RawBaseRow {
        RawBaseRow {
            year: Some(2020),
            rating_area: Some(15),
            insurer: Some("Blue Shield".to_string()),
            plan: Some("PPO".to_string()),
            metal_tier: Some(tier.to_string()),
            enrollment,
        }
    }

    #[test]
    fn county_names_are_normalized() {
        assert_eq!(normalize_county("  la county "), "LOS ANGELES");
        assert_eq!(normalize_county("Alameda"), "ALAMEDA");
    }

    #[test]
    fn base_rows_are_harmonized_and_aggregated() {
        let rows = vec![
            base_row("HDHP Bronze", Some(10.0)),
            base_row("HSA Bronze", Some(5.0)),
            base_row("HDHP", None),
            base_row("Catastrophic", Some(99.0)),
            RawBaseRow {
                insurer: Some(String::new()),
                ..base_row("Gold", Some(1.0))
            },
            RawBaseRow {
                year: None,
                ..base_row("Gold", Some(1.0))
            },
        ];

        let mut summary = CleaningSummary::default();
        let observations = clean_base(rows, &mut summary);

        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].metal_tier, MetalTier::BronzeHdhp);
        assert_eq!(observations[0].enrollment, 15.0);
        assert_eq!(summary.dropped_missing_keys, 2);
        assert_eq!(summary.dropped_unmapped_tier, 1);
        assert!(summary.unmapped_tier_labels.contains("Catastrophic"));
    }

    #[test]
    fn raw_rows_accept_source_column_names() {
        let row: RawBaseRow = serde_json::from_str(
            r#"{"year": 2021, "rating_area": 3, "issuer_name": "Kaiser", "plan_type": "HMO",
                "metal_level": "Silver", "Enrollees": 120.0}"#,
        )
        .unwrap();
        assert_eq!(row.insurer.as_deref(), Some("Kaiser"));
        assert_eq!(row.enrollment, Some(120.0));

        let crosswalk: RawCrosswalkRow =
            serde_json::from_str(r#"{"countyname": "LA County", "ratingarea": 15}"#).unwrap();
        let mut summary = CleaningSummary::default();
        let entries = clean_crosswalk(vec![crosswalk], &mut summary);
        assert_eq!(entries[0].county, "LOS ANGELES");
    }

    #[test]
    fn unparseable_target_values_read_as_zero() {
        let rows: Vec<RawInsurerTargetRow> = serde_json::from_str(
            r#"[
                {"year": 2020, "issuer": "Kaiser", "county": "ALAMEDA", "enrollees": "n/a"},
                {"year": 2020, "issuer": "Kaiser", "county": "FRESNO", "enrollees": " 12.5 "},
                {"year": 2020, "issuer": "Kaiser", "county": "KERN", "enrollees": 5},
                {"year": 2020, "issuer": "Kaiser", "county": "NAPA", "enrollees": null},
                {"year": 2020, "issuer": "Kaiser", "county": "YOLO"}
            ]"#,
        )
        .unwrap();
        let values: Vec<Option<f64>> = rows.iter().map(|row| row.enrollees).collect();
        assert_eq!(values, vec![None, Some(12.5), Some(5.0), None, None]);

        let mut summary = CleaningSummary::default();
        let targets = clean_insurer_targets(rows, &mut summary);
        assert_eq!(targets.len(), 5);
        assert_eq!(
            targets[0],
            MarginRow::new(2020, "Kaiser".to_string(), "ALAMEDA", 0.0)
        );
        assert_eq!(targets[1].value, 12.5);

        let metal: RawMetalTargetRow = serde_json::from_str(
            r#"{"year": 2020, "metal_tier": "Gold", "county": "KERN", "enrollees": "--"}"#,
        )
        .unwrap();
        assert_eq!(metal.enrollees, None);
    }

    #[test]
    fn rows_without_keys_are_counted() {
        let mut summary = CleaningSummary::default();
        let insurer = clean_insurer_targets(
            vec![
                RawInsurerTargetRow {
                    year: Some(2020),
                    insurer: Some("Kaiser".to_string()),
                    county: Some("ALAMEDA".to_string()),
                    enrollees: Some(4.0),
                },
                RawInsurerTargetRow {
                    county: None,
                    ..RawInsurerTargetRow::default()
                },
            ],
            &mut summary,
        );
        let metal = clean_metal_targets(
            vec![RawMetalTargetRow {
                year: None,
                metal_tier: Some("Gold".to_string()),
                county: Some("ALAMEDA".to_string()),
                enrollees: Some(1.0),
            }],
            &mut summary,
        )
        .unwrap();
        let crosswalk = clean_crosswalk(
            vec![
                RawCrosswalkRow {
                    county: Some("Napa".to_string()),
                    rating_area: Some(2),
                },
                RawCrosswalkRow {
                    county: Some("Yolo".to_string()),
                    rating_area: None,
                },
            ],
            &mut summary,
        );

        assert_eq!(insurer.len(), 1);
        assert!(metal.is_empty());
        assert_eq!(crosswalk.len(), 1);
        assert_eq!(summary.insurer_targets, 1);
        assert_eq!(summary.dropped_insurer_targets, 1);
        assert_eq!(summary.dropped_metal_targets, 1);
        assert_eq!(summary.crosswalk_entries, 1);
        assert_eq!(summary.dropped_crosswalk_rows, 1);
    }

    #[test]
    fn targets_are_keyed_and_summed() {
        let mut summary = CleaningSummary::default();
        let rows = vec![
            RawInsurerTargetRow {
                year: Some(2020),
                insurer: Some("Kaiser".to_string()),
                county: Some(" alameda".to_string()),
                enrollees: Some(10.0),
            },
            RawInsurerTargetRow {
                year: Some(2020),
                insurer: Some("Kaiser".to_string()),
                county: Some("ALAMEDA".to_string()),
                enrollees: None,
            },
        ];
        let insurer = clean_insurer_targets(rows, &mut summary);
        assert_eq!(
            insurer,
            vec![MarginRow::new(2020, "Kaiser".to_string(), "ALAMEDA", 10.0)]
        );

        let rows = vec![RawMetalTargetRow {
            year: Some(2020),
            metal_tier: Some("Copper".to_string()),
            county: Some("ALAMEDA".to_string()),
            enrollees: Some(1.0),
        }];
        let unknown = clean_metal_targets(rows, &mut summary);
        assert!(matches!(unknown, Err(AllocError::UnknownMetalTier { .. })));
    }
}
