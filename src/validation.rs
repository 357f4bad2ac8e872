//! Diagnostics that sit outside the solver loop: the up-front margin
//! consistency check and the post-hoc validator.
//!
//! Neither of these ever fails a run. Conflicting control totals explain
//! residual deviations; they are logged and returned for the caller to judge.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use log::{info, warn};
use serde::Serialize;

use crate::data::{CellKey, CellTable, RatingArea, Year};
use crate::margins::MarginRow;
use crate::seeding::EnrollmentObservation;
use crate::tier::MetalTier;

/// Difference between a county's insurer and metal control totals.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CountyGap {
    pub year: Year,
    pub county: String,
    pub insurer_total: f64,
    pub metal_total: f64,
    /// `|insurer - metal| / metal`, or zero when the metal total is zero.
    pub relative_diff: f64,
}

/// Grand totals of both control systems for one year.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct YearTotals {
    pub year: Year,
    pub insurer_total: f64,
    pub metal_total: f64,
    pub relative_diff: f64,
}

/// Result of comparing the two control-total systems county by county.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConsistencyReport {
    /// Threshold applied to `relative_diff`.
    pub threshold: f64,
    /// Number of `(year, county)` combinations present in either table.
    pub county_years: usize,
    /// Combinations whose relative gap exceeds the threshold.
    pub inconsistent: Vec<CountyGap>,
    /// Per-year grand totals, ascending by year.
    pub years: Vec<YearTotals>,
}

impl ConsistencyReport {
    /// Whether every county-year agrees within the threshold.
    pub fn is_consistent(&self) -> bool {
        self.inconsistent.is_empty()
    }
}

fn relative_gap(value: f64, reference: f64) -> f64 {
    if reference > 0.0 {
        (value - reference).abs() / reference
    } else {
        0.0
    }
}

/// Compares insurer × county totals with metal × county totals.
///
/// Counties missing from one table count as zero there.
pub fn margin_consistency(
    insurer_rows: &[MarginRow<String>],
    metal_rows: &[MarginRow<MetalTier>],
    threshold: f64,
) -> ConsistencyReport {
    let mut totals: BTreeMap<(Year, &str), (f64, f64)> = BTreeMap::new();
    for row in insurer_rows {
        totals.entry((row.year, row.county.as_str())).or_default().0 += row.value;
    }
    for row in metal_rows {
        totals.entry((row.year, row.county.as_str())).or_default().1 += row.value;
    }

    let mut inconsistent = Vec::new();
    let mut per_year: BTreeMap<Year, (f64, f64)> = BTreeMap::new();
    for (&(year, county), &(insurer_total, metal_total)) in &totals {
        let year_totals = per_year.entry(year).or_default();
        year_totals.0 += insurer_total;
        year_totals.1 += metal_total;

        let relative_diff = relative_gap(insurer_total, metal_total);
        if relative_diff > threshold {
            inconsistent.push(CountyGap {
                year,
                county: county.to_string(),
                insurer_total,
                metal_total,
                relative_diff,
            });
        }
    }

    let years: Vec<YearTotals> = per_year
        .into_iter()
        .map(|(year, (insurer_total, metal_total))| YearTotals {
            year,
            insurer_total,
            metal_total,
            relative_diff: relative_gap(insurer_total, metal_total),
        })
        .collect();

    let report = ConsistencyReport {
        threshold,
        county_years: totals.len(),
        inconsistent,
        years,
    };

    info!(
        "margin consistency: {} of {} county-years differ by more than {:.1}%",
        report.inconsistent.len(),
        report.county_years,
        100.0 * threshold
    );
    if !report.is_consistent() {
        warn!("insurer and metal control totals disagree; fitting will settle on a compromise");
    }
    for year in &report.years {
        info!(
            "  year {}: insurer total {:.0}, metal total {:.0}, diff {:.1}%",
            year.year,
            year.insurer_total,
            year.metal_total,
            100.0 * year.relative_diff
        );
    }
    report
}

/// Summary of relative deviations between achieved and target group totals.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviationStats {
    /// Number of groups compared.
    pub groups: usize,
    pub max: f64,
    pub median: f64,
    /// Share of groups within 1% of target.
    pub within_1pct: f64,
    /// Share of groups within 5% of target.
    pub within_5pct: f64,
}

impl DeviationStats {
    fn from_diffs(mut diffs: Vec<f64>) -> Option<Self> {
        if diffs.is_empty() {
            return None;
        }
        diffs.sort_by(f64::total_cmp);

        let n = diffs.len();
        let median = if n % 2 == 1 {
            diffs[n / 2]
        } else {
            0.5 * (diffs[n / 2 - 1] + diffs[n / 2])
        };
        let share = |limit: f64| diffs.iter().filter(|d| **d < limit).count() as f64 / n as f64;

        Some(Self {
            groups: n,
            max: diffs[n - 1],
            median,
            within_1pct: share(0.01),
            within_5pct: share(0.05),
        })
    }

    /// Whether the largest deviation is below `tolerance`.
    pub fn passes(&self, tolerance: f64) -> bool {
        self.max < tolerance
    }
}

/// Relative deviations for groups present on both sides with a positive target.
fn compare<K: Eq + Hash>(
    achieved: &HashMap<K, f64>,
    targets: &HashMap<K, f64>,
) -> Option<DeviationStats> {
    let diffs = targets
        .iter()
        .filter(|&(_, &target)| target > 0.0)
        .filter_map(|(key, &target)| {
            achieved
                .get(key)
                .map(|&value| (value - target).abs() / target)
        })
        .collect();
    DeviationStats::from_diffs(diffs)
}

fn sum_by<K, F>(cells: &CellTable, key_of: F) -> HashMap<K, f64>
where
    K: Eq + Hash,
    F: Fn(&CellKey) -> K,
{
    let mut sums = HashMap::new();
    for (key, estimate) in cells.iter() {
        *sums.entry(key_of(key)).or_insert(0.0) += estimate;
    }
    sums
}

fn margin_targets<K: Clone + Eq + Hash>(rows: &[MarginRow<K>]) -> HashMap<(Year, K, String), f64> {
    let mut targets = HashMap::new();
    for row in rows {
        *targets
            .entry((row.year, row.key.clone(), row.county.clone()))
            .or_insert(0.0) += row.value;
    }
    targets
}

type PlanKey = (Year, RatingArea, String, String, MetalTier);

/// Outcome of the post-hoc validator.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ValidationReport {
    /// Relative deviation below which a check passes.
    pub tolerance: f64,
    /// Achieved insurer × county totals against their targets.
    pub insurer_county: Option<DeviationStats>,
    /// Achieved metal × county totals against their targets.
    pub metal_county: Option<DeviationStats>,
    /// Re-aggregated rating-area totals against the seeded enrollment.
    pub rating_area: Option<DeviationStats>,
    /// Cells left with a negative estimate.
    pub negative_estimates: usize,
}

impl ValidationReport {
    /// Whether both control systems are met within the tolerance.
    pub fn margins_reconciled(&self) -> bool {
        [&self.insurer_county, &self.metal_county]
            .into_iter()
            .flatten()
            .all(|stats| stats.passes(self.tolerance))
    }

    /// Whether rating-area totals survived fitting within the tolerance.
    pub fn rating_areas_preserved(&self) -> bool {
        self.rating_area
            .as_ref()
            .map_or(true, |stats| stats.passes(self.tolerance))
    }

    fn log(&self) {
        let checks = [
            ("insurer x county", &self.insurer_county),
            ("metal x county", &self.metal_county),
            ("rating area", &self.rating_area),
        ];
        for (name, stats) in checks {
            match stats {
                Some(stats) if stats.passes(self.tolerance) => info!(
                    "check {name}: max relative diff {:.6}, median {:.6} over {} groups: pass",
                    stats.max, stats.median, stats.groups
                ),
                Some(stats) => info!(
                    "check {name}: max relative diff {:.6}, median {:.6}, \
                     {:.1}% within 1%, {:.1}% within 5%; deviation reflects conflicting totals",
                    stats.max,
                    stats.median,
                    100.0 * stats.within_1pct,
                    100.0 * stats.within_5pct
                ),
                None => info!("check {name}: no groups with a positive target"),
            }
        }
        if self.negative_estimates > 0 {
            warn!(
                "check non-negative: {} negative estimates",
                self.negative_estimates
            );
        } else {
            info!("check non-negative: pass");
        }
    }
}

/// Recomputes achieved margins and rating-area totals from fitted cells.
pub fn validate(
    cells: &CellTable,
    insurer_rows: &[MarginRow<String>],
    metal_rows: &[MarginRow<MetalTier>],
    observations: &[EnrollmentObservation],
    tolerance: f64,
) -> ValidationReport {
    let achieved_ic = sum_by(cells, |key| {
        (key.year, key.insurer.clone(), key.county.clone())
    });
    let achieved_mc = sum_by(cells, |key| (key.year, key.metal_tier, key.county.clone()));
    let achieved_ra: HashMap<PlanKey, f64> = sum_by(cells, |key| {
        (
            key.year,
            key.rating_area,
            key.insurer.clone(),
            key.plan.clone(),
            key.metal_tier,
        )
    });

    let mut base: HashMap<PlanKey, f64> = HashMap::new();
    for observation in observations {
        *base
            .entry((
                observation.year,
                observation.rating_area,
                observation.insurer.clone(),
                observation.plan.clone(),
                observation.metal_tier,
            ))
            .or_insert(0.0) += observation.enrollment;
    }

    let report = ValidationReport {
        tolerance,
        insurer_county: compare(&achieved_ic, &margin_targets(insurer_rows)),
        metal_county: compare(&achieved_mc, &margin_targets(metal_rows)),
        rating_area: compare(&achieved_ra, &base),
        negative_estimates: cells.estimates().iter().filter(|v| **v < 0.0).count(),
    };
    report.log();
    report
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn consistency_flags_disagreeing_counties() {
        let ic = vec![
            MarginRow::new(2020, "X".to_string(), "A", 300.0),
            MarginRow::new(2020, "X".to_string(), "B", 500.0),
        ];
        let mc = vec![
            MarginRow::new(2020, MetalTier::Bronze, "A", 350.0),
            MarginRow::new(2020, MetalTier::Bronze, "B", 450.0),
            MarginRow::new(2020, MetalTier::Silver, "C", 10.0),
        ];

        let report = margin_consistency(&ic, &mc, 0.01);
        assert_eq!(report.county_years, 3);
        assert_eq!(report.inconsistent.len(), 3);
        assert_eq!(report.years.len(), 1);
        assert_relative_eq!(report.years[0].insurer_total, 800.0);
        assert_relative_eq!(report.years[0].metal_total, 810.0);
    }

    #[test]
    fn matching_totals_are_consistent() {
        let ic = vec![
            MarginRow::new(2020, "X".to_string(), "A", 60.0),
            MarginRow::new(2020, "Y".to_string(), "A", 40.0),
        ];
        let mc = vec![
            MarginRow::new(2020, MetalTier::Gold, "A", 70.0),
            MarginRow::new(2020, MetalTier::Silver, "A", 30.0),
        ];
        assert!(margin_consistency(&ic, &mc, 0.01).is_consistent());
    }

    #[test]
    fn deviation_stats_use_pandas_median() {
        let stats = DeviationStats::from_diffs(vec![0.2, 0.0, 0.04, 0.001]).unwrap();
        assert_eq!(stats.groups, 4);
        assert_relative_eq!(stats.max, 0.2);
        assert_relative_eq!(stats.median, 0.0205);
        assert_relative_eq!(stats.within_1pct, 0.5);
        assert_relative_eq!(stats.within_5pct, 0.75);
        assert!(DeviationStats::from_diffs(Vec::new()).is_none());
    }

    #[test]
    fn validator_counts_negative_estimates() {
        let keys = vec![
            CellKey {
                year: 2020,
                county: "A".to_string(),
                rating_area: 1,
                insurer: "X".to_string(),
                plan: "PPO".to_string(),
                metal_tier: MetalTier::Bronze,
            },
            CellKey {
                year: 2020,
                county: "B".to_string(),
                rating_area: 1,
                insurer: "X".to_string(),
                plan: "PPO".to_string(),
                metal_tier: MetalTier::Bronze,
            },
        ];
        let mut cells = CellTable::new(keys, vec![120.0, 30.0]).unwrap();
        cells.estimates_mut()[1] = -30.0;
        let ic = vec![MarginRow::new(2020, "X".to_string(), "A", 120.0)];
        let mc = vec![MarginRow::new(2020, MetalTier::Bronze, "A", 120.0)];

        let report = validate(&cells, &ic, &mc, &[], 1e-3);
        assert_eq!(report.negative_estimates, 1);
        assert!(report.margins_reconciled());
        assert!(report.rating_area.is_none());
    }
}
