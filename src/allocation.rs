//! High-level allocation pipeline: seed, fit every year, validate.

use std::collections::{BTreeMap, BTreeSet};

use log::info;
use rayon::prelude::*;
use serde::Serialize;

use crate::data::{CellTable, RatingArea, Year, YearPartition};
use crate::error::{AllocError, Result};
use crate::fitting::fit_partition;
use crate::margins::{InsurerCountyIndex, MarginRow, MetalCountyIndex};
use crate::options::AllocationOptions;
use crate::records::CleanedInputs;
use crate::seeding::{
    initial_allocation, CrosswalkEntry, EnrollmentObservation, EqualWeights, SeedingPolicy,
};
use crate::solving::SolverReport;
use crate::tier::MetalTier;
use crate::validation::{margin_consistency, validate, ConsistencyReport, ValidationReport};

/// Inputs of a county allocation run.
#[derive(Clone, Debug)]
pub struct AllocationProblem {
    observations: Vec<EnrollmentObservation>,
    crosswalk: Vec<CrosswalkEntry>,
    insurer_targets: Vec<MarginRow<String>>,
    metal_targets: Vec<MarginRow<MetalTier>>,
}

impl AllocationProblem {
    /// Returns a builder for assembling a problem from its tables.
    pub fn builder() -> AllocationProblemBuilder {
        AllocationProblemBuilder::default()
    }

    /// Wraps the output of the cleaning stage.
    pub fn from_cleaned(inputs: CleanedInputs) -> Self {
        Self {
            observations: inputs.observations,
            crosswalk: inputs.crosswalk,
            insurer_targets: inputs.insurer_targets,
            metal_targets: inputs.metal_targets,
        }
    }

    /// Rating-area observations that seed the cells.
    pub fn observations(&self) -> &[EnrollmentObservation] {
        &self.observations
    }

    /// County to rating-area crosswalk.
    pub fn crosswalk(&self) -> &[CrosswalkEntry] {
        &self.crosswalk
    }

    /// Insurer × county control totals across all years.
    pub fn insurer_targets(&self) -> &[MarginRow<String>] {
        &self.insurer_targets
    }

    /// Metal × county control totals across all years.
    pub fn metal_targets(&self) -> &[MarginRow<MetalTier>] {
        &self.metal_targets
    }

    /// Solves with the equal-weight crosswalk.
    pub fn solve(&self, options: &AllocationOptions) -> Result<AllocationResult> {
        self.solve_with_policy(&EqualWeights, options)
    }

    /// Solves with a caller-supplied seeding policy.
    pub fn solve_with_policy<P>(
        &self,
        policy: &P,
        options: &AllocationOptions,
    ) -> Result<AllocationResult>
    where
        P: SeedingPolicy + ?Sized,
    {
        options.validate()?;

        let consistency = margin_consistency(
            &self.insurer_targets,
            &self.metal_targets,
            options.consistency_threshold,
        );

        let weights = policy.weights(&self.crosswalk)?;
        let seeded = initial_allocation(&self.observations, &weights)?;
        let (cells, reports) =
            fit_years(seeded, &self.insurer_targets, &self.metal_targets, options)?;

        let validation = validate(
            &cells,
            &self.insurer_targets,
            &self.metal_targets,
            &self.observations,
            options.validation_tolerance,
        );

        Ok(AllocationResult {
            cells,
            reports,
            consistency,
            validation,
        })
    }
}

/// Builder that checks every table was supplied before constructing an [`AllocationProblem`].
#[derive(Debug, Default)]
pub struct AllocationProblemBuilder {
    observations: Option<Vec<EnrollmentObservation>>,
    crosswalk: Option<Vec<CrosswalkEntry>>,
    insurer_targets: Option<Vec<MarginRow<String>>>,
    metal_targets: Option<Vec<MarginRow<MetalTier>>>,
}

impl AllocationProblemBuilder {
    /// Sets the rating-area observations.
    pub fn observations(mut self, observations: Vec<EnrollmentObservation>) -> Self {
        self.observations = Some(observations);
        self
    }

    /// Sets the county crosswalk.
    pub fn crosswalk(mut self, crosswalk: Vec<CrosswalkEntry>) -> Self {
        self.crosswalk = Some(crosswalk);
        self
    }

    /// Sets the insurer × county control totals.
    pub fn insurer_targets(mut self, targets: Vec<MarginRow<String>>) -> Self {
        self.insurer_targets = Some(targets);
        self
    }

    /// Sets the metal × county control totals.
    pub fn metal_targets(mut self, targets: Vec<MarginRow<MetalTier>>) -> Self {
        self.metal_targets = Some(targets);
        self
    }

    /// Finalizes the problem.
    pub fn build(self) -> Result<AllocationProblem> {
        Ok(AllocationProblem {
            observations: self
                .observations
                .ok_or_else(|| AllocError::missing_component("observations"))?,
            crosswalk: self
                .crosswalk
                .ok_or_else(|| AllocError::missing_component("crosswalk"))?,
            insurer_targets: self
                .insurer_targets
                .ok_or_else(|| AllocError::missing_component("insurer targets"))?,
            metal_targets: self
                .metal_targets
                .ok_or_else(|| AllocError::missing_component("metal targets"))?,
        })
    }
}

/// Fits every year of `cells` independently and reassembles them in year order.
///
/// Margin indices are built per year from the rows matching that year. With
/// `options.parallel` the years run on the rayon pool; results are identical
/// to the sequential path.
pub fn fit_years(
    cells: CellTable,
    insurer_targets: &[MarginRow<String>],
    metal_targets: &[MarginRow<MetalTier>],
    options: &AllocationOptions,
) -> Result<(CellTable, Vec<SolverReport>)> {
    options.validate()?;
    let partitions = cells.split_by_year();
    info!("fitting {} year partitions", partitions.len());

    let solve_year = |mut partition: YearPartition| -> Result<(YearPartition, SolverReport)> {
        let year = partition.year();
        let insurer_margins = InsurerCountyIndex::build(year, insurer_targets)?;
        let metal_margins = MetalCountyIndex::build(year, metal_targets)?;
        let report = fit_partition(
            &mut partition,
            &insurer_margins,
            &metal_margins,
            &options.ipf,
        )?;
        Ok((partition, report))
    };

    let solved: Vec<(YearPartition, SolverReport)> = if options.parallel {
        partitions
            .into_par_iter()
            .map(solve_year)
            .collect::<Result<_>>()?
    } else {
        partitions
            .into_iter()
            .map(solve_year)
            .collect::<Result<_>>()?
    };

    let (partitions, reports): (Vec<_>, Vec<_>) = solved.into_iter().unzip();
    let cells = CellTable::concat(partitions);
    info!("fitted dataset: {} cells", cells.len());
    Ok((cells, reports))
}

/// One output row, shaped for the writer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllocatedRow {
    pub year: Year,
    pub county: String,
    pub rating_area: RatingArea,
    pub insurer: String,
    pub plan: String,
    pub metal_tier: MetalTier,
    pub enrollment_est: f64,
}

impl AllocatedRow {
    fn sort_key(&self) -> (Year, &str, &str, &str, MetalTier, RatingArea) {
        (
            self.year,
            &self.county,
            &self.insurer,
            &self.plan,
            self.metal_tier,
            self.rating_area,
        )
    }
}

/// Descriptive statistics of an allocation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllocationSummary {
    pub total_by_year: BTreeMap<Year, f64>,
    pub rows: usize,
    pub counties: usize,
    pub insurers: usize,
    pub plans: usize,
    pub metal_tiers: usize,
    /// First and last year, if any cell exists.
    pub year_range: Option<(Year, Year)>,
}

/// Everything produced by [`AllocationProblem::solve`].
#[derive(Clone, Debug)]
pub struct AllocationResult {
    /// Fitted cells, clamped at zero, ordered by year.
    pub cells: CellTable,
    /// One solver report per year, ascending.
    pub reports: Vec<SolverReport>,
    /// Up-front comparison of the two control systems.
    pub consistency: ConsistencyReport,
    /// Post-hoc deviation of the fitted cells from their targets.
    pub validation: ValidationReport,
}

impl AllocationResult {
    /// Whether every year reached the tolerance.
    pub fn all_converged(&self) -> bool {
        self.reports.iter().all(|report| report.converged)
    }

    /// Solver report for `year`, if that year had cells.
    pub fn report_for(&self, year: Year) -> Option<&SolverReport> {
        self.reports.iter().find(|report| report.year == year)
    }

    /// Output rows sorted by year, county, insurer, plan and metal tier.
    pub fn rows(&self) -> Vec<AllocatedRow> {
        let mut rows: Vec<AllocatedRow> = self
            .cells
            .iter()
            .map(|(key, estimate)| AllocatedRow {
                year: key.year,
                county: key.county.clone(),
                rating_area: key.rating_area,
                insurer: key.insurer.clone(),
                plan: key.plan.clone(),
                metal_tier: key.metal_tier,
                enrollment_est: estimate,
            })
            .collect();

        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        rows
    }

    /// Totals by year and distinct counts of each key dimension.
    pub fn summary(&self) -> AllocationSummary {
        let mut total_by_year: BTreeMap<Year, f64> = BTreeMap::new();
        let mut counties = BTreeSet::new();
        let mut insurers = BTreeSet::new();
        let mut plans = BTreeSet::new();
        let mut metal_tiers = BTreeSet::new();

        for (key, estimate) in self.cells.iter() {
            *total_by_year.entry(key.year).or_insert(0.0) += estimate;
            counties.insert(key.county.as_str());
            insurers.insert(key.insurer.as_str());
            plans.insert(key.plan.as_str());
            metal_tiers.insert(key.metal_tier);
        }

        let year_range = total_by_year
            .keys()
            .next()
            .zip(total_by_year.keys().next_back())
            .map(|(first, last)| (*first, *last));

        AllocationSummary {
            rows: self.cells.len(),
            counties: counties.len(),
            insurers: insurers.len(),
            plans: plans.len(),
            metal_tiers: metal_tiers.len(),
            year_range,
            total_by_year,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn problem() -> AllocationProblem {
        AllocationProblem::builder()
            .observations(vec![EnrollmentObservation {
                year: 2020,
                rating_area: 1,
                insurer: "X".to_string(),
                plan: "P".to_string(),
                metal_tier: MetalTier::Bronze,
                enrollment: 1000.0,
            }])
            .crosswalk(vec![
                CrosswalkEntry::new("A", 1),
                CrosswalkEntry::new("B", 1),
            ])
            .insurer_targets(vec![
                MarginRow::new(2020, "X".to_string(), "A", 300.0),
                MarginRow::new(2020, "X".to_string(), "B", 500.0),
            ])
            .metal_targets(vec![
                MarginRow::new(2020, MetalTier::Bronze, "A", 350.0),
                MarginRow::new(2020, MetalTier::Bronze, "B", 450.0),
            ])
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_every_table() {
        let result = AllocationProblem::builder()
            .observations(Vec::new())
            .crosswalk(Vec::new())
            .build();
        assert!(matches!(
            result,
            Err(AllocError::MissingComponent {
                component: "insurer targets"
            })
        ));
    }

    #[test]
    fn summary_counts_dimensions() {
        let result = problem().solve(&AllocationOptions::default()).unwrap();
        let summary = result.summary();

        assert_eq!(summary.rows, 2);
        assert_eq!(summary.counties, 2);
        assert_eq!(summary.insurers, 1);
        assert_eq!(summary.year_range, Some((2020, 2020)));
        assert_relative_eq!(summary.total_by_year[&2020], 800.0, epsilon = 1e-9);
    }

    #[test]
    fn rows_are_sorted_by_county() {
        let result = problem().solve(&AllocationOptions::default()).unwrap();
        let rows = result.rows();
        assert_eq!(rows[0].county, "A");
        assert_eq!(rows[1].county, "B");
        assert_relative_eq!(rows[0].enrollment_est, 350.0, epsilon = 1e-9);
    }
}
