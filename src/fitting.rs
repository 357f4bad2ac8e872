//! Iterative proportional fitting against insurer × county and metal × county margins.

use std::collections::HashMap;
use std::hash::Hash;

use log::{debug, info, warn};
use nalgebra::DVector;

use crate::data::{CellKey, CellTable, Year, YearPartition};
use crate::error::{AllocError, Result};
use crate::margins::{InsurerCountyIndex, MarginIndex, MetalCountyIndex};
use crate::solving::{IpfOptions, SolverReport};

/// Assignment of every cell to a `(dimension, county)` group and that group's target.
#[derive(Clone, Debug)]
struct Grouping {
    cell_group: Vec<usize>,
    targets: DVector<f64>,
}

impl Grouping {
    fn build<'a, K, F>(cells: &'a CellTable, index: &MarginIndex<K>, dimension: F) -> Self
    where
        K: Clone + Eq + Hash + 'a,
        F: Fn(&'a CellKey) -> &'a K,
    {
        let mut groups: HashMap<(&'a K, &'a str), usize> = HashMap::new();
        let mut targets = Vec::new();
        let mut cell_group = Vec::with_capacity(cells.len());

        for key in cells.keys() {
            let value = dimension(key);
            let next = groups.len();
            let group = *groups
                .entry((value, key.county.as_str()))
                .or_insert_with(|| {
                    targets.push(index.lookup(value, &key.county));
                    next
                });
            cell_group.push(group);
        }

        Self {
            cell_group,
            targets: DVector::from_vec(targets),
        }
    }

    fn group_count(&self) -> usize {
        self.targets.len()
    }

    /// Scales every group to its target. Returns how many groups with
    /// residual mass at or below `zero_guard` were zeroed.
    fn rescale(&self, estimates: &mut DVector<f64>, zero_guard: f64) -> usize {
        let mut sums = DVector::<f64>::zeros(self.group_count());
        for (cell, &group) in self.cell_group.iter().enumerate() {
            sums[group] += estimates[cell];
        }

        let mut zeroed = 0;
        let factors = DVector::from_iterator(
            self.group_count(),
            sums.iter().zip(self.targets.iter()).map(|(&sum, &target)| {
                if sum > zero_guard {
                    target / sum
                } else {
                    if sum > 0.0 {
                        zeroed += 1;
                    }
                    0.0
                }
            }),
        );

        for (cell, &group) in self.cell_group.iter().enumerate() {
            estimates[cell] *= factors[group];
        }
        zeroed
    }
}

/// Largest relative change `|current - prior| / prior` over cells whose prior
/// exceeds `zero_guard`. Cells that were empty are ignored; if every cell was
/// empty the change is zero.
pub fn max_relative_change(prior: &DVector<f64>, current: &DVector<f64>, zero_guard: f64) -> f64 {
    prior
        .iter()
        .zip(current.iter())
        .filter(|&(&before, _)| before > zero_guard)
        .map(|(&before, &after)| (after - before).abs() / before)
        .fold(0.0, f64::max)
}

/// Diagnostics from a single insurer-then-metal pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutcome {
    /// Maximum relative change produced by the pass.
    pub max_relative_change: f64,
    /// Groups zeroed by the guard during the pass.
    pub zeroed_groups: usize,
}

/// Solver bound to the group structure of one year's cells.
///
/// Groupings and their targets are resolved once on construction; every
/// iteration afterwards only touches the estimate vector.
#[derive(Clone, Debug)]
pub struct IpfSolver {
    insurer_groups: Grouping,
    metal_groups: Grouping,
    options: IpfOptions,
}

impl IpfSolver {
    /// Resolves the insurer × county and metal × county groups of `cells`.
    pub fn new(
        cells: &CellTable,
        insurer_margins: &InsurerCountyIndex,
        metal_margins: &MetalCountyIndex,
        options: &IpfOptions,
    ) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            insurer_groups: Grouping::build(cells, insurer_margins, |key| &key.insurer),
            metal_groups: Grouping::build(cells, metal_margins, |key| &key.metal_tier),
            options: options.clone(),
        })
    }

    /// Number of insurer × county groups present in the cells.
    pub fn insurer_group_count(&self) -> usize {
        self.insurer_groups.group_count()
    }

    /// Number of metal × county groups present in the cells.
    pub fn metal_group_count(&self) -> usize {
        self.metal_groups.group_count()
    }

    /// Runs one iteration: fit insurer margins, then metal margins.
    pub fn step(&self, estimates: &mut DVector<f64>) -> Result<StepOutcome> {
        if estimates.len() != self.insurer_groups.cell_group.len() {
            return Err(AllocError::dimension_mismatch(
                "estimate vector",
                self.insurer_groups.cell_group.len(),
                estimates.len(),
            ));
        }

        let guard = self.options.zero_guard;
        let snapshot = estimates.clone();
        let mut zeroed_groups = self.insurer_groups.rescale(estimates, guard);
        zeroed_groups += self.metal_groups.rescale(estimates, guard);

        Ok(StepOutcome {
            max_relative_change: max_relative_change(&snapshot, estimates, guard),
            zeroed_groups,
        })
    }

    /// Iterates until the relative change drops below the tolerance or the
    /// iteration cap is reached. Non-convergence is reported, not raised.
    pub fn solve(&self, year: Year, estimates: &mut DVector<f64>) -> Result<SolverReport> {
        let mut report = SolverReport {
            year,
            converged: false,
            iterations_used: 0,
            final_max_relative_change: f64::INFINITY,
            zeroed_groups: 0,
        };

        for iteration in 1..=self.options.max_iterations {
            let outcome = self.step(estimates)?;
            report.iterations_used = iteration;
            report.final_max_relative_change = outcome.max_relative_change;
            report.zeroed_groups += outcome.zeroed_groups;

            if outcome.max_relative_change < self.options.tolerance {
                report.converged = true;
                info!(
                    "year {year}: converged at iteration {iteration}, max relative change {:.6}",
                    outcome.max_relative_change
                );
                break;
            }

            let interval = self.options.progress_interval;
            if interval > 0 && iteration % interval == 0 {
                debug!(
                    "year {year}: iteration {iteration}, max relative change {:.6}",
                    outcome.max_relative_change
                );
            }
        }

        if !report.converged {
            warn!(
                "year {year}: no convergence after {} iterations, final max relative change {:.6}",
                report.iterations_used, report.final_max_relative_change
            );
        }
        Ok(report)
    }
}

/// Fits one year partition in place and floors the result at zero.
pub fn fit_partition(
    partition: &mut YearPartition,
    insurer_margins: &InsurerCountyIndex,
    metal_margins: &MetalCountyIndex,
    options: &IpfOptions,
) -> Result<SolverReport> {
    let year = partition.year();
    for (margin, found) in [
        ("insurer", insurer_margins.year()),
        ("metal", metal_margins.year()),
    ] {
        if found != year {
            return Err(AllocError::MarginYearMismatch {
                margin,
                expected: year,
                found,
            });
        }
    }

    let solver = IpfSolver::new(partition.cells(), insurer_margins, metal_margins, options)?;
    let cells = partition.cells_mut();
    let report = solver.solve(year, cells.estimates_mut())?;
    cells.clamp_non_negative();
    Ok(report)
}
