//! County-level cell containers and year partitioning used by the IPF solver.

use std::collections::{BTreeMap, HashMap};

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{check_quantity, AllocError, Result};
use crate::tier::MetalTier;

/// Calendar year identifying an independent solver partition.
pub type Year = i32;

/// Numeric identifier of a rating area.
pub type RatingArea = u32;

/// Composite key of a cell. Unique within a [`CellTable`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellKey {
    pub year: Year,
    pub county: String,
    pub rating_area: RatingArea,
    pub insurer: String,
    pub plan: String,
    pub metal_tier: MetalTier,
}

/// Working table of county-level cells and their current estimates.
///
/// Keys and estimates are stored side by side; estimates live in a dense
/// vector so the solver can snapshot and rescale them without touching keys.
#[derive(Clone, Debug)]
pub struct CellTable {
    keys: Vec<CellKey>,
    estimates: DVector<f64>,
}

impl Default for CellTable {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            estimates: DVector::zeros(0),
        }
    }
}

impl CellTable {
    /// Creates a table from parallel key and estimate vectors.
    ///
    /// Duplicate keys are merged by summing their estimates, so the resulting
    /// table may be shorter than the input.
    pub fn new(keys: Vec<CellKey>, estimates: Vec<f64>) -> Result<Self> {
        if keys.len() != estimates.len() {
            return Err(AllocError::dimension_mismatch(
                "cell estimates",
                keys.len(),
                estimates.len(),
            ));
        }
        let mut builder = CellTableBuilder::with_capacity(keys.len());
        for (key, estimate) in keys.into_iter().zip(estimates) {
            builder.push(key, estimate)?;
        }
        Ok(builder.build())
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the table holds no cells.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the cell keys in storage order.
    pub fn keys(&self) -> &[CellKey] {
        &self.keys
    }

    /// Returns the current estimates aligned with [`keys`](Self::keys).
    pub fn estimates(&self) -> &DVector<f64> {
        &self.estimates
    }

    pub(crate) fn estimates_mut(&mut self) -> &mut DVector<f64> {
        &mut self.estimates
    }

    /// Iterates over `(key, estimate)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&CellKey, f64)> + '_ {
        self.keys.iter().zip(self.estimates.iter().copied())
    }

    /// Looks up the estimate for a key by linear scan.
    pub fn estimate_of(&self, key: &CellKey) -> Option<f64> {
        self.keys
            .iter()
            .position(|candidate| candidate == key)
            .map(|index| self.estimates[index])
    }

    /// Sum of all estimates.
    pub fn total(&self) -> f64 {
        self.estimates.sum()
    }

    /// Distinct years present, ascending.
    pub fn years(&self) -> Vec<Year> {
        let mut years: Vec<Year> = self.keys.iter().map(|key| key.year).collect();
        years.sort_unstable();
        years.dedup();
        years
    }

    /// Floors every estimate at zero and returns how many cells were raised.
    pub fn clamp_non_negative(&mut self) -> usize {
        let mut clamped = 0;
        for value in self.estimates.iter_mut() {
            if *value < 0.0 {
                *value = 0.0;
                clamped += 1;
            }
        }
        clamped
    }

    /// Splits the table into independent year partitions, ordered by year.
    pub fn split_by_year(self) -> Vec<YearPartition> {
        let mut grouped: BTreeMap<Year, (Vec<CellKey>, Vec<f64>)> = BTreeMap::new();
        for (key, estimate) in self.keys.into_iter().zip(self.estimates.iter().copied()) {
            let entry = grouped.entry(key.year).or_default();
            entry.0.push(key);
            entry.1.push(estimate);
        }

        grouped
            .into_iter()
            .map(|(year, (keys, values))| YearPartition {
                year,
                cells: CellTable {
                    keys,
                    estimates: DVector::from_vec(values),
                },
            })
            .collect()
    }

    /// Concatenates partitions back into a single table in the given order.
    pub fn concat<I>(partitions: I) -> Self
    where
        I: IntoIterator<Item = YearPartition>,
    {
        let mut keys = Vec::new();
        let mut values = Vec::new();
        for partition in partitions {
            values.extend(partition.cells.estimates.iter().copied());
            keys.extend(partition.cells.keys);
        }
        CellTable {
            keys,
            estimates: DVector::from_vec(values),
        }
    }
}

/// Incremental constructor that validates estimates and merges duplicate keys.
#[derive(Debug, Default)]
pub struct CellTableBuilder {
    positions: HashMap<CellKey, usize>,
    keys: Vec<CellKey>,
    values: Vec<f64>,
    pushed: usize,
}

impl CellTableBuilder {
    /// Starts an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts an empty builder sized for `capacity` distinct cells.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: HashMap::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
            values: Vec::with_capacity(capacity),
            pushed: 0,
        }
    }

    /// Adds `estimate` to the cell identified by `key`, creating it if needed.
    pub fn push(&mut self, key: CellKey, estimate: f64) -> Result<()> {
        check_quantity("cell estimate", self.pushed, estimate)?;
        self.pushed += 1;

        match self.positions.get(&key) {
            Some(&position) => self.values[position] += estimate,
            None => {
                self.positions.insert(key.clone(), self.keys.len());
                self.keys.push(key);
                self.values.push(estimate);
            }
        }
        Ok(())
    }

    /// Number of distinct cells collected so far.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no cell has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Finalizes the table, preserving first-seen key order.
    pub fn build(self) -> CellTable {
        CellTable {
            keys: self.keys,
            estimates: DVector::from_vec(self.values),
        }
    }
}

/// All cells of a single year. The unit of independent solver execution.
#[derive(Clone, Debug)]
pub struct YearPartition {
    year: Year,
    cells: CellTable,
}

impl YearPartition {
    /// Wraps a table whose cells must all belong to `year`.
    pub fn new(year: Year, cells: CellTable) -> Result<Self> {
        if let Some((index, key)) = cells
            .keys
            .iter()
            .enumerate()
            .find(|(_, key)| key.year != year)
        {
            return Err(AllocError::YearMismatch {
                index,
                expected: year,
                found: key.year,
            });
        }
        Ok(Self { year, cells })
    }

    /// Returns the year of this partition.
    pub fn year(&self) -> Year {
        self.year
    }

    /// Read-only view of the partition's cells.
    pub fn cells(&self) -> &CellTable {
        &self.cells
    }

    pub(crate) fn cells_mut(&mut self) -> &mut CellTable {
        &mut self.cells
    }

    /// Consumes the partition, returning its cells.
    pub fn into_cells(self) -> CellTable {
        self.cells
    }
}
