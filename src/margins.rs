//! Control-total lookups keyed by `(dimension, county)`.

use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::data::Year;
use crate::error::{check_quantity, Result};
use crate::tier::MetalTier;

/// One row of a control-total source table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarginRow<K> {
    pub year: Year,
    pub key: K,
    pub county: String,
    pub value: f64,
}

impl<K> MarginRow<K> {
    /// Convenience constructor.
    pub fn new(year: Year, key: K, county: impl Into<String>, value: f64) -> Self {
        Self {
            year,
            key,
            county: county.into(),
            value,
        }
    }
}

/// Read-only mapping from `(key, county)` to a target total for one year.
///
/// Lookups never fail: an absent pair means target zero.
#[derive(Clone, Debug)]
pub struct MarginIndex<K> {
    year: Year,
    targets: HashMap<K, HashMap<String, f64>>,
}

/// Insurer × county control totals.
pub type InsurerCountyIndex = MarginIndex<String>;

/// Metal tier × county control totals.
pub type MetalCountyIndex = MarginIndex<MetalTier>;

impl<K> MarginIndex<K>
where
    K: Clone + Eq + Hash,
{
    /// Builds the index for `year` from the rows of a source table.
    ///
    /// Rows belonging to other years are skipped. Duplicate pairs are summed.
    /// Negative or non-finite values are rejected.
    pub fn build<'a, I>(year: Year, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a MarginRow<K>>,
        K: 'a,
    {
        let mut targets: HashMap<K, HashMap<String, f64>> = HashMap::new();
        for (index, row) in rows.into_iter().enumerate() {
            check_quantity("margin target", index, row.value)?;
            if row.year != year {
                continue;
            }
            *targets
                .entry(row.key.clone())
                .or_default()
                .entry(row.county.clone())
                .or_insert(0.0) += row.value;
        }
        Ok(Self { year, targets })
    }

    /// Returns the target for `(key, county)`, or `0.0` if none was supplied.
    pub fn lookup(&self, key: &K, county: &str) -> f64 {
        self.targets
            .get(key)
            .and_then(|counties| counties.get(county))
            .copied()
            .unwrap_or(0.0)
    }

    /// Whether an explicit target exists for `(key, county)`.
    pub fn contains(&self, key: &K, county: &str) -> bool {
        self.targets
            .get(key)
            .is_some_and(|counties| counties.contains_key(county))
    }

    /// Year this index was built for.
    pub fn year(&self) -> Year {
        self.year
    }

    /// Number of distinct `(key, county)` pairs.
    pub fn len(&self) -> usize {
        self.targets.values().map(HashMap::len).sum()
    }

    /// Whether the index holds no targets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over `(key, county, target)` triples in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &str, f64)> + '_ {
        self.targets.iter().flat_map(|(key, counties)| {
            counties
                .iter()
                .map(move |(county, value)| (key, county.as_str(), *value))
        })
    }

    /// Sum of targets per county across every key.
    pub fn county_totals(&self) -> HashMap<String, f64> {
        let mut totals: HashMap<String, f64> = HashMap::new();
        for (_, county, value) in self.iter() {
            *totals.entry(county.to_string()).or_insert(0.0) += value;
        }
        totals
    }

    /// Sum of every target.
    pub fn total(&self) -> f64 {
        self.iter().map(|(_, _, value)| value).sum()
    }
}
