//! Initial allocation of rating-area enrollment into county cells.
//!
//! The split of a rating area across its counties is a policy decision. The
//! [`SeedingPolicy`] trait turns a crosswalk into [`RatingAreaWeights`], and
//! [`initial_allocation`] applies those weights once to produce the starting
//! [`CellTable`]. The solver never sees the policy, so a population-weighted
//! seed can replace the equal split without touching the fitting code.

use std::collections::{BTreeMap, HashMap};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::data::{CellKey, CellTable, CellTableBuilder, RatingArea, Year};
use crate::error::{check_quantity, AllocError, Result};
use crate::tier::MetalTier;

/// Slack tolerated before weights of a rating area are reported as not summing to one.
const WEIGHT_SUM_SLACK: f64 = 1e-9;

/// Plan-level enrollment observed at rating-area granularity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentObservation {
    pub year: Year,
    pub rating_area: RatingArea,
    pub insurer: String,
    pub plan: String,
    pub metal_tier: MetalTier,
    pub enrollment: f64,
}

/// Membership of a county in a rating area.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrosswalkEntry {
    pub county: String,
    pub rating_area: RatingArea,
}

impl CrosswalkEntry {
    /// Convenience constructor.
    pub fn new(county: impl Into<String>, rating_area: RatingArea) -> Self {
        Self {
            county: county.into(),
            rating_area,
        }
    }
}

/// Fraction of each rating area's enrollment assigned to each of its counties.
#[derive(Clone, Debug, Default)]
pub struct RatingAreaWeights {
    areas: BTreeMap<RatingArea, Vec<(String, f64)>>,
}

impl RatingAreaWeights {
    /// Builds weights from `(county, rating_area, weight)` triples.
    ///
    /// Every weight must lie in `(0, 1]`. Areas whose weights do not sum to one
    /// are accepted with a warning; the drift carries into total enrollment.
    pub fn new<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, RatingArea, f64)>,
    {
        let mut areas: BTreeMap<RatingArea, Vec<(String, f64)>> = BTreeMap::new();
        for (county, rating_area, weight) in entries {
            if !(weight > 0.0 && weight <= 1.0) {
                return Err(AllocError::InvalidWeight {
                    county,
                    rating_area,
                    weight,
                });
            }
            areas.entry(rating_area).or_default().push((county, weight));
        }

        for (rating_area, counties) in &areas {
            let sum: f64 = counties.iter().map(|(_, weight)| weight).sum();
            if (sum - 1.0).abs() > WEIGHT_SUM_SLACK {
                warn!("weights for rating area {rating_area} sum to {sum:.6}, not 1");
            }
        }

        Ok(Self { areas })
    }

    /// Counties and weights mapped to `rating_area`; empty if the area is unknown.
    pub fn counties(&self, rating_area: RatingArea) -> &[(String, f64)] {
        self.areas
            .get(&rating_area)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Weight of a single `(county, rating_area)` pair.
    pub fn weight(&self, county: &str, rating_area: RatingArea) -> Option<f64> {
        self.counties(rating_area)
            .iter()
            .find(|(name, _)| name == county)
            .map(|(_, weight)| *weight)
    }

    /// Number of rating areas with at least one county.
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }
}

/// Strategy for splitting a rating area across its counties.
pub trait SeedingPolicy {
    /// Derives weights from the crosswalk.
    fn weights(&self, crosswalk: &[CrosswalkEntry]) -> Result<RatingAreaWeights>;
}

/// Every county in a rating area receives `1 / n` of its enrollment.
#[derive(Clone, Copy, Debug, Default)]
pub struct EqualWeights;

impl SeedingPolicy for EqualWeights {
    fn weights(&self, crosswalk: &[CrosswalkEntry]) -> Result<RatingAreaWeights> {
        let mut counts: HashMap<RatingArea, usize> = HashMap::new();
        for entry in crosswalk {
            *counts.entry(entry.rating_area).or_insert(0) += 1;
        }

        RatingAreaWeights::new(crosswalk.iter().map(|entry| {
            let n = counts[&entry.rating_area] as f64;
            (entry.county.clone(), entry.rating_area, 1.0 / n)
        }))
    }
}

/// Counties receive a share proportional to their population within the rating area.
///
/// Counties without a population figure, or areas whose total population is
/// zero, fall back to the equal split for that area.
#[derive(Clone, Debug, Default)]
pub struct PopulationWeights {
    population: HashMap<String, f64>,
}

impl PopulationWeights {
    /// Creates the policy from a county → population table.
    pub fn new(population: HashMap<String, f64>) -> Result<Self> {
        for (index, value) in population.values().enumerate() {
            check_quantity("county population", index, *value)?;
        }
        Ok(Self { population })
    }
}

impl SeedingPolicy for PopulationWeights {
    fn weights(&self, crosswalk: &[CrosswalkEntry]) -> Result<RatingAreaWeights> {
        let mut areas: BTreeMap<RatingArea, Vec<&CrosswalkEntry>> = BTreeMap::new();
        for entry in crosswalk {
            areas.entry(entry.rating_area).or_default().push(entry);
        }

        let mut triples = Vec::with_capacity(crosswalk.len());
        for (rating_area, members) in areas {
            let populations: Option<Vec<f64>> = members
                .iter()
                .map(|entry| self.population.get(&entry.county).copied())
                .collect();
            let total: f64 = populations.iter().flatten().sum();

            match populations {
                Some(populations) if total > 0.0 && populations.iter().all(|p| *p > 0.0) => {
                    for (entry, population) in members.iter().zip(populations) {
                        triples.push((entry.county.clone(), rating_area, population / total));
                    }
                }
                _ => {
                    warn!("rating area {rating_area}: no usable population data, splitting evenly");
                    let share = 1.0 / members.len() as f64;
                    for entry in members {
                        triples.push((entry.county.clone(), rating_area, share));
                    }
                }
            }
        }

        RatingAreaWeights::new(triples)
    }
}

/// Distributes each observation across the counties of its rating area.
///
/// Emits one cell per `(observation, county)` with `enrollment * weight`.
/// Observations whose rating area has no counties are dropped. Duplicate
/// cells are summed.
pub fn initial_allocation(
    observations: &[EnrollmentObservation],
    weights: &RatingAreaWeights,
) -> Result<CellTable> {
    let mut builder = CellTableBuilder::with_capacity(observations.len());
    let mut unmapped = 0usize;
    let mut base_total = 0.0;

    for (index, observation) in observations.iter().enumerate() {
        check_quantity("enrollment", index, observation.enrollment)?;
        base_total += observation.enrollment;

        let counties = weights.counties(observation.rating_area);
        if counties.is_empty() {
            unmapped += 1;
            continue;
        }

        for (county, weight) in counties {
            let key = CellKey {
                year: observation.year,
                county: county.clone(),
                rating_area: observation.rating_area,
                insurer: observation.insurer.clone(),
                plan: observation.plan.clone(),
                metal_tier: observation.metal_tier,
            };
            builder.push(key, observation.enrollment * weight)?;
        }
    }

    if unmapped > 0 {
        warn!("{unmapped} observations reference rating areas without counties and were dropped");
    }

    let table = builder.build();
    info!(
        "initial allocation: {} cells, base enrollment {:.0}, allocated {:.0}",
        table.len(),
        base_total,
        table.total()
    );
    Ok(table)
}
