//! Run-level configuration: solver settings plus diagnostic thresholds.

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, Result};
use crate::solving::IpfOptions;

/// Aggregated configuration used when solving an [`AllocationProblem`](crate::AllocationProblem).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationOptions {
    /// Configuration for the per-year fitting loop.
    pub ipf: IpfOptions,
    /// Solve year partitions on the rayon thread pool.
    pub parallel: bool,
    /// Relative gap between a county's insurer and metal totals above which
    /// the county is reported as inconsistent.
    pub consistency_threshold: f64,
    /// Relative deviation below which a validation check passes.
    pub validation_tolerance: f64,
}

impl Default for AllocationOptions {
    fn default() -> Self {
        Self {
            ipf: IpfOptions::default(),
            parallel: true,
            consistency_threshold: 0.01,
            validation_tolerance: 1e-3,
        }
    }
}

impl AllocationOptions {
    /// Override the IPF settings while preserving other defaults.
    pub fn with_ipf(mut self, ipf: IpfOptions) -> Self {
        self.ipf = ipf;
        self
    }

    /// Enable or disable solving years in parallel.
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the threshold used by the margin consistency check.
    pub fn with_consistency_threshold(mut self, threshold: f64) -> Self {
        self.consistency_threshold = threshold;
        self
    }

    /// Set the tolerance used by the validator.
    pub fn with_validation_tolerance(mut self, tolerance: f64) -> Self {
        self.validation_tolerance = tolerance;
        self
    }

    /// Checks every setting before any year is solved.
    pub fn validate(&self) -> Result<()> {
        self.ipf.validate()?;
        for (option, value) in [
            ("consistency_threshold", self.consistency_threshold),
            ("validation_tolerance", self.validation_tolerance),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(AllocError::invalid_option(
                    option,
                    format!("must be non-negative and finite, found {value}"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let options: AllocationOptions =
            serde_json::from_str(r#"{ "parallel": false, "ipf": { "tolerance": 1e-6 } }"#).unwrap();

        assert!(!options.parallel);
        assert_eq!(options.ipf.tolerance, 1e-6);
        assert_eq!(options.ipf.max_iterations, 100);
        assert_eq!(options.consistency_threshold, 0.01);
        assert!(options.validate().is_ok());
    }

    #[test]
    fn negative_threshold_is_rejected() {
        let options = AllocationOptions::default().with_consistency_threshold(-1.0);
        assert!(matches!(
            options.validate(),
            Err(AllocError::InvalidOption {
                option: "consistency_threshold",
                ..
            })
        ));
    }
}
