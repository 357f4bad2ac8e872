//! IPF solver configuration and diagnostics.

use serde::{Deserialize, Serialize};

use crate::data::Year;
use crate::error::{AllocError, Result};

/// Group sums at or below this value are treated as empty.
pub const DEFAULT_ZERO_GUARD: f64 = 1e-10;

/// Configuration for the alternating insurer/metal rescaling loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpfOptions {
    /// Maximum relative change between iterations accepted as converged.
    pub tolerance: f64,
    /// Hard cap on the number of iterations.
    pub max_iterations: usize,
    /// Group sums at or below this threshold are zeroed instead of divided.
    pub zero_guard: f64,
    /// Emit a progress log line every this many iterations (0 disables).
    pub progress_interval: usize,
}

impl Default for IpfOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            max_iterations: 100,
            zero_guard: DEFAULT_ZERO_GUARD,
            progress_interval: 20,
        }
    }
}

impl IpfOptions {
    /// Overrides the convergence tolerance.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Overrides the iteration cap.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Checks that every knob is in range.
    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(AllocError::invalid_option(
                "tolerance",
                format!("must be positive and finite, found {}", self.tolerance),
            ));
        }
        if self.max_iterations == 0 {
            return Err(AllocError::invalid_option(
                "max_iterations",
                "at least one iteration is required",
            ));
        }
        if !(self.zero_guard.is_finite() && self.zero_guard >= 0.0) {
            return Err(AllocError::invalid_option(
                "zero_guard",
                format!("must be non-negative and finite, found {}", self.zero_guard),
            ));
        }
        Ok(())
    }
}

/// Outcome of solving one year partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolverReport {
    /// Year the report refers to.
    pub year: Year,
    /// Whether the relative change dropped below the tolerance.
    pub converged: bool,
    /// Number of iterations performed.
    pub iterations_used: usize,
    /// Maximum relative change observed in the final iteration.
    pub final_max_relative_change: f64,
    /// Groups that were zeroed by the guard during the run.
    pub zeroed_groups: usize,
}
