use thiserror::Error;

use crate::data::Year;

/// Unified error type for `countyfit` operations.
///
/// Only structurally invalid input ends up here. Numerical degeneracies such as
/// vanishing group mass or non-convergence are absorbed by the solver and
/// surfaced through reports instead.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Raised when two parallel collections have incompatible lengths.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required length.
        expected: usize,
        /// The length that was actually supplied.
        found: usize,
    },

    /// Raised when an estimate, target or enrollment value is negative.
    #[error("{context} at index {index} must be non-negative, found {value}")]
    NegativeValue {
        context: &'static str,
        index: usize,
        value: f64,
    },

    /// Raised when an input value is NaN or infinite.
    #[error("{context} at index {index} must be finite, found {value}")]
    NonFiniteValue {
        context: &'static str,
        index: usize,
        value: f64,
    },

    /// Raised when a seeding weight falls outside `(0, 1]`.
    #[error("weight {weight} for county `{county}` in rating area {rating_area} is outside (0, 1]")]
    InvalidWeight {
        county: String,
        rating_area: u32,
        weight: f64,
    },

    /// Raised when a metal tier label in a control table cannot be parsed.
    #[error("unknown metal tier `{label}`")]
    UnknownMetalTier { label: String },

    /// Raised when solver or run options are out of range.
    #[error("invalid option `{option}`: {reason}")]
    InvalidOption {
        option: &'static str,
        reason: String,
    },

    /// Raised when a cell belongs to a different year than the partition it was placed in.
    #[error("cell at index {index} belongs to year {found}, expected partition year {expected}")]
    YearMismatch {
        index: usize,
        expected: Year,
        found: Year,
    },

    /// Raised when a margin index built for one year is applied to another.
    #[error("{margin} margins were built for year {found}, expected {expected}")]
    MarginYearMismatch {
        margin: &'static str,
        expected: Year,
        found: Year,
    },

    /// Raised when a required component has not been provided to a builder.
    #[error("{component} must be provided before solving the problem")]
    MissingComponent { component: &'static str },
}

impl AllocError {
    /// Helper to format a [`DimensionMismatch`](AllocError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for bubbling up missing component errors from builders.
    pub fn missing_component(component: &'static str) -> Self {
        Self::MissingComponent { component }
    }

    /// Helper for rejecting out-of-range options.
    pub fn invalid_option(option: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option,
            reason: reason.into(),
        }
    }
}

/// Rejects negative and non-finite quantities with a uniform error.
pub(crate) fn check_quantity(context: &'static str, index: usize, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(AllocError::NonFiniteValue {
            context,
            index,
            value,
        });
    }
    if value < 0.0 {
        return Err(AllocError::NegativeValue {
            context,
            index,
            value,
        });
    }
    Ok(())
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, AllocError>;
