//! County-level disaggregation of health-plan enrollment by iterative proportional fitting.
//!
//! Enrollment is observed per rating area, insurer, plan and metal tier. Two
//! independently sourced sets of county control totals exist: insurer × county
//! and metal tier × county. This crate
//!
//! - cleans and keys the raw tables (`records` module),
//! - seeds county cells by splitting each rating area across its counties
//!   through a swappable policy (`seeding` module),
//! - rescales the cells alternately to both sets of control totals until the
//!   relative change settles, one year at a time (`fitting` module), and
//! - reports how far the fitted cells sit from every target (`validation` module).
//!
//! The two control systems need not agree. When they conflict the solver
//! settles on the alternating-projection compromise and the validator shows
//! the residual gap; neither case is an error.
//!
//! # Quick start
//!
//! ```no_run
//! use countyfit::margins::MarginRow;
//! use countyfit::seeding::{CrosswalkEntry, EnrollmentObservation};
//! use countyfit::tier::MetalTier;
//! use countyfit::{AllocationOptions, AllocationProblem};
//!
//! let problem = AllocationProblem::builder()
//!     .observations(vec![EnrollmentObservation {
//!         year: 2020,
//!         rating_area: 1,
//!         insurer: "X".to_string(),
//!         plan: "PPO".to_string(),
//!         metal_tier: MetalTier::Bronze,
//!         enrollment: 1000.0,
//!     }])
//!     .crosswalk(vec![
//!         CrosswalkEntry::new("A", 1),
//!         CrosswalkEntry::new("B", 1),
//!     ])
//!     .insurer_targets(vec![
//!         MarginRow::new(2020, "X".to_string(), "A", 300.0),
//!         MarginRow::new(2020, "X".to_string(), "B", 500.0),
//!     ])
//!     .metal_targets(vec![
//!         MarginRow::new(2020, MetalTier::Bronze, "A", 350.0),
//!         MarginRow::new(2020, MetalTier::Bronze, "B", 450.0),
//!     ])
//!     .build()
//!     .expect("all tables supplied");
//!
//! let result = problem
//!     .solve(&AllocationOptions::default())
//!     .expect("well-formed input");
//! for report in &result.reports {
//!     println!(
//!         "{}: converged={} after {}",
//!         report.year, report.converged, report.iterations_used
//!     );
//! }
//! ```

pub mod allocation;
pub mod data;
pub mod error;
pub mod fitting;
pub mod margins;
pub mod options;
pub mod records;
pub mod seeding;
pub mod solving;
pub mod tier;
pub mod validation;

pub use allocation::{AllocationProblem, AllocationResult};
pub use error::{AllocError, Result};
pub use options::AllocationOptions;
pub use solving::{IpfOptions, SolverReport};
