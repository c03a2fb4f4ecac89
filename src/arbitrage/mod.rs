//! Opportunity half of the pipeline.
//!
//! Delta detection, input sizing, cost/profit analysis, and mode-aware
//! execution.

pub mod analyzer;
pub mod detector;
pub mod executor;
pub mod optimizer;

pub use analyzer::OpportunityAnalyzer;
pub use detector::DeltaDetector;
pub use executor::{ExecutionMode, Executor};
pub use optimizer::{optimize, OptimizerConfig};
