//! Training module for sequence models
//!
//! The [`Trainer`] collects documents, builds the parameter stores and
//! estimates the weights by maximum likelihood, optionally initialised by
//! pseudo-likelihood training.

mod params;
mod trainer;

// Re-export public types
pub use self::params::{Estimation, TrainParams};
pub use self::trainer::{TrainReport, Trainer};
