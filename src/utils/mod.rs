//! # Utility Functions (`utils`)
//!
//! Optimizer checkpointing and parallel helpers.

pub mod parallel;
pub mod serialization;

pub use serialization::{load, save, OptimizerStateDict, SerializationError};
