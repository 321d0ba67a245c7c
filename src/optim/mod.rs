//! # Optimization Algorithms (`optim`)
//!
//! SGD with momentum, weight decay and Adaptive Gradient Clipping, split into
//! its building blocks: per-unit norms and clipping ([`agc`]), persistent
//! momentum buffers ([`momentum`]), hyperparameter groups ([`param_group`])
//! and the optimizer that drives them ([`sgd_agc`]).

use crate::tensor::{TensorData, TensorError};

// --- Submodules ---
pub mod agc;
pub mod momentum;
pub mod param_group;
pub mod sgd_agc;

// Re-exports
pub use agc::{adaptive_clip, unitwise_norm};
pub use momentum::{accumulate, OptimizerState};
pub use param_group::{GroupOverrides, GroupSpec, Hyperparams, ParamGroup, Params};
pub use sgd_agc::SgdAgc;

// --- Error Handling ---

#[derive(thiserror::Error, Debug)]
pub enum OptimError {
    /// Invalid hyperparameter or parameter list, reported at construction.
    #[error("Invalid {field}: {reason}")]
    Config { field: &'static str, reason: String },
    /// AGC was asked to handle a tensor whose rank it has no unit axis for.
    #[error("Got a parameter with rank not in [1, 2, 3, 4]: shape {shape:?}")]
    Shape { shape: Vec<usize> },
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
}

impl OptimError {
    pub(crate) fn config(field: &'static str, reason: impl Into<String>) -> Self {
        OptimError::Config {
            field,
            reason: reason.into(),
        }
    }
}

/// Loss closure handed to [`Optimizer::step`].
///
/// It recomputes the loss and, as a side effect, populates the gradients of
/// the parameters being optimized.
pub type Closure<'a> = &'a mut dyn FnMut() -> Result<TensorData, TensorError>;

// --- Optimizer Trait ---

/// Base trait for optimizers.
pub trait Optimizer {
    /// Performs a single optimization step.
    ///
    /// If a closure is given it runs first, with gradient tracking enabled,
    /// and its loss is returned.
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<TensorData>, OptimError>;

    /// Zeros the gradients of all parameters managed by the optimizer.
    /// Momentum buffers are left alone.
    fn zero_grad(&mut self);

    /// Learning rate of the first parameter group.
    fn learning_rate(&self) -> TensorData;

    /// Sets the learning rate of every parameter group.
    fn set_learning_rate(&mut self, lr: TensorData) -> Result<(), OptimError>;
}
