//! # SGD-AGC
//!
//! Stochastic Gradient Descent with momentum, weight decay and Adaptive
//! Gradient Clipping (AGC), built on a small CPU tensor core.
//!
//! ```no_run
//! use sgd_agc::optim::{Hyperparams, Optimizer, SgdAgc};
//! use sgd_agc::tensor::ones;
//!
//! let weight = ones(&[4, 3], true);
//! let mut opt = SgdAgc::new(
//!     vec![weight.clone()],
//!     Hyperparams::new(0.1).with_momentum(0.9).with_clipping(0.01),
//! )?;
//! weight.set_grad(ones(&[4, 3], false))?;
//! opt.step(None)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod optim;
pub mod tensor;
pub mod utils;

pub use optim::{GroupSpec, Hyperparams, OptimError, Optimizer, SgdAgc};
pub use tensor::{Tensor, TensorError};
