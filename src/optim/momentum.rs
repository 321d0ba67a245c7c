//! # Momentum Buffers
//!
//! Persistent per-parameter state for SGD momentum. Buffers are keyed by
//! [`TensorId`], never by tensor contents, and keep their parameter's shape for
//! as long as the optimizer lives.

use std::collections::HashMap;

use crate::tensor::{ops, Tensor, TensorData, TensorError, TensorId};

/// Optimizer state: one momentum buffer per parameter that has taken at least
/// one step with non-zero momentum.
#[derive(Debug, Default)]
pub struct OptimizerState {
    momentum_buffers: HashMap<TensorId, Tensor>,
}

impl OptimizerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The momentum buffer of parameter `id`, if one has been created.
    pub fn momentum_buffer(&self, id: TensorId) -> Option<&Tensor> {
        self.momentum_buffers.get(&id)
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.momentum_buffers.contains_key(&id)
    }

    /// Number of parameters holding a buffer.
    pub fn len(&self) -> usize {
        self.momentum_buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.momentum_buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TensorId, &Tensor)> {
        self.momentum_buffers.iter().map(|(id, buf)| (*id, buf))
    }

    /// Drops every buffer; the next step with momentum starts fresh.
    pub fn clear(&mut self) {
        self.momentum_buffers.clear();
    }

    pub(crate) fn insert_buffer(&mut self, id: TensorId, buffer: Tensor) {
        self.momentum_buffers.insert(id, buffer);
    }
}

/// Folds `grad` into the momentum buffer of `key` and returns the direction
/// to step along.
///
/// The first call for a key stores a detached copy of `grad` as the buffer.
/// Later calls update it in place: `buf = buf * momentum + grad * (1 - dampening)`.
/// With `nesterov` the result is `grad + buf * momentum`, otherwise a copy of
/// `buf`; either way the caller may modify the result freely.
pub fn accumulate(
    state: &mut OptimizerState,
    key: TensorId,
    grad: &Tensor,
    momentum: TensorData,
    dampening: TensorData,
    nesterov: bool,
) -> Result<Tensor, TensorError> {
    let (combined, created) = momentum_step(
        state.momentum_buffer(key),
        grad,
        momentum,
        dampening,
        nesterov,
    )?;
    if let Some(buffer) = created {
        log::trace!(
            "created momentum buffer for parameter {key} (shape {:?})",
            buffer.shape()
        );
        state.insert_buffer(key, buffer);
    }
    Ok(combined)
}

/// One momentum update against an optional existing buffer.
///
/// Returns the combined direction and, when no buffer existed yet, the new
/// buffer for the caller to store. An existing buffer is updated in place.
pub(crate) fn momentum_step(
    existing: Option<&Tensor>,
    grad: &Tensor,
    momentum: TensorData,
    dampening: TensorData,
    nesterov: bool,
) -> Result<(Tensor, Option<Tensor>), TensorError> {
    match existing {
        Some(buffer) => {
            if buffer.shape() != grad.shape() {
                return Err(TensorError::ShapeMismatch {
                    expected: buffer.shape().to_vec(),
                    got: grad.shape().to_vec(),
                });
            }
            buffer.mul_scalar_(momentum);
            buffer.scaled_add_(1.0 - dampening, grad)?;
            Ok((combine(grad, buffer, momentum, nesterov)?, None))
        }
        None => {
            let buffer = grad.detach_copy();
            let combined = combine(grad, &buffer, momentum, nesterov)?;
            Ok((combined, Some(buffer)))
        }
    }
}

fn combine(
    grad: &Tensor,
    buffer: &Tensor,
    momentum: TensorData,
    nesterov: bool,
) -> Result<Tensor, TensorError> {
    if nesterov {
        ops::add(grad, &ops::mul_scalar(buffer, momentum))
    } else {
        Ok(buffer.detach_copy())
    }
}
