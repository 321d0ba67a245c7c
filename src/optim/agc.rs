//! # Adaptive Gradient Clipping
//!
//! Clips each unit (output neuron / output channel) of a gradient so that its
//! L2 norm never exceeds `clip_factor` times the norm of the matching unit of
//! the parameter. See Brock et al., "High-Performance Large-Scale Image
//! Recognition Without Normalization" (2021).

use super::OptimError;
use crate::tensor::{ops, Tensor, TensorData, TensorError};

/// Default floor for the parameter norm.
pub const DEFAULT_EPS: TensorData = 1e-3;

/// Floor for the gradient norm in the rescale denominator.
pub const GRAD_NORM_FLOOR: TensorData = 1e-6;

const VECTOR_AXES: &[usize] = &[0];
const MATRIX_AXES: &[usize] = &[1];
const KERNEL_AXES: &[usize] = &[1, 2, 3];

/// Axes reduced by [`unitwise_norm`] for a tensor of this shape, and whether
/// they are kept as size-1 dimensions.
///
/// Vectors (and anything that squeezes down to one) are reduced along axis 0
/// and the axis is dropped; matrices and rank-3 weights reduce the input axis;
/// conv kernels (OIHW) reduce everything but `O`.
fn unit_reduction(shape: &[usize]) -> Result<(&'static [usize], bool), OptimError> {
    if ops::squeeze_shape(shape).len() <= 1 {
        return Ok((VECTOR_AXES, false));
    }
    match shape.len() {
        2 | 3 => Ok((MATRIX_AXES, true)),
        4 => Ok((KERNEL_AXES, true)),
        _ => Err(OptimError::Shape {
            shape: shape.to_vec(),
        }),
    }
}

/// L2 norm of `x` per unit, shaped to broadcast back against `x`.
///
/// For vectors the result is a rank-0 tensor holding the norm of the whole
/// vector. Note the rank check looks at the squeezed shape while the
/// reduction runs on the original one: `(1, 5)` reduces axis 0 and yields a
/// `(5,)` norm, i.e. one unit per element.
pub fn unitwise_norm(x: &Tensor) -> Result<Tensor, OptimError> {
    let squared = ops::square(x);
    if x.ndim() == 0 {
        return Ok(ops::sqrt(&squared));
    }
    let (axes, keepdim) = unit_reduction(x.shape())?;
    let summed = ops::sum_axes(&squared, axes, keepdim)?;
    Ok(ops::sqrt(&summed))
}

/// Returns `grad` with every unit whose norm exceeds
/// `max(‖param‖, eps) * clip_factor` rescaled down to exactly that norm.
///
/// `None` disables clipping and hands back `grad` itself. Inputs are never
/// mutated.
pub fn adaptive_clip(
    param: &Tensor,
    grad: &Tensor,
    clip_factor: Option<TensorData>,
    eps: TensorData,
) -> Result<Tensor, OptimError> {
    let Some(clip_factor) = clip_factor else {
        return Ok(grad.clone());
    };
    if param.shape() != grad.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: param.shape().to_vec(),
            got: grad.shape().to_vec(),
        }
        .into());
    }

    let param_norm = ops::maximum_scalar(&unitwise_norm(param)?, eps);
    let grad_norm = unitwise_norm(grad)?;
    let max_norm = ops::mul_scalar(&param_norm, clip_factor);

    let trigger = ops::gt(&grad_norm, &max_norm)?;
    let scale = (&max_norm / &ops::maximum_scalar(&grad_norm, GRAD_NORM_FLOOR))?;
    let rescaled = (grad * &scale)?;
    let clipped = ops::where_(&trigger, &rescaled, grad)?;

    log::trace!(
        "agc: {} of {} units clipped for parameter {} (shape {:?})",
        trigger.count(),
        grad_norm.size(),
        param.id(),
        param.shape()
    );
    Ok(clipped)
}
