//! # Tensor Operations
//!
//! Elementwise arithmetic with NumPy-style broadcasting, axis reductions,
//! comparisons and masked selection. Every operation allocates its result;
//! nothing here mutates an input.

use super::{is_grad_enabled, Tensor, TensorData, TensorError};
use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};
use std::ops::{Add, Div, Mul, Sub};

// --- Helper Function for Result Setup ---

/// Wraps an operation's output. The result only tracks gradients when
/// tracking is enabled and at least one input requires them.
fn create_op_result(result_data: ArrayD<TensorData>, inputs: &[&Tensor]) -> Tensor {
    let requires_grad = is_grad_enabled() && inputs.iter().any(|t| t.requires_grad());
    Tensor::from_op(result_data, requires_grad)
}

// --- Broadcasting ---

/// Checks if tensor shapes can be broadcast together following NumPy broadcasting rules
pub fn can_broadcast(shape1: &[usize], shape2: &[usize]) -> bool {
    // Compare from the trailing dimension
    shape1
        .iter()
        .rev()
        .zip(shape2.iter().rev())
        .all(|(&s1, &s2)| s1 == s2 || s1 == 1 || s2 == 1)
}

/// Determines the output shape after broadcasting two shapes
pub fn broadcast_shapes(shape1: &[usize], shape2: &[usize]) -> Result<Vec<usize>, TensorError> {
    if !can_broadcast(shape1, shape2) {
        return Err(TensorError::IncompatibleShapes {
            op: "broadcast".to_string(),
            shape1: shape1.to_vec(),
            shape2: shape2.to_vec(),
        });
    }

    let max_dims = std::cmp::max(shape1.len(), shape2.len());
    let padded_shape1 = pad_shape_left(shape1, max_dims);
    let padded_shape2 = pad_shape_left(shape2, max_dims);

    // For each dimension, take the larger size (the other one is equal or 1)
    Ok(padded_shape1
        .iter()
        .zip(padded_shape2.iter())
        .map(|(&d1, &d2)| std::cmp::max(d1, d2))
        .collect())
}

/// Pads a shape with 1s on the left to match the target length
fn pad_shape_left(shape: &[usize], target_len: usize) -> Vec<usize> {
    if shape.len() >= target_len {
        return shape.to_vec();
    }
    let mut padded = vec![1; target_len - shape.len()];
    padded.extend_from_slice(shape);
    padded
}

/// Shape with every size-1 dimension removed.
pub fn squeeze_shape(shape: &[usize]) -> Vec<usize> {
    shape.iter().copied().filter(|&d| d != 1).collect()
}

fn incompatible(op: &str, shape1: &[usize], shape2: &[usize]) -> TensorError {
    TensorError::IncompatibleShapes {
        op: op.to_string(),
        shape1: shape1.to_vec(),
        shape2: shape2.to_vec(),
    }
}

/// Broadcasts a view to `shape`, reporting `op` on failure.
fn broadcast_view<'a>(
    view: &'a ArrayViewD<'_, TensorData>,
    shape: &[usize],
    op: &str,
) -> Result<ArrayViewD<'a, TensorData>, TensorError> {
    view.broadcast(IxDyn(shape))
        .ok_or_else(|| incompatible(op, view.shape(), shape))
}

/// Applies `f` elementwise over the broadcast of `a` and `b`.
fn zip_broadcast<R, F>(a: &Tensor, b: &Tensor, op: &str, f: F) -> Result<ArrayD<R>, TensorError>
where
    F: Fn(TensorData, TensorData) -> R,
{
    let out_shape = broadcast_shapes(a.shape(), b.shape())
        .map_err(|_| incompatible(op, a.shape(), b.shape()))?;

    let a_guard = a.data();
    let b_guard;
    // Both handles may point at the same lock; take it once.
    let b_view = if a.shares_storage_with(b) {
        a_guard.view()
    } else {
        b_guard = b.data();
        b_guard.view()
    };
    let a_view = a_guard.view();

    let av = broadcast_view(&a_view, &out_shape, op)?;
    let bv = broadcast_view(&b_view, &out_shape, op)?;
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

// --- Arithmetic Operations ---

/// Element-wise addition with broadcasting.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result_data = zip_broadcast(a, b, "add", |x, y| x + y)?;
    Ok(create_op_result(result_data, &[a, b]))
}

/// Element-wise subtraction (a - b) with broadcasting.
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result_data = zip_broadcast(a, b, "sub", |x, y| x - y)?;
    Ok(create_op_result(result_data, &[a, b]))
}

/// Element-wise multiplication with broadcasting.
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result_data = zip_broadcast(a, b, "mul", |x, y| x * y)?;
    Ok(create_op_result(result_data, &[a, b]))
}

/// Element-wise division (a / b) with broadcasting.
pub fn div(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let result_data = zip_broadcast(a, b, "div", |x, y| x / y)?;
    Ok(create_op_result(result_data, &[a, b]))
}

/// Multiply a tensor by a scalar.
pub fn mul_scalar(a: &Tensor, scalar: TensorData) -> Tensor {
    let result_data = a.data().mapv(|v| v * scalar);
    create_op_result(result_data, &[a])
}

/// Element-wise `max(a, scalar)`. NaN inputs stay NaN.
pub fn maximum_scalar(a: &Tensor, scalar: TensorData) -> Tensor {
    let result_data = a
        .data()
        .mapv(|v| if v.is_nan() || v > scalar { v } else { scalar });
    create_op_result(result_data, &[a])
}

pub fn square(a: &Tensor) -> Tensor {
    let result_data = a.data().mapv(|v| v * v);
    create_op_result(result_data, &[a])
}

pub fn sqrt(a: &Tensor) -> Tensor {
    let result_data = a.data().mapv(TensorData::sqrt);
    create_op_result(result_data, &[a])
}

// --- Reduction Operations ---

/// Sums all elements in the tensor. Returns a rank-0 tensor.
pub fn sum(a: &Tensor) -> Tensor {
    let result_scalar = a.data().sum();
    create_op_result(ArrayD::from_elem(IxDyn(&[]), result_scalar), &[a])
}

/// Sums over `axes`. With `keepdim` every reduced axis stays as size 1,
/// otherwise it is removed.
pub fn sum_axes(a: &Tensor, axes: &[usize], keepdim: bool) -> Result<Tensor, TensorError> {
    let ndim = a.ndim();
    let mut sorted = axes.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    if let Some(&axis) = sorted.iter().find(|&&axis| axis >= ndim) {
        return Err(TensorError::InvalidAxis { axis, ndim });
    }

    let mut reduced = a.data_clone();
    // Highest axis first so the lower indices stay valid.
    for &axis in sorted.iter().rev() {
        let summed = reduced.sum_axis(Axis(axis));
        reduced = if keepdim {
            summed.insert_axis(Axis(axis))
        } else {
            summed
        };
    }
    Ok(create_op_result(reduced, &[a]))
}

// --- Comparison & Selection ---

/// Boolean elementwise mask, produced by comparisons and consumed by [`where_`].
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    data: ArrayD<bool>,
}

impl Mask {
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// Number of `true` entries.
    pub fn count(&self) -> usize {
        self.data.iter().filter(|&&m| m).count()
    }

    pub fn to_vec(&self) -> Vec<bool> {
        self.data.iter().copied().collect()
    }
}

/// Element-wise `a > b` with broadcasting.
pub fn gt(a: &Tensor, b: &Tensor) -> Result<Mask, TensorError> {
    Ok(Mask {
        data: zip_broadcast(a, b, "gt", |x, y| x > y)?,
    })
}

/// Element-wise select: `on_true` where `mask` holds, else `on_false`.
/// All three operands are broadcast to a common shape.
pub fn where_(mask: &Mask, on_true: &Tensor, on_false: &Tensor) -> Result<Tensor, TensorError> {
    let value_shape = broadcast_shapes(on_true.shape(), on_false.shape())
        .map_err(|_| incompatible("where", on_true.shape(), on_false.shape()))?;
    let out_shape = broadcast_shapes(mask.shape(), &value_shape)
        .map_err(|_| incompatible("where", mask.shape(), &value_shape))?;

    let mask_view = mask
        .data
        .broadcast(IxDyn(&out_shape))
        .ok_or_else(|| incompatible("where", mask.shape(), &out_shape))?;

    let t_guard = on_true.data();
    let f_guard;
    let f_view = if on_true.shares_storage_with(on_false) {
        t_guard.view()
    } else {
        f_guard = on_false.data();
        f_guard.view()
    };
    let t_view = t_guard.view();
    let tv = broadcast_view(&t_view, &out_shape, "where")?;
    let fv = broadcast_view(&f_view, &out_shape, "where")?;

    let result_data = Zip::from(&mask_view)
        .and(&tv)
        .and(&fv)
        .map_collect(|&m, &x, &y| if m { x } else { y });
    Ok(create_op_result(result_data, &[on_true, on_false]))
}

// --- Operator overloading ---

impl Add<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;

    fn add(self, other: &Tensor) -> Self::Output {
        add(self, other)
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;

    fn sub(self, other: &Tensor) -> Self::Output {
        sub(self, other)
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;

    fn mul(self, other: &Tensor) -> Self::Output {
        mul(self, other)
    }
}

impl Div<&Tensor> for &Tensor {
    type Output = Result<Tensor, TensorError>;

    fn div(self, other: &Tensor) -> Self::Output {
        div(self, other)
    }
}
