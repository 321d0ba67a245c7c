//! # Tensor Module
//!
//! This module defines the core `Tensor` struct used by the optimizer:
//! shared CPU storage, a gradient slot, a stable identity and the numeric
//! operations the update rule is written in.

use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLockReadGuard, RwLockWriteGuard};

// --- Submodules ---
pub mod grad_mode;
pub mod ops;
pub mod storage;

// --- Re-exports ---
pub use grad_mode::{enable_grad, is_grad_enabled, no_grad, set_grad_enabled, GradModeGuard};
pub use storage::{CpuStorage, Device};

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Incompatible shapes for operation {op}: {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: String,
        shape1: Vec<usize>,
        shape2: Vec<usize>,
    },
    #[error("Invalid axis {axis} for tensor of rank {ndim}")]
    InvalidAxis { axis: usize, ndim: usize },
    #[error("Tensor does not require grad, cannot hold a gradient")]
    RequiresGradNotSet,
    #[error("Expected a single-element tensor, got shape {0:?}")]
    NotScalar(Vec<usize>),
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Element type of every tensor.
pub type TensorData = f32;

// --- Identity ---

static NEXT_TENSOR_ID: AtomicUsize = AtomicUsize::new(0);

/// Process-unique identity of a tensor's storage.
///
/// Every handle cloned from the same tensor reports the same id. Ids never
/// depend on the values held, which makes them usable as optimizer state keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(usize);

impl TensorId {
    fn next() -> Self {
        TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TensorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// # Tensor
///
/// A handle onto an `ndarray::ArrayD` plus gradient metadata.
/// Cloning the handle is cheap and shares storage, gradient slot and id.
#[derive(Clone, Debug)]
pub struct Tensor {
    id: TensorId,
    storage: CpuStorage,
    // Never changes after construction: in-place writes keep the shape.
    shape: Vec<usize>,
    device: Device,
    grad: Arc<Mutex<Option<Tensor>>>,
    requires_grad: bool,
    is_leaf: bool,
}

impl Tensor {
    /// Creates a new leaf Tensor from an ndarray::ArrayD.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        Self::with_storage(CpuStorage::new(data), requires_grad, true)
    }

    /// Creates a Tensor that is the result of an operation.
    pub(crate) fn from_op(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        Self::with_storage(CpuStorage::new(data), requires_grad, !requires_grad)
    }

    fn with_storage(storage: CpuStorage, requires_grad: bool, is_leaf: bool) -> Self {
        let shape = storage.read_lock().shape().to_vec();
        Tensor {
            id: TensorId::next(),
            storage,
            shape,
            device: Device::Cpu,
            grad: Arc::new(Mutex::new(None)),
            requires_grad,
            is_leaf,
        }
    }

    /// Builds a tensor of the given shape from row-major values.
    pub fn from_vec(
        values: Vec<TensorData>,
        shape: &[usize],
        requires_grad: bool,
    ) -> Result<Self, TensorError> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Tensor::new(data, requires_grad))
    }

    /// A rank-0 tensor holding `value`.
    pub fn scalar(value: TensorData, requires_grad: bool) -> Self {
        Tensor::new(ArrayD::from_elem(IxDyn(&[]), value), requires_grad)
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    pub fn is_leaf(&self) -> bool {
        self.is_leaf
    }

    /// Provides read-only access to the underlying data.
    pub fn data(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.storage.read_lock()
    }

    /// Provides mutable access to the underlying data.
    ///
    /// Writes are visible through every handle of this tensor. Callers must
    /// not change the array's shape.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.storage.write_lock()
    }

    /// Clones the underlying data into a new ArrayD.
    pub fn data_clone(&self) -> ArrayD<TensorData> {
        self.data().clone()
    }

    /// Flattened copy of the values in logical (row-major) order.
    pub fn to_vec(&self) -> Vec<TensorData> {
        self.data().iter().copied().collect()
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<TensorData, TensorError> {
        if self.size() != 1 {
            return Err(TensorError::NotScalar(self.shape.clone()));
        }
        self.data()
            .iter()
            .next()
            .copied()
            .ok_or_else(|| TensorError::NotScalar(self.shape.clone()))
    }

    /// Detaches the tensor from gradient tracking.
    /// Returns a new handle sharing the same data and identity.
    pub fn detach(&self) -> Self {
        Tensor {
            id: self.id,
            storage: self.storage.clone(),
            shape: self.shape.clone(),
            device: self.device,
            grad: Arc::new(Mutex::new(None)),
            requires_grad: false,
            is_leaf: true,
        }
    }

    /// Detached value-copy: fresh storage, fresh identity, no gradient.
    pub fn detach_copy(&self) -> Self {
        Self::with_storage(self.storage.duplicate(), false, true)
    }

    /// Returns `true` if `other` shares this tensor's storage.
    pub fn shares_storage_with(&self, other: &Tensor) -> bool {
        self.storage.same_allocation(&other.storage)
    }

    /// `self += alpha * other`, in place. Shapes must match exactly.
    pub fn scaled_add_(&self, alpha: TensorData, other: &Tensor) -> Result<(), TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        if self.shares_storage_with(other) {
            // Same lock on both sides; read first to avoid a self-deadlock.
            let snapshot = other.data_clone();
            self.data_mut().scaled_add(alpha, &snapshot);
        } else {
            let src = other.data();
            self.data_mut().scaled_add(alpha, &*src);
        }
        Ok(())
    }

    /// `self *= alpha`, in place.
    pub fn mul_scalar_(&self, alpha: TensorData) {
        self.data_mut().mapv_inplace(|v| v * alpha);
    }

    // --- Gradient slot ---

    fn grad_slot(&self) -> MutexGuard<'_, Option<Tensor>> {
        self.grad.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Retrieves the gradient tensor, if one has been populated.
    /// The returned handle shares data with the stored gradient.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_slot().clone()
    }

    pub fn has_grad(&self) -> bool {
        self.grad_slot().is_some()
    }

    /// Replaces the gradient. This is how an autodiff engine (or a test)
    /// hands gradients to the optimizer.
    pub fn set_grad(&self, grad_tensor: Tensor) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Err(TensorError::RequiresGradNotSet);
        }
        if grad_tensor.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: grad_tensor.shape().to_vec(),
            });
        }
        *self.grad_slot() = Some(grad_tensor.detach());
        Ok(())
    }

    /// Adds `incoming_grad` into the gradient, creating a zero gradient first
    /// if none exists.
    pub fn accumulate_grad(&self, incoming_grad: &Tensor) -> Result<(), TensorError> {
        if !self.requires_grad {
            return Err(TensorError::RequiresGradNotSet);
        }
        if self.shape() != incoming_grad.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: incoming_grad.shape().to_vec(),
            });
        }

        let mut slot = self.grad_slot();
        match slot.as_ref() {
            Some(existing) => existing.scaled_add_(1.0, incoming_grad)?,
            None => *slot = Some(incoming_grad.detach_copy()),
        }
        Ok(())
    }

    /// Zeroes the gradient in place if it exists.
    pub fn zero_grad(&self) {
        if let Some(grad) = self.grad_slot().as_ref() {
            grad.data_mut().fill(0.0);
        }
    }

    /// Drops the gradient entirely.
    pub fn clear_grad(&self) {
        self.grad_slot().take();
    }
}

// --- Helper functions ---

/// Helper to create a tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor filled with ones.
pub fn ones(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::ones(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor filled with `value`.
pub fn full(shape: &[usize], value: TensorData, requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::from_elem(IxDyn(shape), value), requires_grad)
}

/// Tensor with values drawn uniformly from `[low, high)`.
pub fn rand_uniform<R: Rng + ?Sized>(
    shape: &[usize],
    low: TensorData,
    high: TensorData,
    rng: &mut R,
    requires_grad: bool,
) -> Tensor {
    let range = Uniform::new(low, high);
    let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || range.sample(&mut *rng));
    Tensor::new(data, requires_grad)
}
