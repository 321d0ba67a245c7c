//! # Tensor Storage
//!
//! Defines the underlying memory storage for Tensors.
//! Currently, this uses `ndarray::ArrayD` for CPU storage.

use ndarray::{ArrayD, IxDyn};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::TensorData;

// --- Concrete CPU Storage ---

/// Represents the CPU memory backing a Tensor.
///
/// The array lives behind `Arc<RwLock<...>>` so that every handle to the same
/// tensor (the model's copy, the optimizer's copy) observes in-place updates.
#[derive(Debug, Clone)]
pub struct CpuStorage {
    pub(crate) data: Arc<RwLock<ArrayD<TensorData>>>,
}

impl CpuStorage {
    /// Creates a new `CpuStorage` instance from an existing `ndarray::ArrayD`.
    pub fn new(array_data: ArrayD<TensorData>) -> Self {
        CpuStorage {
            data: Arc::new(RwLock::new(array_data)),
        }
    }

    /// Creates a new `CpuStorage` instance initialized with zeros.
    pub fn zeros(shape: &[usize]) -> Self {
        Self::new(ArrayD::zeros(IxDyn(shape)))
    }

    /// Provides read access to the underlying `ndarray`.
    ///
    /// A poisoned lock only means another thread panicked mid-update; the
    /// array itself is still structurally valid, so the guard is recovered.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Provides write access to the underlying `ndarray`.
    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Deep copy into fresh, unshared storage.
    pub fn duplicate(&self) -> Self {
        Self::new(self.read_lock().clone())
    }

    /// Returns `true` if both handles point at the same allocation.
    pub fn same_allocation(&self, other: &CpuStorage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

// --- Device Enum ---

/// Represents the device where the tensor data resides.
/// Currently only CPU is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}
