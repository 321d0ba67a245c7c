//! # Optimizer Checkpoints
//!
//! Saving and loading optimizer state: per-group hyperparameters and momentum
//! buffers. Uses `serde` for serialization and `bincode` as the binary format.
//!
//! Parameters themselves are not stored. A checkpoint refers to them by
//! position (counting across all groups in order), so it can be restored into
//! an optimizer built over the same parameter list in a new process.

use crate::optim::{Hyperparams, OptimError, SgdAgc};
use crate::tensor::{Tensor, TensorData};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Tensor shape mismatch during loading: key '{key}', expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Unexpected key in state dict during loading: '{0}'")]
    UnexpectedKey(String),
    #[error("Corrupt tensor in state dict: shape {shape:?} does not hold {len} values")]
    CorruptTensor { shape: Vec<usize>, len: usize },
    #[error("State dict has {got} parameter groups, optimizer has {expected}")]
    GroupCountMismatch { expected: usize, got: usize },
    #[error("Parameter group {group} has {got} parameters in state dict, optimizer has {expected}")]
    GroupSizeMismatch {
        group: usize,
        expected: usize,
        got: usize,
    },
    #[error("Invalid hyperparameters in state dict: {0}")]
    Config(#[from] OptimError),
}

// --- Serializable Tensor Wrapper ---

/// Shape plus flat row-major data.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SerializableTensor {
    pub shape: Vec<usize>,
    pub data: Vec<TensorData>,
}

impl SerializableTensor {
    pub fn from_tensor(tensor: &Tensor) -> Self {
        SerializableTensor {
            shape: tensor.shape().to_vec(),
            // `iter()` walks in logical order whatever the memory layout.
            data: tensor.data().iter().copied().collect(),
        }
    }

    /// Rebuilds a fresh tensor that does not require grad.
    pub fn to_tensor(&self) -> Result<Tensor, SerializationError> {
        let data = ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&self.shape), self.data.clone())
            .map_err(|_| SerializationError::CorruptTensor {
                shape: self.shape.clone(),
                len: self.data.len(),
            })?;
        Ok(Tensor::new(data, false))
    }
}

// --- State Dictionary Types ---

/// Hyperparameters of one group and the positional indices of its parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupState {
    pub hyperparams: Hyperparams,
    pub params: Vec<usize>,
}

/// Everything needed to resume optimization.
///
/// `buffers` uses a `BTreeMap` so the encoding is deterministic.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct OptimizerStateDict {
    pub groups: Vec<GroupState>,
    pub buffers: BTreeMap<usize, SerializableTensor>,
}

impl OptimizerStateDict {
    pub fn write_to<W: Write>(&self, writer: W) -> Result<(), SerializationError> {
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, SerializationError> {
        Ok(bincode::deserialize_from(reader)?)
    }
}

// --- Save / Load ---

/// Saves the optimizer's state dictionary to a file.
pub fn save<P: AsRef<Path>>(optimizer: &SgdAgc, path: P) -> Result<(), SerializationError> {
    let state_dict = optimizer.state_dict();
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    state_dict.write_to(&mut writer)?;
    writer.flush()?;
    log::debug!(
        "saved optimizer state ({} groups, {} buffers) to {}",
        state_dict.groups.len(),
        state_dict.buffers.len(),
        path.as_ref().display()
    );
    Ok(())
}

/// Loads a state dictionary from a file into `optimizer`.
///
/// The optimizer must have been built over the same parameter groups, with
/// the same sizes and parameter shapes, as the one that was saved.
pub fn load<P: AsRef<Path>>(optimizer: &mut SgdAgc, path: P) -> Result<(), SerializationError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    let state_dict = OptimizerStateDict::read_from(reader)?;
    optimizer.load_state_dict(&state_dict)
}
