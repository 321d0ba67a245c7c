//! # Parameter Groups
//!
//! A parameter group is a list of tensors sharing one hyperparameter bundle.
//! Optimizers are built from a flat parameter list (one group using the
//! defaults) or from explicit groups overriding any subset of the defaults.

use serde::{Deserialize, Serialize};

use super::agc::DEFAULT_EPS;
use super::OptimError;
use crate::tensor::{Tensor, TensorData};

// --- Hyperparameters ---

/// Fully resolved hyperparameters of one group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparams {
    pub lr: TensorData,
    pub momentum: TensorData,
    pub dampening: TensorData,
    pub weight_decay: TensorData,
    // Absent field reads as false in self-describing formats; bincode always
    // encodes it.
    #[serde(default)]
    pub nesterov: bool,
    /// AGC clip factor. `None` turns clipping off; `Some(0.0)` is a real factor.
    pub clipping: Option<TensorData>,
    /// Floor for the per-unit parameter norm used by AGC.
    pub eps: TensorData,
}

impl Hyperparams {
    /// Plain SGD at learning rate `lr`: no momentum, no weight decay, no clipping.
    pub fn new(lr: TensorData) -> Self {
        Hyperparams {
            lr,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
            clipping: None,
            eps: DEFAULT_EPS,
        }
    }

    pub fn with_momentum(mut self, momentum: TensorData) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_dampening(mut self, dampening: TensorData) -> Self {
        self.dampening = dampening;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: TensorData) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    pub fn with_clipping(mut self, clip_factor: TensorData) -> Self {
        self.clipping = Some(clip_factor);
        self
    }

    pub fn with_eps(mut self, eps: TensorData) -> Self {
        self.eps = eps;
        self
    }

    /// Checks every constraint; the error names the offending field.
    ///
    /// Comparisons are written so that NaN fails them.
    pub fn validate(&self) -> Result<(), OptimError> {
        if !(self.lr >= 0.0 && self.lr.is_finite()) {
            return Err(OptimError::config(
                "lr",
                format!("learning rate must be a finite value >= 0, got {}", self.lr),
            ));
        }
        if !(self.momentum >= 0.0) {
            return Err(OptimError::config(
                "momentum",
                format!("momentum must be >= 0, got {}", self.momentum),
            ));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(OptimError::config(
                "weight_decay",
                format!("weight_decay must be >= 0, got {}", self.weight_decay),
            ));
        }
        if self.nesterov && (self.momentum <= 0.0 || self.dampening != 0.0) {
            return Err(OptimError::config(
                "nesterov",
                "Nesterov momentum requires a momentum and zero dampening",
            ));
        }
        if let Some(clip) = self.clipping {
            if !(clip >= 0.0) {
                return Err(OptimError::config(
                    "clipping",
                    format!("clip factor must be >= 0, got {clip}"),
                ));
            }
        }
        if !(self.eps >= 0.0) {
            return Err(OptimError::config(
                "eps",
                format!("eps must be >= 0, got {}", self.eps),
            ));
        }
        Ok(())
    }
}

// --- Per-group overrides ---

/// Hyperparameters a group sets for itself; unset fields fall back to the
/// optimizer defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GroupOverrides {
    pub lr: Option<TensorData>,
    pub momentum: Option<TensorData>,
    pub dampening: Option<TensorData>,
    pub weight_decay: Option<TensorData>,
    pub nesterov: Option<bool>,
    /// `Some(None)` disables clipping for this group even if the defaults enable it.
    pub clipping: Option<Option<TensorData>>,
    pub eps: Option<TensorData>,
}

impl GroupOverrides {
    pub fn resolve(&self, defaults: &Hyperparams) -> Hyperparams {
        Hyperparams {
            lr: self.lr.unwrap_or(defaults.lr),
            momentum: self.momentum.unwrap_or(defaults.momentum),
            dampening: self.dampening.unwrap_or(defaults.dampening),
            weight_decay: self.weight_decay.unwrap_or(defaults.weight_decay),
            nesterov: self.nesterov.unwrap_or(defaults.nesterov),
            clipping: self.clipping.unwrap_or(defaults.clipping),
            eps: self.eps.unwrap_or(defaults.eps),
        }
    }
}

/// Parameters of one group plus the hyperparameters it overrides.
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub params: Vec<Tensor>,
    pub overrides: GroupOverrides,
}

impl GroupSpec {
    pub fn new<I>(params: I) -> Self
    where
        I: IntoIterator<Item = Tensor>,
    {
        GroupSpec {
            params: params.into_iter().collect(),
            overrides: GroupOverrides::default(),
        }
    }

    pub fn lr(mut self, lr: TensorData) -> Self {
        self.overrides.lr = Some(lr);
        self
    }

    pub fn momentum(mut self, momentum: TensorData) -> Self {
        self.overrides.momentum = Some(momentum);
        self
    }

    pub fn dampening(mut self, dampening: TensorData) -> Self {
        self.overrides.dampening = Some(dampening);
        self
    }

    pub fn weight_decay(mut self, weight_decay: TensorData) -> Self {
        self.overrides.weight_decay = Some(weight_decay);
        self
    }

    pub fn nesterov(mut self, nesterov: bool) -> Self {
        self.overrides.nesterov = Some(nesterov);
        self
    }

    pub fn clipping(mut self, clip_factor: TensorData) -> Self {
        self.overrides.clipping = Some(Some(clip_factor));
        self
    }

    /// Turns AGC off for this group, e.g. for a final classifier layer.
    pub fn without_clipping(mut self) -> Self {
        self.overrides.clipping = Some(None);
        self
    }

    pub fn eps(mut self, eps: TensorData) -> Self {
        self.overrides.eps = Some(eps);
        self
    }
}

/// What an optimizer is built from.
#[derive(Debug, Clone)]
pub enum Params {
    /// A single group that uses the defaults.
    Flat(Vec<Tensor>),
    Groups(Vec<GroupSpec>),
}

impl Params {
    pub(crate) fn into_specs(self) -> Vec<GroupSpec> {
        match self {
            Params::Flat(params) => vec![GroupSpec::new(params)],
            Params::Groups(groups) => groups,
        }
    }
}

impl From<Vec<Tensor>> for Params {
    fn from(params: Vec<Tensor>) -> Self {
        Params::Flat(params)
    }
}

impl From<Vec<GroupSpec>> for Params {
    fn from(groups: Vec<GroupSpec>) -> Self {
        Params::Groups(groups)
    }
}

impl From<GroupSpec> for Params {
    fn from(group: GroupSpec) -> Self {
        Params::Groups(vec![group])
    }
}

// --- Resolved group ---

/// A group as held by the optimizer.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    params: Vec<Tensor>,
    hyperparams: Hyperparams,
}

impl ParamGroup {
    /// Resolves `spec` against `defaults` and validates the result.
    pub fn resolve(spec: GroupSpec, defaults: &Hyperparams) -> Result<Self, OptimError> {
        let hyperparams = spec.overrides.resolve(defaults);
        hyperparams.validate()?;
        Ok(ParamGroup {
            params: spec.params,
            hyperparams,
        })
    }

    pub fn params(&self) -> &[Tensor] {
        &self.params
    }

    pub fn hyperparams(&self) -> &Hyperparams {
        &self.hyperparams
    }

    /// Replaces the hyperparameters after validating them.
    pub fn set_hyperparams(&mut self, hyperparams: Hyperparams) -> Result<(), OptimError> {
        hyperparams.validate()?;
        self.hyperparams = hyperparams;
        Ok(())
    }

    pub fn lr(&self) -> TensorData {
        self.hyperparams.lr
    }

    pub fn set_lr(&mut self, lr: TensorData) -> Result<(), OptimError> {
        self.set_hyperparams(Hyperparams {
            lr,
            ..self.hyperparams
        })
    }
}
