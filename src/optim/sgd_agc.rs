//! # SGD with Adaptive Gradient Clipping
//!
//! Stochastic Gradient Descent with momentum, dampening, weight decay,
//! Nesterov momentum and optional per-unit Adaptive Gradient Clipping.
//!
//! For every parameter with a gradient, each step computes
//!
//! ```text
//! d = agc(p, grad, clipping, eps)      (skipped when clipping is None)
//! d = d + weight_decay * p             (when weight_decay != 0)
//! d = momentum(d)                      (when momentum != 0)
//! p = p - lr * d
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use super::agc::adaptive_clip;
use super::momentum::{accumulate, momentum_step, OptimizerState};
use super::param_group::{GroupSpec, Hyperparams, ParamGroup, Params};
use super::{Closure, OptimError, Optimizer};
use crate::tensor::{enable_grad, no_grad, ops, Tensor, TensorData, TensorError, TensorId};
use crate::utils::parallel::{par_map_no_grad, partition_first_error};
use crate::utils::serialization::{
    GroupState, OptimizerStateDict, SerializableTensor, SerializationError,
};

/// SGD with momentum, weight decay and Adaptive Gradient Clipping.
///
/// The optimizer holds handles to the parameters it updates; the model keeps
/// its own handles to the same storage and sees every update in place.
#[derive(Debug)]
pub struct SgdAgc {
    param_groups: Vec<ParamGroup>,
    defaults: Hyperparams,
    state: OptimizerState,
}

impl SgdAgc {
    /// Creates a new optimizer.
    ///
    /// # Arguments
    /// * `params`: a flat list of parameters (one group using `defaults`) or a
    ///   list of [`GroupSpec`]s overriding any subset of `defaults`.
    /// * `defaults`: hyperparameters for everything a group does not override.
    ///
    /// Every resolved group is validated; no optimizer is produced if any
    /// hyperparameter is invalid.
    pub fn new(params: impl Into<Params>, defaults: Hyperparams) -> Result<Self, OptimError> {
        defaults.validate()?;
        let specs = params.into().into_specs();
        if specs.iter().all(|spec| spec.params.is_empty()) {
            return Err(OptimError::config(
                "params",
                "optimizer got an empty parameter list",
            ));
        }

        let mut optimizer = SgdAgc {
            param_groups: Vec::with_capacity(specs.len()),
            defaults,
            state: OptimizerState::new(),
        };
        for spec in specs {
            optimizer.add_param_group(spec)?;
        }
        Ok(optimizer)
    }

    /// Simplified constructor: plain SGD at learning rate `lr`.
    pub fn simple<I>(params: I, lr: TensorData) -> Result<Self, OptimError>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::new(params.into_iter().collect::<Vec<_>>(), Hyperparams::new(lr))
    }

    /// Appends a parameter group, resolving its overrides against the defaults.
    ///
    /// A tensor may belong to one group only, and must be a leaf.
    pub fn add_param_group(&mut self, spec: GroupSpec) -> Result<(), OptimError> {
        let mut seen: HashSet<TensorId> = self
            .param_groups
            .iter()
            .flat_map(|group| group.params())
            .map(Tensor::id)
            .collect();
        for param in &spec.params {
            if !param.is_leaf() {
                return Err(OptimError::config(
                    "params",
                    format!("can't optimize a non-leaf tensor ({})", param.id()),
                ));
            }
            if !seen.insert(param.id()) {
                return Err(OptimError::config(
                    "params",
                    format!(
                        "parameter {} appears in more than one parameter group",
                        param.id()
                    ),
                ));
            }
        }

        let group = ParamGroup::resolve(spec, &self.defaults)?;
        log::debug!(
            "added parameter group {} with {} parameters: {:?}",
            self.param_groups.len(),
            group.params().len(),
            group.hyperparams()
        );
        self.param_groups.push(group);
        Ok(())
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.param_groups
    }

    pub fn defaults(&self) -> &Hyperparams {
        &self.defaults
    }

    pub fn state(&self) -> &OptimizerState {
        &self.state
    }

    /// Sets the learning rate of one group.
    pub fn set_group_lr(&mut self, index: usize, lr: TensorData) -> Result<(), OptimError> {
        let group_count = self.param_groups.len();
        let group = self.param_groups.get_mut(index).ok_or_else(|| {
            OptimError::config(
                "param_groups",
                format!("no parameter group {index} (have {group_count})"),
            )
        })?;
        group.set_lr(lr)
    }

    /// Drops the gradients of all parameters, so the next step skips them
    /// until new gradients arrive.
    pub fn clear_grads(&mut self) {
        for param in self.param_groups.iter().flat_map(|group| group.params()) {
            param.clear_grad();
        }
    }

    /// Same contract as [`Optimizer::step`], but the per-parameter updates run
    /// in parallel once the closure has finished.
    ///
    /// Each parameter (and its buffer) is touched by exactly one task. If
    /// several parameters fail, the first failure in group/parameter order is
    /// returned; every other parameter has still been updated.
    pub fn par_step(
        &mut self,
        closure: Option<Closure<'_>>,
    ) -> Result<Option<TensorData>, OptimError> {
        let loss = run_closure(closure)?;

        let state = &self.state;
        let tasks: Vec<ParamTask> = self
            .param_groups
            .iter()
            .flat_map(|group| {
                let hyperparams = *group.hyperparams();
                group.params().iter().filter_map(move |param| {
                    param.grad().map(|grad| ParamTask {
                        param: param.clone(),
                        grad,
                        hyperparams,
                        buffer: state.momentum_buffer(param.id()).cloned(),
                    })
                })
            })
            .collect();
        let task_count = tasks.len();

        let (created, first_error) =
            partition_first_error(par_map_no_grad(tasks, ParamTask::run));
        for (id, buffer) in created.into_iter().flatten() {
            log::trace!("created momentum buffer for parameter {id}");
            self.state.insert_buffer(id, buffer);
        }
        log::debug!("parallel sgd_agc step over {task_count} parameters");

        match first_error {
            Some(err) => Err(err),
            None => Ok(loss),
        }
    }

    fn update_all(&mut self) -> Result<(), OptimError> {
        let mut updated = 0usize;
        let mut skipped = 0usize;
        for group in &self.param_groups {
            let hyperparams = group.hyperparams();
            for param in group.params() {
                let Some(grad) = param.grad() else {
                    skipped += 1;
                    continue;
                };

                let mut d = direction(param, &grad, hyperparams)?;
                if hyperparams.momentum != 0.0 {
                    d = accumulate(
                        &mut self.state,
                        param.id(),
                        &d,
                        hyperparams.momentum,
                        hyperparams.dampening,
                        hyperparams.nesterov,
                    )?;
                }
                param.scaled_add_(-hyperparams.lr, &d)?;
                updated += 1;
            }
        }
        log::debug!(
            "sgd_agc step over {} groups: {updated} parameters updated, {skipped} without gradient",
            self.param_groups.len()
        );
        Ok(())
    }

    // --- Checkpointing ---

    /// Snapshot of hyperparameters and momentum buffers.
    ///
    /// Parameters are numbered by position across all groups in order; buffers
    /// are keyed by that number.
    pub fn state_dict(&self) -> OptimizerStateDict {
        let mut groups = Vec::with_capacity(self.param_groups.len());
        let mut buffers = BTreeMap::new();
        let mut index = 0usize;

        for group in &self.param_groups {
            let mut params = Vec::with_capacity(group.params().len());
            for param in group.params() {
                if let Some(buffer) = self.state.momentum_buffer(param.id()) {
                    buffers.insert(index, SerializableTensor::from_tensor(buffer));
                }
                params.push(index);
                index += 1;
            }
            groups.push(GroupState {
                hyperparams: *group.hyperparams(),
                params,
            });
        }

        OptimizerStateDict { groups, buffers }
    }

    /// Restores a snapshot taken by [`SgdAgc::state_dict`].
    ///
    /// Everything is checked before anything is replaced, so a failed load
    /// leaves the optimizer as it was.
    pub fn load_state_dict(&mut self, dict: &OptimizerStateDict) -> Result<(), SerializationError> {
        if dict.groups.len() != self.param_groups.len() {
            return Err(SerializationError::GroupCountMismatch {
                expected: self.param_groups.len(),
                got: dict.groups.len(),
            });
        }

        let mut index_to_param: HashMap<usize, &Tensor> = HashMap::new();
        for (group_index, (group, saved)) in self.param_groups.iter().zip(&dict.groups).enumerate() {
            if group.params().len() != saved.params.len() {
                return Err(SerializationError::GroupSizeMismatch {
                    group: group_index,
                    expected: group.params().len(),
                    got: saved.params.len(),
                });
            }
            saved.hyperparams.validate()?;
            index_to_param.extend(saved.params.iter().copied().zip(group.params()));
        }

        let mut restored = Vec::with_capacity(dict.buffers.len());
        for (index, saved) in &dict.buffers {
            let param = index_to_param
                .get(index)
                .ok_or_else(|| SerializationError::UnexpectedKey(index.to_string()))?;
            let buffer = saved.to_tensor()?;
            if buffer.shape() != param.shape() {
                return Err(SerializationError::ShapeMismatch {
                    key: index.to_string(),
                    expected: param.shape().to_vec(),
                    got: buffer.shape().to_vec(),
                });
            }
            restored.push((param.id(), buffer));
        }

        for (group, saved) in self.param_groups.iter_mut().zip(&dict.groups) {
            group.set_hyperparams(saved.hyperparams)?;
        }
        self.state.clear();
        for (id, buffer) in restored {
            self.state.insert_buffer(id, buffer);
        }
        log::debug!(
            "loaded optimizer state: {} groups, {} momentum buffers",
            dict.groups.len(),
            self.state.len()
        );
        Ok(())
    }
}

impl Optimizer for SgdAgc {
    fn step(&mut self, closure: Option<Closure<'_>>) -> Result<Option<TensorData>, OptimError> {
        let loss = run_closure(closure)?;
        no_grad(|| self.update_all())?;
        Ok(loss)
    }

    fn zero_grad(&mut self) {
        for param in self.param_groups.iter().flat_map(|group| group.params()) {
            param.zero_grad();
        }
    }

    fn learning_rate(&self) -> TensorData {
        self.param_groups
            .first()
            .map_or(self.defaults.lr, ParamGroup::lr)
    }

    fn set_learning_rate(&mut self, lr: TensorData) -> Result<(), OptimError> {
        Hyperparams { lr, ..self.defaults }.validate()?;
        for group in &mut self.param_groups {
            group.set_lr(lr)?;
        }
        Ok(())
    }
}

/// Runs the loss closure, if any, with gradient tracking enabled.
fn run_closure(closure: Option<Closure<'_>>) -> Result<Option<TensorData>, OptimError> {
    match closure {
        Some(closure) => Ok(Some(enable_grad(closure)?)),
        None => Ok(None),
    }
}

/// Clipped, weight-decayed gradient of `param`, before momentum.
fn direction(param: &Tensor, grad: &Tensor, hyperparams: &Hyperparams) -> Result<Tensor, OptimError> {
    if grad.shape() != param.shape() {
        return Err(TensorError::ShapeMismatch {
            expected: param.shape().to_vec(),
            got: grad.shape().to_vec(),
        }
        .into());
    }
    let mut d = adaptive_clip(param, grad, hyperparams.clipping, hyperparams.eps)?;
    if hyperparams.weight_decay != 0.0 {
        d = ops::add(&d, &ops::mul_scalar(param, hyperparams.weight_decay))?;
    }
    Ok(d)
}

/// One parameter's share of a parallel step.
struct ParamTask {
    param: Tensor,
    grad: Tensor,
    hyperparams: Hyperparams,
    // Shares storage with the buffer held in `OptimizerState`.
    buffer: Option<Tensor>,
}

impl ParamTask {
    /// Updates the parameter; returns a newly created momentum buffer.
    fn run(self) -> Result<Option<(TensorId, Tensor)>, OptimError> {
        let h = &self.hyperparams;
        let mut d = direction(&self.param, &self.grad, h)?;
        let mut created = None;
        if h.momentum != 0.0 {
            let (combined, new_buffer) =
                momentum_step(self.buffer.as_ref(), &d, h.momentum, h.dampening, h.nesterov)?;
            d = combined;
            created = new_buffer.map(|buffer| (self.param.id(), buffer));
        }
        self.param.scaled_add_(-h.lr, &d)?;
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{is_grad_enabled, ones, zeros};

    fn scalar_param(value: TensorData) -> Tensor {
        Tensor::from_vec(vec![value], &[1], true).unwrap()
    }

    fn field_of(err: OptimError) -> &'static str {
        match err {
            OptimError::Config { field, .. } => field,
            other => panic!("expected a config error, got {other:?}"),
        }
    }

    #[test]
    fn plain_step_moves_against_gradient() {
        let p = scalar_param(2.0);
        p.set_grad(scalar_param(1.0).detach()).unwrap();
        let mut opt = SgdAgc::simple(vec![p.clone()], 0.1).unwrap();

        assert_eq!(opt.step(None).unwrap(), None);
        assert!((p.item().unwrap() - 1.9).abs() < 1e-6);
        assert!(opt.state().is_empty());
    }

    #[test]
    fn construction_rejects_bad_hyperparameters() {
        let params = || vec![ones(&[2], true)];
        assert_eq!(field_of(SgdAgc::new(params(), Hyperparams::new(-0.1)).unwrap_err()), "lr");
        assert_eq!(
            field_of(SgdAgc::new(params(), Hyperparams::new(0.1).with_momentum(-1.0)).unwrap_err()),
            "momentum"
        );
        assert_eq!(
            field_of(SgdAgc::new(params(), Hyperparams::new(0.1).with_nesterov(true)).unwrap_err()),
            "nesterov"
        );
        assert_eq!(
            field_of(
                SgdAgc::new(
                    vec![GroupSpec::new(params()).weight_decay(-1.0)],
                    Hyperparams::new(0.1)
                )
                .unwrap_err()
            ),
            "weight_decay"
        );
    }

    #[test]
    fn construction_rejects_empty_and_duplicate_params() {
        assert_eq!(
            field_of(SgdAgc::simple(Vec::new(), 0.1).unwrap_err()),
            "params"
        );

        let p = ones(&[2], true);
        let groups = vec![GroupSpec::new(vec![p.clone()]), GroupSpec::new(vec![p.clone()])];
        assert_eq!(
            field_of(SgdAgc::new(groups, Hyperparams::new(0.1)).unwrap_err()),
            "params"
        );
    }

    #[test]
    fn add_param_group_uses_defaults() {
        let mut opt = SgdAgc::new(
            vec![ones(&[2], true)],
            Hyperparams::new(0.1).with_momentum(0.9),
        )
        .unwrap();
        opt.add_param_group(GroupSpec::new(vec![ones(&[3], true)]).lr(0.01))
            .unwrap();

        let second = opt.param_groups()[1].hyperparams();
        assert_eq!(second.lr, 0.01);
        assert_eq!(second.momentum, 0.9);
    }

    #[test]
    fn parameter_without_gradient_is_untouched() {
        let with_grad = ones(&[2], true);
        let without_grad = ones(&[2], true);
        with_grad.set_grad(ones(&[2], false)).unwrap();

        let mut opt = SgdAgc::new(
            vec![with_grad.clone(), without_grad.clone()],
            Hyperparams::new(0.1).with_momentum(0.9).with_clipping(0.01),
        )
        .unwrap();
        opt.step(None).unwrap();

        assert_eq!(without_grad.to_vec(), vec![1.0, 1.0]);
        assert!(!opt.state().contains(without_grad.id()));
        assert!(opt.state().contains(with_grad.id()));
    }

    #[test]
    fn closure_runs_with_tracking_and_update_without() {
        let p = ones(&[2], true);
        let mut opt = SgdAgc::simple(vec![p.clone()], 0.5).unwrap();

        let mut seen_enabled = None;
        let loss = crate::tensor::no_grad(|| {
            opt.step(Some(&mut || -> Result<TensorData, TensorError> {
                seen_enabled = Some(is_grad_enabled());
                p.set_grad(ones(&[2], false))?;
                Ok(3.0)
            }))
        })
        .unwrap();

        assert_eq!(loss, Some(3.0));
        assert_eq!(seen_enabled, Some(true));
        assert_eq!(p.to_vec(), vec![0.5, 0.5]);
        assert!(is_grad_enabled());
    }

    #[test]
    fn closure_error_aborts_before_updates() {
        let p = ones(&[1], true);
        p.set_grad(ones(&[1], false)).unwrap();
        let mut opt = SgdAgc::simple(vec![p.clone()], 0.5).unwrap();

        let err = opt
            .step(Some(&mut || -> Result<TensorData, TensorError> {
                Err(TensorError::Generic("no data".into()))
            }))
            .unwrap_err();
        assert!(matches!(err, OptimError::Tensor(TensorError::Generic(_))));
        assert_eq!(p.to_vec(), vec![1.0]);
    }

    #[test]
    fn shape_error_propagates_after_earlier_params_update() {
        let matrix = ones(&[2, 2], true);
        matrix.set_grad(ones(&[2, 2], false)).unwrap();
        // Squeezes to rank 1, so AGC treats it as a vector.
        let squeezable = ones(&[1, 1, 1, 1, 3], true);
        squeezable.set_grad(ones(&[1, 1, 1, 1, 3], false)).unwrap();
        let rank5 = ones(&[2, 2, 1, 1, 2], true);
        rank5.set_grad(ones(&[2, 2, 1, 1, 2], false)).unwrap();

        let mut opt = SgdAgc::new(
            vec![matrix.clone(), squeezable.clone(), rank5.clone()],
            Hyperparams::new(1.0).with_momentum(0.9).with_clipping(1e6),
        )
        .unwrap();
        let err = opt.step(None).unwrap_err();

        assert!(matches!(err, OptimError::Shape { .. }));
        assert_eq!(matrix.to_vec(), vec![0.0; 4]);
        assert_eq!(squeezable.to_vec(), vec![0.0; 3]);
        assert_eq!(rank5.to_vec(), vec![1.0; 8]);
        assert!(!opt.state().contains(rank5.id()));
        assert_eq!(opt.state().len(), 2);
    }

    #[test]
    fn weight_decay_adds_scaled_parameter() {
        let p = Tensor::from_vec(vec![1.0, -2.0], &[2], true).unwrap();
        p.set_grad(zeros(&[2], false)).unwrap();
        let mut opt = SgdAgc::new(
            vec![p.clone()],
            Hyperparams::new(0.1).with_weight_decay(0.5),
        )
        .unwrap();
        opt.step(None).unwrap();
        let values = p.to_vec();
        assert!((values[0] - 0.95).abs() < 1e-6);
        assert!((values[1] + 1.9).abs() < 1e-6);
    }

    #[test]
    fn learning_rate_updates_every_group() {
        let mut opt = SgdAgc::new(
            vec![
                GroupSpec::new(vec![ones(&[1], true)]),
                GroupSpec::new(vec![ones(&[1], true)]).lr(1.0),
            ],
            Hyperparams::new(0.1),
        )
        .unwrap();
        assert_eq!(opt.learning_rate(), 0.1);

        opt.set_learning_rate(0.01).unwrap();
        assert!(opt.param_groups().iter().all(|g| g.lr() == 0.01));
        assert!(opt.set_learning_rate(-1.0).is_err());

        opt.set_group_lr(1, 0.2).unwrap();
        assert_eq!(opt.param_groups()[1].lr(), 0.2);
        assert_eq!(field_of(opt.set_group_lr(5, 0.2).unwrap_err()), "param_groups");
    }

    #[test]
    fn zero_grad_keeps_buffers_and_clear_grads_skips_next_step() {
        let p = ones(&[1], true);
        p.set_grad(ones(&[1], false)).unwrap();
        let mut opt = SgdAgc::new(vec![p.clone()], Hyperparams::new(0.1).with_momentum(0.9)).unwrap();
        opt.step(None).unwrap();

        opt.zero_grad();
        assert_eq!(p.grad().unwrap().to_vec(), vec![0.0]);
        assert!(opt.state().contains(p.id()));

        // A zero gradient still steps along the momentum buffer.
        let before = p.item().unwrap();
        opt.step(None).unwrap();
        assert!(p.item().unwrap() < before);

        opt.clear_grads();
        let before = p.item().unwrap();
        opt.step(None).unwrap();
        assert_eq!(p.item().unwrap(), before);
    }
}
