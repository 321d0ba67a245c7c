use rand::rngs::StdRng;
use rand::SeedableRng;

use sgd_agc::optim::{GroupSpec, Hyperparams, OptimError, Optimizer, SgdAgc};
use sgd_agc::tensor::{is_grad_enabled, ones, ops, rand_uniform, Tensor, TensorError};
use sgd_agc::utils::{load, save};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Sets `grad = p - target` for every pair and returns `0.5 * sum((p - target)^2)`.
fn quadratic_loss(pairs: &[(Tensor, Tensor)]) -> Result<f32, TensorError> {
    let mut loss = 0.0;
    for (param, target) in pairs {
        let diff = ops::sub(param, target)?;
        loss += 0.5 * ops::sum(&ops::square(&diff)).item()?;
        param.set_grad(diff.detach())?;
    }
    Ok(loss)
}

/// A conv kernel, a matrix and a bias, each paired with a random target.
fn problem(seed: u64) -> Vec<(Tensor, Tensor)> {
    let mut rng = StdRng::seed_from_u64(seed);
    [vec![4, 3, 2, 2], vec![5, 3], vec![5]]
        .into_iter()
        .map(|shape| {
            let param = rand_uniform(&shape, -1.0, 1.0, &mut rng, true);
            let target = rand_uniform(&shape, -1.0, 1.0, &mut rng, false);
            (param, target)
        })
        .collect()
}

fn full_hyperparams() -> Hyperparams {
    Hyperparams::new(0.05)
        .with_momentum(0.9)
        .with_weight_decay(1e-4)
        .with_nesterov(true)
        .with_clipping(0.05)
}

fn optimizer_for(pairs: &[(Tensor, Tensor)]) -> SgdAgc {
    let params: Vec<Tensor> = pairs.iter().map(|(p, _)| p.clone()).collect();
    SgdAgc::new(
        vec![
            GroupSpec::new(params[..2].to_vec()),
            GroupSpec::new(params[2..].to_vec()).weight_decay(0.0).without_clipping(),
        ],
        full_hyperparams(),
    )
    .unwrap()
}

fn snapshot(pairs: &[(Tensor, Tensor)]) -> Vec<Vec<f32>> {
    pairs.iter().map(|(p, _)| p.to_vec()).collect()
}

#[test]
fn scalar_parameter_takes_one_plain_step() {
    init_logging();
    let p = Tensor::scalar(2.0, true);
    p.set_grad(Tensor::scalar(1.0, false)).unwrap();
    let mut opt = SgdAgc::simple(vec![p.clone()], 0.1).unwrap();

    opt.step(None).unwrap();
    assert!((p.item().unwrap() - 1.9).abs() < 1e-6);
}

#[test]
fn invalid_configurations_fail_construction() {
    let params = || vec![ones(&[3], true)];
    for defaults in [
        Hyperparams::new(-0.1),
        Hyperparams::new(0.1).with_momentum(-1.0),
        Hyperparams::new(0.1).with_nesterov(true),
        Hyperparams::new(0.1).with_momentum(0.9).with_nesterov(true).with_dampening(0.5),
    ] {
        let err = SgdAgc::new(params(), defaults).unwrap_err();
        assert!(matches!(err, OptimError::Config { .. }), "{err}");
    }
}

#[test]
fn closure_driven_training_reduces_loss() {
    init_logging();
    let pairs = problem(1);
    let mut opt = optimizer_for(&pairs);

    let first = opt.step(Some(&mut || quadratic_loss(&pairs))).unwrap().unwrap();
    let mut last = first;
    for _ in 0..300 {
        opt.zero_grad();
        last = opt.step(Some(&mut || quadratic_loss(&pairs))).unwrap().unwrap();
    }

    assert!(last < first * 0.1, "loss went from {first} to {last}");
    assert_eq!(opt.state().len(), 3);
}

#[test]
fn closure_sees_tracking_enabled_and_mode_is_restored() {
    let p = ones(&[2], true);
    let mut opt = SgdAgc::simple(vec![p.clone()], 0.1).unwrap();

    let _guard = sgd_agc::tensor::set_grad_enabled(false);
    let mut inside = None;
    opt.step(Some(&mut || -> Result<f32, TensorError> {
        inside = Some(is_grad_enabled());
        p.set_grad(ones(&[2], false))?;
        Ok(0.0)
    }))
    .unwrap();

    assert_eq!(inside, Some(true));
    assert!(!is_grad_enabled());
}

#[test]
fn parallel_step_matches_sequential_step() {
    init_logging();
    let sequential = problem(7);
    let parallel = problem(7);
    let mut seq_opt = optimizer_for(&sequential);
    let mut par_opt = optimizer_for(&parallel);

    for _ in 0..5 {
        let seq_loss = seq_opt
            .step(Some(&mut || quadratic_loss(&sequential)))
            .unwrap();
        let par_loss = par_opt
            .par_step(Some(&mut || quadratic_loss(&parallel)))
            .unwrap();
        assert_eq!(seq_loss, par_loss);
    }

    assert_eq!(snapshot(&sequential), snapshot(&parallel));
    assert_eq!(seq_opt.state().len(), par_opt.state().len());
}

#[test]
fn parallel_step_reports_first_failure_and_updates_the_rest() {
    let good = ones(&[3, 2], true);
    let rank5_a = ones(&[2, 2, 2, 2, 2], true);
    let rank5_b = ones(&[3, 2, 2, 2, 2], true);
    for p in [&good, &rank5_a, &rank5_b] {
        p.set_grad(ones(p.shape(), false)).unwrap();
    }
    let mut opt = SgdAgc::new(
        vec![rank5_a.clone(), good.clone(), rank5_b.clone()],
        Hyperparams::new(0.5).with_clipping(1e6),
    )
    .unwrap();

    let err = opt.par_step(None).unwrap_err();
    assert!(matches!(err, OptimError::Shape { ref shape } if shape[0] == 2));
    assert_eq!(good.to_vec(), vec![0.5; 6]);
    assert_eq!(rank5_a.to_vec(), vec![1.0; 32]);
}

#[test]
fn checkpoint_reproduces_next_step() {
    init_logging();
    let original = problem(42);
    let mut opt = optimizer_for(&original);
    for _ in 0..3 {
        opt.step(Some(&mut || quadratic_loss(&original))).unwrap();
    }

    let path = std::env::temp_dir().join(format!("sgd_agc_checkpoint_{}.bin", std::process::id()));
    save(&opt, &path).unwrap();

    // A second run starting from the same parameter values.
    let resumed = problem(42);
    for ((dst, _), (src, _)) in resumed.iter().zip(&original) {
        dst.data_mut().assign(&src.data_clone());
    }
    let mut resumed_opt = SgdAgc::new(
        vec![
            GroupSpec::new(vec![resumed[0].0.clone(), resumed[1].0.clone()]),
            GroupSpec::new(vec![resumed[2].0.clone()]),
        ],
        Hyperparams::new(1.0),
    )
    .unwrap();
    load(&mut resumed_opt, &path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(resumed_opt.param_groups()[0].hyperparams(), opt.param_groups()[0].hyperparams());
    assert_eq!(resumed_opt.state().len(), 3);

    opt.step(Some(&mut || quadratic_loss(&original))).unwrap();
    resumed_opt
        .step(Some(&mut || quadratic_loss(&resumed)))
        .unwrap();
    assert_eq!(snapshot(&original), snapshot(&resumed));
}

#[test]
fn parameters_without_gradients_are_left_alone() {
    let pairs = problem(3);
    let mut opt = optimizer_for(&pairs);
    let (frozen, _) = &pairs[1];
    let before = frozen.to_vec();

    quadratic_loss(&pairs).unwrap();
    frozen.clear_grad();
    opt.step(None).unwrap();

    assert_eq!(frozen.to_vec(), before);
    assert!(!opt.state().contains(frozen.id()));
    assert_eq!(opt.state().len(), 2);
}
