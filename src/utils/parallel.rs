//! # Parallelism Utilities (CPU Threading)
//!
//! Thin helpers over `rayon` for running independent per-parameter work on the
//! global thread pool.

use crate::tensor::no_grad;
use rayon::prelude::*;

/// Maps `f` over `items` in parallel; output order matches input order.
///
/// Gradient tracking is a per-thread setting, so each task disables it on the
/// worker it lands on.
pub fn par_map_no_grad<T, R, F>(items: Vec<T>, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync + Send,
{
    items.into_par_iter().map(|item| no_grad(|| f(item))).collect()
}

/// Splits results into successes and the first error, in input order.
pub fn partition_first_error<T, E>(results: Vec<Result<T, E>>) -> (Vec<T>, Option<E>) {
    let mut ok = Vec::with_capacity(results.len());
    let mut first_error = None;
    for result in results {
        match result {
            Ok(value) => ok.push(value),
            Err(err) => {
                first_error.get_or_insert(err);
            }
        }
    }
    (ok, first_error)
}
