//! # Gradient Tracking Mode
//!
//! Thread-local switch deciding whether results of tensor operations record
//! that they depend on tensors requiring gradients. The optimizer runs its
//! update pass under [`no_grad`] and the loss closure under [`enable_grad`].

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Returns `true` if gradient tracking is enabled on the current thread.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|flag| flag.get())
}

/// Restores the previous tracking mode when dropped.
#[derive(Debug)]
#[must_use = "the previous mode is restored as soon as the guard is dropped"]
pub struct GradModeGuard {
    prev: bool,
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        GRAD_ENABLED.with(|flag| flag.set(self.prev));
    }
}

/// Sets the tracking mode for the current thread until the guard is dropped.
pub fn set_grad_enabled(enabled: bool) -> GradModeGuard {
    let prev = GRAD_ENABLED.with(|flag| flag.replace(enabled));
    GradModeGuard { prev }
}

/// Runs `f` with gradient tracking disabled.
pub fn no_grad<R>(f: impl FnOnce() -> R) -> R {
    let _guard = set_grad_enabled(false);
    f()
}

/// Runs `f` with gradient tracking enabled.
pub fn enable_grad<R>(f: impl FnOnce() -> R) -> R {
    let _guard = set_grad_enabled(true);
    f()
}
