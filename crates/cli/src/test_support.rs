//! Process-environment helpers for config tests.

use std::sync::{Mutex, MutexGuard, OnceLock};

fn env_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs `body` while no other test touches the environment.
///
/// A panicking test poisons the lock; the next test still gets it.
pub(crate) fn with_locked_env<R>(body: impl FnOnce() -> R) -> R {
    let _guard = env_lock();
    body()
}

/// Sets `key`. Only call inside [`with_locked_env`].
pub(crate) fn set_env_var(key: &str, value: &str) {
    // SAFETY: callers hold the environment lock, so no other test thread
    // reads or writes the environment concurrently.
    unsafe { std::env::set_var(key, value) }
}

/// Removes `key`. Only call inside [`with_locked_env`].
pub(crate) fn remove_env_var(key: &str) {
    // SAFETY: see `set_env_var`.
    unsafe { std::env::remove_var(key) }
}
