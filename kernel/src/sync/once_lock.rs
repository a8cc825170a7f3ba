//! Safe global state without `static mut`.
//!
//! `GlobalState<T>` is the one primitive this module still carries: a
//! `spin::Mutex<Option<T>>` with init-once semantics, used by subsystems
//! (`log_service`) that want "initialized once, then freely read/written
//! under a lock" without reaching for `spin::Once` (which hands back a `&T`,
//! not a lock guard, so it can't support `log_service`'s mutation-in-place
//! API).

use spin::Mutex;

/// Safe global state behind a mutex: `None` until `init` runs once.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Initialize the global state. Returns `Err(value)` if already
    /// initialized, handing the value back instead of silently dropping it.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut lock = self.inner.lock();
        if lock.is_some() {
            Err(value)
        } else {
            *lock = Some(value);
            Ok(())
        }
    }

    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        self.inner.lock().as_ref().map(f)
    }

    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: the inner spin::Mutex serializes every access to the Option<T>,
// so sharing a &GlobalState<T> across cores is sound whenever T: Send.
unsafe impl<T: Send> Send for GlobalState<T> {}
unsafe impl<T: Send> Sync for GlobalState<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_state_reads_as_none() {
        let state: GlobalState<i32> = GlobalState::new();
        assert!(state.with(|_| ()).is_none());
    }

    #[test]
    fn init_then_mutate_then_read() {
        let state = GlobalState::new();
        assert!(state.init(1i32).is_ok());
        state.with_mut(|v| *v += 41);
        assert_eq!(state.with(|v| *v), Some(42));
    }

    #[test]
    fn second_init_returns_the_value() {
        let state = GlobalState::new();
        assert!(state.init(1i32).is_ok());
        assert_eq!(state.init(2i32), Err(2i32));
        assert_eq!(state.with(|v| *v), Some(1));
    }
}
