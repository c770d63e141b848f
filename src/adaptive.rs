//! Live-updatable configuration cell.
//!
//! The limiter keeps its [`LimiterConfig`](crate::config::LimiterConfig) in a
//! [`DynamicConfig`] so route policies can change while requests are being checked.
//! The default backend is `ArcSwap` (lock-free reads); feature `adaptive-rwlock`
//! switches to a `RwLock`.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::{PoisonError, RwLock};

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared, atomically replaceable value. Clones observe the same cell.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(Arc::new(value))) }
        }
    }

    /// Snapshot of the current value. Later updates do not affect the snapshot.
    pub fn get(&self) -> Arc<T> {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.load_full()
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(value);
        }
    }

    /// Derive a new value from the current one and install it, returning what `f`
    /// produced besides the value. Concurrent updates are applied one after another.
    pub fn try_update<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: Fn(&T) -> Result<(T, R), E>,
    {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            loop {
                let current = self.inner.load_full();
                let (next, out) = f(&current)?;
                let prev = self.inner.compare_and_swap(&current, Arc::new(next));
                if Arc::ptr_eq(&*prev, &current) {
                    return Ok(out);
                }
            }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            let (next, out) = f(&guard)?;
            *guard = Arc::new(next);
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DynamicConfig;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_set() {
        let cell = DynamicConfig::new(1);
        let before = cell.get();
        cell.set(2);
        assert_eq!(*before, 1);
        assert_eq!(*cell.get(), 2);
    }

    #[test]
    fn try_update_returns_side_value_and_propagates_errors() {
        let cell = DynamicConfig::new(10_u32);
        let old = cell.try_update(|v| Ok::<_, ()>((v + 5, *v))).unwrap();
        assert_eq!(old, 10);
        assert_eq!(*cell.get(), 15);

        assert_eq!(cell.try_update(|_| Err::<(u32, ()), _>("nope")), Err("nope"));
        assert_eq!(*cell.get(), 15);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let cell = Arc::new(DynamicConfig::new(0_u64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        cell.try_update(|v| Ok::<_, ()>((v + 1, ()))).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*cell.get(), 800);
    }
}
