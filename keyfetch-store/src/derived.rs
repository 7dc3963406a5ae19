//! Derived view engine.
//!
//! A [`DerivedView`] is a node in a pull-based dependency graph. Each node
//! names its upstream [`VersionSource`]s and a pure compute closure. Reading
//! the view compares the upstream versions with the ones the memoized value
//! was computed from and recomputes only if they differ.
//!
//! # Invariants
//!
//! 1. A view recomputes at most once per distinct tuple of upstream versions,
//!    however often it is read.
//! 2. A view's own version advances only when a recomputation produces a
//!    value different from the previous one, so equal results do not ripple
//!    into downstream views.
//! 3. Views have no write path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use keyfetch_core::{KeyfetchResult, StoreError};

/// Anything a derived view can depend on.
///
/// The version must change whenever the observable value changes. It may
/// also change when the value did not (a spurious recompute), never the
/// other way around.
pub trait VersionSource: Send + Sync {
    fn version(&self) -> KeyfetchResult<u64>;
}

type ComputeFn<T> = Box<dyn Fn() -> KeyfetchResult<T> + Send + Sync>;

struct Memo<T> {
    inputs: Vec<u64>,
    value: T,
    version: u64,
}

/// Read-only value computed from upstream sources.
pub struct DerivedView<T> {
    sources: Vec<Arc<dyn VersionSource>>,
    compute: ComputeFn<T>,
    memo: Mutex<Option<Memo<T>>>,
    recomputes: AtomicU64,
}

impl<T> DerivedView<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a view over `sources`.
    ///
    /// `compute` must read only from the listed sources; anything else it
    /// reads is invisible to change detection.
    pub fn new<F>(sources: Vec<Arc<dyn VersionSource>>, compute: F) -> Self
    where
        F: Fn() -> KeyfetchResult<T> + Send + Sync + 'static,
    {
        Self {
            sources,
            compute: Box::new(compute),
            memo: Mutex::new(None),
            recomputes: AtomicU64::new(0),
        }
    }

    /// Current value, recomputed first if any upstream version moved.
    pub fn get(&self) -> KeyfetchResult<T> {
        self.with_memo(|m| m.value.clone())
    }

    /// How many times the compute closure has run.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes.load(Ordering::Relaxed)
    }

    /// Build a downstream view that applies `f` to this view's value.
    pub fn map<U, F>(self: &Arc<Self>, f: F) -> DerivedView<U>
    where
        U: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        let upstream = Arc::clone(self);
        DerivedView::new(vec![Arc::clone(self) as Arc<dyn VersionSource>], move || {
            upstream.get().map(|v| f(&v))
        })
    }

    fn input_versions(&self) -> KeyfetchResult<Vec<u64>> {
        self.sources.iter().map(|s| s.version()).collect()
    }

    /// Bring the memo up to date and read from it under the lock.
    ///
    /// Input versions are sampled before computing. If an upstream moves
    /// while the closure runs, the next read sees a mismatch and recomputes.
    fn with_memo<R>(&self, read: impl FnOnce(&Memo<T>) -> R) -> KeyfetchResult<R> {
        let inputs = self.input_versions()?;
        let mut slot = self
            .memo
            .lock()
            .map_err(|_| StoreError::LockPoisoned { store: "derived" })?;

        if let Some(m) = slot.as_ref().filter(|m| m.inputs == inputs) {
            return Ok(read(m));
        }

        let value = (self.compute)()?;
        self.recomputes.fetch_add(1, Ordering::Relaxed);
        let version = match slot.as_ref() {
            Some(m) if m.value == value => m.version,
            Some(m) => m.version + 1,
            None => 1,
        };
        let memo = slot.insert(Memo {
            inputs,
            value,
            version,
        });
        Ok(read(memo))
    }
}

impl<T> VersionSource for DerivedView<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    fn version(&self) -> KeyfetchResult<u64> {
        self.with_memo(|m| m.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    /// Hand-driven source for exercising the engine in isolation.
    #[derive(Default)]
    struct Cell {
        value: AtomicU64,
        version: AtomicU64,
    }

    impl Cell {
        fn set(&self, v: u64) {
            self.value.store(v, Ordering::SeqCst);
            self.version.fetch_add(1, Ordering::SeqCst);
        }

        fn get(&self) -> u64 {
            self.value.load(Ordering::SeqCst)
        }
    }

    impl VersionSource for Cell {
        fn version(&self) -> KeyfetchResult<u64> {
            Ok(self.version.load(Ordering::SeqCst))
        }
    }

    fn doubled(cell: &Arc<Cell>) -> DerivedView<u64> {
        let c = Arc::clone(cell);
        DerivedView::new(vec![Arc::clone(cell) as Arc<dyn VersionSource>], move || {
            Ok(c.get() * 2)
        })
    }

    #[test]
    fn test_computes_lazily() {
        let cell = Arc::new(Cell::default());
        let view = doubled(&cell);
        assert_eq!(view.recompute_count(), 0);
        cell.set(4);
        assert_eq!(view.recompute_count(), 0);
        assert_eq!(view.get().unwrap(), 8);
        assert_eq!(view.recompute_count(), 1);
    }

    #[test]
    fn test_version_read_computes_first_value() {
        let cell = Arc::new(Cell::default());
        cell.set(3);
        let view = doubled(&cell);
        assert_eq!(view.version().unwrap(), 1);
        assert_eq!(view.recompute_count(), 1);
        assert_eq!(view.get().unwrap(), 6);
        assert_eq!(view.recompute_count(), 1);
    }

    #[test]
    fn test_repeated_reads_do_not_recompute() {
        let cell = Arc::new(Cell::default());
        let view = doubled(&cell);
        for _ in 0..10 {
            assert_eq!(view.get().unwrap(), 0);
        }
        assert_eq!(view.recompute_count(), 1);

        cell.set(1);
        cell.set(2);
        for _ in 0..10 {
            assert_eq!(view.get().unwrap(), 4);
        }
        assert_eq!(view.recompute_count(), 2);
    }

    #[test]
    fn test_equal_result_does_not_ripple_downstream() {
        let cell = Arc::new(Cell::default());
        let c = Arc::clone(&cell);
        let parity = Arc::new(DerivedView::new(
            vec![Arc::clone(&cell) as Arc<dyn VersionSource>],
            move || Ok(c.get() % 2),
        ));
        let label = parity.map(|p| if *p == 0 { "even" } else { "odd" }.to_string());

        assert_eq!(label.get().unwrap(), "even");
        cell.set(2);
        assert_eq!(label.get().unwrap(), "even");
        assert_eq!(parity.recompute_count(), 2);
        assert_eq!(label.recompute_count(), 1);

        cell.set(3);
        assert_eq!(label.get().unwrap(), "odd");
        assert_eq!(label.recompute_count(), 2);
    }

    #[test]
    fn test_compute_error_is_not_memoized() {
        let cell = Arc::new(Cell::default());
        let c = Arc::clone(&cell);
        let view = DerivedView::new(
            vec![Arc::clone(&cell) as Arc<dyn VersionSource>],
            move || {
                if c.get() == 0 {
                    Err(StoreError::NoRuntime.into())
                } else {
                    Ok(c.get())
                }
            },
        );
        assert!(view.get().is_err());
        cell.set(5);
        assert_eq!(view.get().unwrap(), 5);
    }
}
