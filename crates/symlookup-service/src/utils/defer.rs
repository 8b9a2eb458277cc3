/// Guard that runs a closure when dropped.
///
/// Use [`DeferGuard::disarm`] to skip the closure on the success path.
#[must_use]
pub struct DeferGuard<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> DeferGuard<F> {
    /// Drops the guard without running the closure.
    pub fn disarm(mut self) {
        self.0.take();
    }
}

impl<F: FnOnce()> Drop for DeferGuard<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}

/// Defers a closure, returning a `DeferGuard` that will
/// run it when dropped.
pub fn defer<F: FnOnce()>(f: F) -> DeferGuard<F> {
    DeferGuard(Some(f))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn test_runs_on_drop() {
        let ran = Cell::new(false);
        {
            let _guard = defer(|| ran.set(true));
            assert!(!ran.get());
        }
        assert!(ran.get());
    }

    #[test]
    fn test_disarm() {
        let ran = Cell::new(false);
        defer(|| ran.set(true)).disarm();
        assert!(!ran.get());
    }
}
