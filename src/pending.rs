use std::time::Duration;

use roaring::RoaringBitmap;

/// How long a front-end waits after the first pending route change before
/// the host should trigger a rebuild pass.
pub(crate) const UPDATE_DELAY: Duration = Duration::from_millis(200);

//------------ PendingSet ----------------------------------------------------

/// The set of lookup-table chunks dirtied by recent route changes.
///
/// One bit per chunk, plus the scalar bounds of the dirty span and a count
/// of the mutations that produced it. The library owns no timer: a host
/// arms one for [`UPDATE_DELAY`] whenever `updates() > 0` and calls the
/// engine's `apply_pending` when it fires. Mutations arriving before
/// `set_initialized` accumulate here and are applied by the engine's
/// `initialize`.
#[derive(Debug)]
pub(crate) struct PendingSet {
    dirty: RoaringBitmap,
    start: u32,
    end: u32,
    nchunks: u32,
    updates: usize,
    initialized: bool,
}

impl PendingSet {
    pub(crate) fn new(nchunks: u32) -> Self {
        PendingSet {
            dirty: RoaringBitmap::new(),
            start: nchunks,
            end: 0,
            nchunks,
            updates: 0,
            initialized: false,
        }
    }

    /// Mark an inclusive chunk range dirty.
    pub(crate) fn mark(&mut self, start: u32, end: u32) {
        debug_assert!(start <= end && end < self.nchunks);
        self.dirty.insert_range(start..=end);
        if start < self.start {
            self.start = start;
        }
        if end > self.end {
            self.end = end;
        }
        self.updates += 1;
    }

    pub(crate) fn updates(&self) -> usize {
        self.updates
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.dirty.is_empty()
    }

    pub(crate) fn initialized(&self) -> bool {
        self.initialized
    }

    pub(crate) fn set_initialized(&mut self) {
        self.initialized = true;
    }

    /// Take the dirty set for an apply pass, resetting the bounds and the
    /// mutation count. Iterates in ascending chunk order.
    pub(crate) fn take(&mut self) -> RoaringBitmap {
        self.start = self.nchunks;
        self.end = 0;
        self.updates = 0;
        std::mem::take(&mut self.dirty)
    }

    /// Put chunks back after a failed apply pass so a later pass retries
    /// them.
    pub(crate) fn put_back<I: IntoIterator<Item = u32>>(&mut self, chunks: I) {
        for c in chunks {
            self.dirty.insert(c);
            if c < self.start {
                self.start = c;
            }
            if c > self.end {
                self.end = c;
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.dirty.clear();
        self.start = self.nchunks;
        self.end = 0;
        self.updates = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_take() {
        let mut p = PendingSet::new(1 << 20);
        assert!(p.is_empty());
        p.mark(5, 9);
        p.mark(3, 3);
        assert_eq!(p.updates(), 2);
        let taken = p.take();
        assert_eq!(taken.iter().collect::<Vec<_>>(), vec![3, 5, 6, 7, 8, 9]);
        assert!(p.is_empty());
        assert_eq!(p.updates(), 0);
    }

    #[test]
    fn test_put_back() {
        let mut p = PendingSet::new(64);
        p.mark(1, 2);
        let taken = p.take();
        p.put_back(taken.iter().skip(1));
        assert_eq!(p.take().iter().collect::<Vec<_>>(), vec![2]);
    }
}
