//! Pooled, epoch-stamped visited sets for graph traversal.
//!
//! A traversal needs an O(1) "have I seen this node" check. Allocating a
//! fresh bitmap per query would dominate small searches, and zeroing one is
//! O(n); instead each set carries an epoch counter, `reset` bumps the
//! epoch, and "visited" means "stamped with the current epoch". A full
//! memset happens only when the epoch wraps.
//!
//! The pool bounds allocations to the number of concurrent traversals
//! actually observed: sets are borrowed for the lifetime of one traversal
//! and returned on drop.

use parking_lot::Mutex;

/// Epoch-stamped visited set.
#[derive(Debug)]
pub struct VisitedSet {
    stamps: Vec<u16>,
    epoch: u16,
}

impl VisitedSet {
    /// Create a set covering ids `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        Self { stamps: vec![0; capacity], epoch: 1 }
    }

    /// Invalidate all marks. O(1) except when the epoch wraps to zero,
    /// which triggers a memset and skips the zero epoch.
    pub fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        if self.epoch == 0 {
            self.stamps.fill(0);
            self.epoch = 1;
        }
    }

    /// Grow to cover at least `capacity` ids.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.stamps.len() {
            self.stamps.resize(capacity, 0);
        }
    }

    /// Mark `id` as visited. Returns `true` if it was newly inserted.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        let stamp = &mut self.stamps[id as usize];
        if *stamp == self.epoch {
            false
        } else {
            *stamp = self.epoch;
            true
        }
    }

    /// Whether `id` has been marked since the last reset.
    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.stamps[id as usize] == self.epoch
    }
}

/// A grow-only pool of visited sets behind a single mutex.
#[derive(Debug)]
pub struct VisitedPool {
    free: Mutex<Vec<VisitedSet>>,
}

impl VisitedPool {
    pub fn new() -> Self {
        Self { free: Mutex::new(Vec::new()) }
    }

    /// Borrow a set sized for at least `capacity` ids. The set is reset and
    /// returned to the pool when the handle drops.
    pub fn acquire(&self, capacity: usize) -> VisitedHandle<'_> {
        let mut set = {
            let mut free = self.free.lock();
            free.pop().unwrap_or_else(|| VisitedSet::new(capacity))
        };
        set.ensure_capacity(capacity);
        set.reset();
        VisitedHandle { pool: self, set: Some(set) }
    }
}

impl Default for VisitedPool {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle to a pooled [`VisitedSet`].
pub struct VisitedHandle<'a> {
    pool: &'a VisitedPool,
    set: Option<VisitedSet>,
}

impl std::ops::Deref for VisitedHandle<'_> {
    type Target = VisitedSet;

    fn deref(&self) -> &VisitedSet {
        self.set.as_ref().expect("visited set present until drop")
    }
}

impl std::ops::DerefMut for VisitedHandle<'_> {
    fn deref_mut(&mut self) -> &mut VisitedSet {
        self.set.as_mut().expect("visited set present until drop")
    }
}

impl Drop for VisitedHandle<'_> {
    fn drop(&mut self) {
        if let Some(set) = self.set.take() {
            self.pool.free.lock().push(set);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_reset() {
        let mut set = VisitedSet::new(100);
        assert!(set.insert(0));
        assert!(!set.insert(0));
        assert!(set.insert(50));
        assert!(set.contains(50));

        set.reset();
        assert!(!set.contains(0));
        assert!(set.insert(0));
    }

    #[test]
    fn epoch_wrap_clears_stale_stamps() {
        let mut set = VisitedSet::new(10);
        set.insert(5);
        // Drive the epoch all the way around.
        for _ in 0..u16::MAX {
            set.reset();
        }
        assert!(set.insert(5), "stale stamp survived the wrap");
    }

    #[test]
    fn pool_reuses_sets() {
        let pool = VisitedPool::new();
        {
            let mut handle = pool.acquire(10);
            handle.insert(3);
        }
        // The recycled set must come back reset.
        let handle = pool.acquire(10);
        assert!(!handle.contains(3));
    }

    #[test]
    fn pool_grows_capacity_on_demand() {
        let pool = VisitedPool::new();
        {
            let _small = pool.acquire(4);
        }
        let mut large = pool.acquire(1000);
        assert!(large.insert(999));
    }
}
