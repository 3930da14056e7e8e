use fnv::FnvHasher;
use parking_lot::{Mutex, MutexGuard};
use std::hash::{Hash, Hasher};

/// A fixed array of mutexes selected by key hash.
///
/// The number of stripes is rounded up to a power of two. A key maps to
/// stripe `(hash >> shift) & mask`, so the high bits of the hash pick the
/// stripe. Callers must never hold two stripes at once.
///
/// # Examples
///
/// ```
/// use bonsai::common::StripedLocks;
///
/// let locks = StripedLocks::new(8);
/// {
///     let _guard = locks.lock(&"collections_1.sbc");
/// } // stripe released here
/// assert_eq!(locks.stripes(), 8);
/// ```
pub struct StripedLocks {
    locks: Box<[Mutex<()>]>,
    mask: u32,
    shift: u32,
}

impl StripedLocks {
    /// Creates `concurrency` stripes, rounded up to the next power of two.
    pub fn new(concurrency: usize) -> Self {
        let size = concurrency.max(1).next_power_of_two();
        let locks = (0..size).map(|_| Mutex::new(())).collect::<Vec<_>>();
        StripedLocks {
            locks: locks.into_boxed_slice(),
            mask: (size - 1) as u32,
            shift: 32 - size.trailing_zeros(),
        }
    }

    /// Returns the number of stripes.
    pub fn stripes(&self) -> usize {
        self.locks.len()
    }

    /// Returns the stripe index guarding `key`.
    pub fn index_for<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = FnvHasher::default();
        key.hash(&mut hasher);
        let hash = hasher.finish();
        let folded = (hash ^ (hash >> 32)) as u32;
        // a single stripe needs a shift of 32, which overflows u32
        let high = folded.checked_shr(self.shift).unwrap_or(0);
        (high & self.mask) as usize
    }

    /// Locks the stripe guarding `key` until the guard is dropped.
    pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        let index = self.index_for(key);
        self.locks[index].lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripes_round_up_to_power_of_two() {
        assert_eq!(StripedLocks::new(0).stripes(), 1);
        assert_eq!(StripedLocks::new(1).stripes(), 1);
        assert_eq!(StripedLocks::new(5).stripes(), 8);
        assert_eq!(StripedLocks::new(64).stripes(), 64);
    }

    #[test]
    fn test_index_is_stable_and_in_range() {
        let locks = StripedLocks::new(16);
        for key in 0..1000i64 {
            let index = locks.index_for(&key);
            assert!(index < 16);
            assert_eq!(index, locks.index_for(&key));
        }
    }

    #[test]
    fn test_single_stripe_maps_everything_to_zero() {
        let locks = StripedLocks::new(1);
        assert_eq!(locks.index_for(&42u64), 0);
        assert_eq!(locks.index_for(&"x"), 0);
    }

    #[test]
    fn test_keys_spread_over_stripes() {
        let locks = StripedLocks::new(16);
        let used = (0..1000i64)
            .map(|key| locks.index_for(&key))
            .collect::<std::collections::HashSet<_>>();
        assert!(used.len() > 8);
    }

    #[test]
    fn test_lock_is_released_on_drop() {
        let locks = StripedLocks::new(4);
        {
            let _guard = locks.lock(&7);
        }
        let index = locks.index_for(&7);
        assert!(locks.locks[index].try_lock().is_some());
    }
}
