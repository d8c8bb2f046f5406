//! Work distribution across shards.
//!
//! The scheduler creates buckets of work items that can be executed
//! independently. It is used both to split a test unit into pieces and to
//! assign split pieces to shard configurations.
//!
//! Items are dealt round-robin; empty buckets are dropped.
//!
//! # Example
//!
//! ```
//! use devrun::scheduler::Scheduler;
//!
//! let scheduler = Scheduler::new(4);
//! let buckets = scheduler.schedule((0..10).collect::<Vec<_>>());
//! assert_eq!(buckets.len(), 4);
//! assert_eq!(buckets[0], vec![0, 4, 8]);
//! ```

/// Distributes work items across a fixed number of buckets.
pub struct Scheduler {
    max_buckets: usize,
}

impl Scheduler {
    /// Creates a scheduler producing at most `max_buckets` buckets.
    ///
    /// Values below 1 are clamped to 1.
    pub fn new(max_buckets: usize) -> Self {
        Self {
            max_buckets: max_buckets.max(1),
        }
    }

    /// Schedules items into buckets using round-robin distribution.
    ///
    /// Item `i` lands in bucket `i % max_buckets`. Empty buckets are
    /// removed, so fewer items than buckets yields one bucket per item.
    pub fn schedule<T>(&self, items: Vec<T>) -> Vec<Vec<T>> {
        if items.is_empty() {
            return Vec::new();
        }

        let mut buckets: Vec<Vec<T>> = (0..self.max_buckets).map(|_| Vec::new()).collect();
        for (i, item) in items.into_iter().enumerate() {
            buckets[i % self.max_buckets].push(item);
        }

        buckets.retain(|b| !b.is_empty());
        buckets
    }
}
