//! Shared pool of pending test units.
//!
//! Several modules (possibly running in different shards at the same time)
//! may poll the same [`TestPool`]. Each unit is handed out exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::remote_test::TestHandle;

/// A FIFO of test units that can be polled concurrently.
///
/// Cloning the pool shares it.
///
/// # Example
///
/// ```ignore
/// let pool = TestPool::new(units);
/// let for_shard = pool.clone();
///
/// // Both handles drain the same queue
/// while let Some(unit) = for_shard.poll() {
///     // ... run unit ...
/// }
/// assert!(pool.is_empty());
/// ```
#[derive(Clone, Default)]
pub struct TestPool {
    units: Arc<Mutex<VecDeque<TestHandle>>>,
}

impl TestPool {
    pub fn new(units: Vec<TestHandle>) -> Self {
        Self {
            units: Arc::new(Mutex::new(units.into())),
        }
    }

    /// Takes the next pending unit, if any.
    pub fn poll(&self) -> Option<TestHandle> {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Returns the number of pending units.
    pub fn len(&self) -> usize {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if both handles drain the same queue.
    pub fn shares_with(&self, other: &TestPool) -> bool {
        Arc::ptr_eq(&self.units, &other.units)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;
    use crate::device::Command;
    use crate::remote_test::{ShellCase, ShellTest};

    fn units(count: usize) -> Vec<TestHandle> {
        (0..count)
            .map(|i| {
                Arc::new(ShellTest::new(
                    format!("unit-{}", i),
                    vec![ShellCase::new("case", Command::new("true"))],
                )) as TestHandle
            })
            .collect()
    }

    #[test]
    fn test_pool_is_fifo() {
        let pool = TestPool::new(units(3));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.poll().map(|u| u.name().to_string()), Some("unit-0".into()));
        assert_eq!(pool.poll().map(|u| u.name().to_string()), Some("unit-1".into()));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_clones_share_queue() {
        let pool = TestPool::new(units(2));
        let other = pool.clone();
        assert!(pool.shares_with(&other));
        assert!(!pool.shares_with(&TestPool::new(units(2))));

        other.poll();
        other.poll();
        assert!(pool.is_empty());
    }

    proptest! {
        #[test]
        fn prop_concurrent_pollers_claim_each_unit_once(count in 0usize..64, pollers in 1usize..8) {
            let pool = TestPool::new(units(count));
            let claimed: Vec<String> = tokio_test::block_on(async {
                let handles: Vec<_> = (0..pollers)
                    .map(|_| {
                        let pool = pool.clone();
                        tokio::spawn(async move {
                            let mut names = Vec::new();
                            while let Some(unit) = pool.poll() {
                                names.push(unit.name().to_string());
                                tokio::task::yield_now().await;
                            }
                            names
                        })
                    })
                    .collect();
                let mut all = Vec::new();
                for handle in futures::future::join_all(handles).await {
                    all.extend(handle.unwrap());
                }
                all
            });

            let unique: HashSet<&String> = claimed.iter().collect();
            prop_assert_eq!(claimed.len(), count);
            prop_assert_eq!(unique.len(), count);
            prop_assert!(pool.is_empty());
        }
    }
}
