use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Keys of the volume jobs currently running. At most one lease exists per key.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashSet<String>>,
}

impl LockTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Atomically checks and takes `key`; `None` when it is already held.
    pub fn try_acquire(self: &Arc<Self>, key: &str) -> Option<JobLease> {
        if !self.lock_held().insert(key.to_string()) {
            return None;
        }
        Some(JobLease {
            table: Arc::clone(self),
            key: key.to_string(),
        })
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.lock_held().contains(key)
    }

    fn release(&self, key: &str) {
        self.lock_held().remove(key);
    }

    fn lock_held(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of one lock table key; dropping it releases the key.
#[derive(Debug)]
pub struct JobLease {
    table: Arc<LockTable>,
    key: String,
}

impl JobLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        self.table.release(&self.key);
        tracing::debug!(key = %self.key, "job lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let table = LockTable::new();
        let lease = table.try_acquire("Foo/Bar").unwrap();
        assert_eq!(lease.key(), "Foo/Bar");
        assert!(table.try_acquire("Foo/Bar").is_none());
        assert!(table.try_acquire("Foo/Baz").is_some());

        drop(lease);
        assert!(!table.is_held("Foo/Bar"));
        assert!(table.try_acquire("Foo/Bar").is_some());
    }

    #[test]
    fn concurrent_acquires_admit_one() {
        let table = LockTable::new();
        let admitted = std::thread::scope(|scope| {
            let handles = (0..16)
                .map(|_| {
                    let table = Arc::clone(&table);
                    scope.spawn(move || table.try_acquire("Foo/Bar").map(std::mem::forget))
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .count()
        });
        assert_eq!(admitted, 1);
        assert!(table.is_held("Foo/Bar"));
    }
}
