//! Per-path lock table.
//!
//! Lazily allocated advisory locks keyed by mount-relative path. Entries are
//! never removed for the mount's lifetime, which sidesteps the get-or-create
//! race a reaping scheme would have. Held only for short critical sections:
//! directory materialization, chunked-reader construction, promotion of a
//! file to complete.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

#[derive(Default)]
pub struct LockTable {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new() -> LockTable {
        LockTable::default()
    }

    /// Get-or-create the mutex for a path. Callers hold the returned Arc
    /// across the await on `lock()`.
    pub fn lock_for(&self, rel: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(rel.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_path_same_lock() {
        let table = LockTable::new();
        let a = table.lock_for("x/y");
        let b = table.lock_for("x/y");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn distinct_paths_distinct_locks() {
        let table = LockTable::new();
        let a = table.lock_for("x");
        let b = table.lock_for("y");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn serializes_critical_sections() {
        let table = Arc::new(LockTable::new());
        let counter = Arc::new(std::sync::Mutex::new(0u32));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let table = table.clone();
            let counter = counter.clone();
            tasks.push(tokio::spawn(async move {
                let lock = table.lock_for("shared");
                let _guard = lock.lock().await;
                let mut c = counter.lock().unwrap();
                *c += 1;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*counter.lock().unwrap(), 8);
        assert_eq!(table.len(), 1);
    }
}
