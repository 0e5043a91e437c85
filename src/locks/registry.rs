use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use super::set::{AccessMode, LockSet};
use crate::tree::ResourceKey;

/// Registry of named reader/writer locks, one per resource key.
///
/// Entries are created on first reference and live as long as the registry.
/// Every caller acquires through [`LockRegistry::acquire`], which walks the
/// requested [`LockSet`] in ascending key order; that single global order is
/// what keeps concurrent acquirers from deadlocking each other.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: DashMap<ResourceKey, Arc<RwLock<()>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        if let Some(existing) = self.locks.get(key) {
            return existing.clone();
        }
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Wait until every lock in `set` is held in its requested mode.
    pub async fn acquire(&self, set: &LockSet) -> HeldLocks {
        let mut guards = Vec::with_capacity(set.len());

        for (key, mode) in set {
            let lock = self.lock_for(key);
            debug!(key = %key, mode = %mode, "Waiting for resource lock");
            let guard = match mode {
                AccessMode::Shared => Guard::Shared(lock.read_owned().await),
                AccessMode::Exclusive => Guard::Exclusive(lock.write_owned().await),
            };
            debug!(key = %key, mode = %mode, "Resource lock acquired");
            guards.push(HeldLock {
                key: key.clone(),
                mode: *mode,
                _guard: guard,
            });
        }

        HeldLocks { guards }
    }

    /// Non-blocking variant; acquires all of `set` or nothing.
    pub fn try_acquire(&self, set: &LockSet) -> Option<HeldLocks> {
        let mut held = HeldLocks::empty();

        for (key, mode) in set {
            let lock = self.lock_for(key);
            let guard = match mode {
                AccessMode::Shared => Guard::Shared(lock.try_read_owned().ok()?),
                AccessMode::Exclusive => Guard::Exclusive(lock.try_write_owned().ok()?),
            };
            held.guards.push(HeldLock {
                key: key.clone(),
                mode: *mode,
                _guard: guard,
            });
        }

        Some(held)
    }

    /// Release in descending key order. Equivalent to dropping `held`.
    pub fn release(&self, held: HeldLocks) {
        drop(held);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }

    /// Number of keys referenced so far
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[derive(Debug)]
enum Guard {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

#[derive(Debug)]
struct HeldLock {
    key: ResourceKey,
    mode: AccessMode,
    _guard: Guard,
}

/// Locks held by one execution unit, released when dropped
#[derive(Debug)]
pub struct HeldLocks {
    guards: Vec<HeldLock>,
}

impl HeldLocks {
    pub fn empty() -> Self {
        Self { guards: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    pub fn lock_set(&self) -> LockSet {
        self.guards
            .iter()
            .map(|held| (held.key.clone(), held.mode))
            .collect()
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        // Vec drops front to back; pop so the highest key goes first.
        while let Some(held) = self.guards.pop() {
            debug!(key = %held.key, mode = %held.mode, "Resource lock released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn set(entries: &[(&str, AccessMode)]) -> LockSet {
        entries.iter().map(|(k, m)| (*k, *m)).collect()
    }

    #[tokio::test]
    async fn test_entries_created_lazily() {
        let registry = LockRegistry::new();
        assert!(registry.is_empty());

        let held = registry
            .acquire(&set(&[("b", AccessMode::Shared), ("a", AccessMode::Exclusive)]))
            .await;
        assert_eq!(held.len(), 2);
        assert!(registry.contains("a"));
        assert!(registry.contains("b"));
        assert_eq!(registry.len(), 2);

        registry.release(held);
        // entries survive release
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let registry = LockRegistry::new();
        let shared = set(&[("r", AccessMode::Shared)]);

        let first = registry.acquire(&shared).await;
        let second = timeout(Duration::from_millis(200), registry.acquire(&shared))
            .await
            .expect("second shared acquisition should not block");

        assert!(registry.try_acquire(&set(&[("r", AccessMode::Exclusive)])).is_none());
        drop(first);
        drop(second);
        assert!(registry.try_acquire(&set(&[("r", AccessMode::Exclusive)])).is_some());
    }

    #[tokio::test]
    async fn test_exclusive_excludes_everyone() {
        let registry = LockRegistry::new();
        let held = registry.acquire(&set(&[("r", AccessMode::Exclusive)])).await;

        assert!(registry.try_acquire(&set(&[("r", AccessMode::Shared)])).is_none());
        assert!(registry.try_acquire(&set(&[("r", AccessMode::Exclusive)])).is_none());

        let blocked = timeout(
            Duration::from_millis(50),
            registry.acquire(&set(&[("r", AccessMode::Shared)])),
        )
        .await;
        assert!(blocked.is_err());

        drop(held);
        assert!(registry.try_acquire(&set(&[("r", AccessMode::Shared)])).is_some());
    }

    #[tokio::test]
    async fn test_try_acquire_is_all_or_nothing() {
        let registry = LockRegistry::new();
        let _b = registry.acquire(&set(&[("b", AccessMode::Exclusive)])).await;

        let attempt = registry.try_acquire(&set(&[
            ("a", AccessMode::Exclusive),
            ("b", AccessMode::Exclusive),
        ]));
        assert!(attempt.is_none());
        // "a" was taken then given back when the attempt failed
        assert!(registry.try_acquire(&set(&[("a", AccessMode::Exclusive)])).is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposite_declaration_order_does_not_deadlock() {
        let registry = Arc::new(LockRegistry::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                // LockSet sorts, so insertion order is irrelevant
                let wanted: LockSet = if i % 2 == 0 {
                    [("x", AccessMode::Exclusive), ("y", AccessMode::Exclusive)]
                        .into_iter()
                        .collect()
                } else {
                    [("y", AccessMode::Exclusive), ("x", AccessMode::Exclusive)]
                        .into_iter()
                        .collect()
                };
                let held = registry.acquire(&wanted).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
                assert_eq!(held.lock_set(), wanted);
            }));
        }

        timeout(Duration::from_secs(5), futures::future::join_all(handles))
            .await
            .expect("acquisition deadlocked");
    }
}
