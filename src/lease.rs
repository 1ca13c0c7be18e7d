//! Per-entity leases
//!
//! At most one transition per entity is in flight. A lease is held from
//! validation until the ledger outcome is known and the mirror written;
//! leases on different entities never contend.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::trace;

type Slot = Arc<tokio::sync::Mutex<()>>;

#[derive(Debug, Default)]
pub struct LeaseTable {
    slots: Mutex<HashMap<String, Slot>>,
}

impl LeaseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for exclusive use of `key`. Waiters are served in FIFO order.
    pub async fn acquire(self: &Arc<Self>, key: &str) -> Lease {
        let slot = self
            .slots()
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = slot.lock_owned().await;
        trace!(key, "lease acquired");

        Lease {
            key: key.to_owned(),
            table: Arc::clone(self),
            guard: Some(guard),
        }
    }

    /// Number of keys currently leased or waited on.
    pub fn active(&self) -> usize {
        self.slots().len()
    }
}

/// Exclusive hold on one entity; released on drop.
#[derive(Debug)]
pub struct Lease {
    key: String,
    table: Arc<LeaseTable>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        drop(self.guard.take());

        // the table's own handle is the only one left: nobody is waiting
        let mut slots = self.table.slots();
        if slots
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.key);
        }
        trace!(key = %self.key, "lease released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_holder_waits_for_the_first() {
        let table = LeaseTable::new();
        let first = table.acquire("products/p1").await;

        let contender = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.acquire("products/p1").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.key(), "products/p1");
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let table = LeaseTable::new();
        let _a = table.acquire("products/a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), table.acquire("products/b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn released_slots_are_removed() {
        let table = LeaseTable::new();
        {
            let _lease = table.acquire("products/p1").await;
            assert_eq!(table.active(), 1);
        }
        assert_eq!(table.active(), 0);
    }
}
