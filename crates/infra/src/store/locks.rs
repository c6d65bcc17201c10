//! Per-row exclusive locks for the in-memory store.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use super::StoreError;

type Rows<K> = Arc<Mutex<HashMap<K, Arc<RowMutex<()>>>>>;

/// Lock table keyed by row id.
///
/// A row gets its own async mutex while someone holds or waits for it; the
/// entry is removed when the last [`RowGuard`] for an uncontended row drops,
/// so the table only tracks rows in use.
#[derive(Debug)]
pub struct LockTable<K> {
    rows: Rows<K>,
}

impl<K> Default for LockTable<K> {
    fn default() -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Holding this is holding the row lock.
#[derive(Debug)]
pub struct RowGuard<K>
where
    K: Copy + Eq + Hash,
{
    key: K,
    rows: Rows<K>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<K> Drop for RowGuard<K>
where
    K: Copy + Eq + Hash,
{
    fn drop(&mut self) {
        drop(self.guard.take());

        // Slots are only cloned under the table mutex, so a count of one
        // means no holder and no waiter.
        if let Ok(mut rows) = self.rows.lock() {
            if rows
                .get(&self.key)
                .is_some_and(|slot| Arc::strong_count(slot) == 1)
            {
                rows.remove(&self.key);
            }
        }
    }
}

impl<K> LockTable<K>
where
    K: Copy + Eq + Hash + core::fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: K) -> Result<Arc<RowMutex<()>>, StoreError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Backend("lock table poisoned".to_string()))?;
        Ok(rows.entry(key).or_default().clone())
    }

    /// Rows currently held or waited on.
    pub fn tracked_rows(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    /// Wait for the row lock until `deadline`.
    pub async fn acquire(&self, key: K, deadline: Instant) -> Result<RowGuard<K>, StoreError> {
        let slot = self.slot(key)?;

        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(row = %key, "waiting for row lock");
                timeout_at(deadline, slot.lock_owned()).await.map_err(|_| {
                    StoreError::Contention(format!("row {key} is locked by another operation"))
                })?
            }
        };

        Ok(RowGuard {
            key,
            rows: self.rows.clone(),
            guard: Some(guard),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn second_holder_times_out() {
        let table: LockTable<u32> = LockTable::new();
        let _held = table
            .acquire(7, Instant::now() + Duration::from_millis(50))
            .await
            .unwrap();

        let err = table
            .acquire(7, Instant::now() + Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Contention(_)));
    }

    #[tokio::test]
    async fn released_rows_can_be_taken_again() {
        let table: LockTable<u32> = LockTable::new();
        let deadline = Instant::now() + Duration::from_millis(50);

        drop(table.acquire(1, deadline).await.unwrap());
        assert!(table.acquire(1, deadline).await.is_ok());
        assert!(table.acquire(2, deadline).await.is_ok());
    }

    #[tokio::test]
    async fn released_rows_leave_the_table() {
        let table: LockTable<u32> = LockTable::new();
        let deadline = Instant::now() + Duration::from_secs(1);

        for key in 0..100 {
            drop(table.acquire(key, deadline).await.unwrap());
        }
        assert_eq!(table.tracked_rows(), 0);

        let held = table.acquire(5, deadline).await.unwrap();
        assert_eq!(table.tracked_rows(), 1);
        drop(held);
        assert_eq!(table.tracked_rows(), 0);
    }

    #[tokio::test]
    async fn a_waiting_row_survives_the_holders_release() {
        let table = Arc::new(LockTable::<u32>::new());
        let held = table.acquire(9, Instant::now() + Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table
                    .acquire(9, Instant::now() + Duration::from_secs(1))
                    .await
                    .map(drop)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        waiter.await.unwrap().unwrap();
        assert_eq!(table.tracked_rows(), 0);
    }
}
