//! Wallet record storage.
//!
//! Every store serializes read-modify-write sequences per address: two
//! concurrent [WalletStore::upsert] calls for the same wallet never observe the
//! same starting record.

use punchcard_types::WalletRecord;
use thiserror::Error;

mod memory;
pub use memory::MemoryStore;
mod sqlite;
pub use sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("stored {field} for {address} is out of range: {value}")]
    Corrupt {
        address: String,
        field: &'static str,
        value: i64,
    },
}

/// Result of an upsert: the record as written and whether it was created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upserted {
    pub record: WalletRecord,
    pub created: bool,
}

/// Mutation applied inside an upsert.
///
/// Receives the current record (zero-valued when absent) and whether the record
/// is being created. May be invoked again if the store retries the write.
pub type Mutator<'a> = &'a mut dyn FnMut(&mut WalletRecord, bool);

pub trait WalletStore: Send + Sync + 'static {
    /// Fetch a record, or `None` if the address has never been written.
    fn get(&self, address: &str) -> Result<Option<WalletRecord>, StorageError>;

    /// Atomically create-or-update the record for `address`.
    fn upsert(&self, address: &str, mutate: Mutator<'_>) -> Result<Upserted, StorageError>;

    /// Up to `limit` records ordered by win count (descending), then address.
    fn list_top(&self, limit: usize) -> Result<Vec<WalletRecord>, StorageError>;
}

/// Leaderboard ordering shared by every store.
pub(crate) fn leaderboard_order(a: &WalletRecord, b: &WalletRecord) -> std::cmp::Ordering {
    b.win_count
        .cmp(&a.win_count)
        .then_with(|| a.address.cmp(&b.address))
}

#[cfg(test)]
pub(crate) mod tests {
    //! Behavior every [WalletStore] must satisfy.

    use super::*;
    use std::sync::Arc;

    pub fn upsert_creates_then_updates(store: &dyn WalletStore) {
        assert_eq!(store.get("A").unwrap(), None);

        let first = store
            .upsert("A", &mut |record, created| {
                assert!(created);
                record.tokens += 100;
            })
            .unwrap();
        assert!(first.created);
        assert_eq!(first.record.tokens, 100);

        let second = store
            .upsert("A", &mut |record, created| {
                assert!(!created);
                record.tokens += 20;
                record.character_name = "Hero".to_string();
            })
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.record.tokens, 120);

        let stored = store.get("A").unwrap().unwrap();
        assert_eq!(stored, second.record);
        assert_eq!(stored.address, "A");
        assert_eq!(stored.character_name, "Hero");
    }

    pub fn list_top_orders_by_wins(store: &dyn WalletStore) {
        for (address, wins) in [("w5", 5), ("w3", 3), ("w9", 9), ("w1", 1)] {
            store
                .upsert(address, &mut |record, _| record.win_count = wins)
                .unwrap();
        }
        let top = store.list_top(3).unwrap();
        let wins: Vec<u64> = top.iter().map(|record| record.win_count).collect();
        assert_eq!(wins, vec![9, 5, 3]);
        assert_eq!(store.list_top(10).unwrap().len(), 4);
        assert!(store.list_top(0).unwrap().is_empty());
    }

    pub fn list_top_breaks_ties_by_address(store: &dyn WalletStore) {
        for address in ["c", "a", "b"] {
            store
                .upsert(address, &mut |record, _| record.win_count = 2)
                .unwrap();
        }
        let top = store.list_top(3).unwrap();
        let addresses: Vec<&str> = top.iter().map(|record| record.address.as_str()).collect();
        assert_eq!(addresses, vec!["a", "b", "c"]);
    }

    pub fn concurrent_upserts_are_not_lost(store: Arc<dyn WalletStore>) {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 50;

        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let store = store.clone();
                scope.spawn(move || {
                    for _ in 0..PER_THREAD {
                        store
                            .upsert("shared", &mut |record, _| {
                                record.punches += 1;
                                record.tokens += thread;
                            })
                            .unwrap();
                    }
                });
            }
        });

        let record = store.get("shared").unwrap().unwrap();
        assert_eq!(record.punches, THREADS * PER_THREAD);
        assert_eq!(record.tokens, (0..THREADS).sum::<u64>() * PER_THREAD);
    }
}
