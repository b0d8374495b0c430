//! Read-only views over the store.

use punchcard_types::{WalletRecord, DEFAULT_LEADERBOARD_LIMIT};

use crate::store::{StorageError, WalletStore};

/// Clamp a requested page size into `1..=max`, defaulting when absent.
pub fn leaderboard_limit(requested: Option<usize>, max: usize) -> usize {
    let max = max.max(1);
    requested
        .unwrap_or(DEFAULT_LEADERBOARD_LIMIT)
        .clamp(1, max)
}

/// Wallets with the most wins, best first.
pub fn top_by_wins(
    store: &dyn WalletStore,
    requested: Option<usize>,
    max: usize,
) -> Result<Vec<WalletRecord>, StorageError> {
    store.list_top(leaderboard_limit(requested, max))
}

pub fn details_for(
    store: &dyn WalletStore,
    address: &str,
) -> Result<Option<WalletRecord>, StorageError> {
    let address = address.trim();
    if address.is_empty() {
        return Ok(None);
    }
    store.get(address)
}
