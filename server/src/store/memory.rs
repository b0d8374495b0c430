use punchcard_types::WalletRecord;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use super::{leaderboard_order, Mutator, StorageError, Upserted, WalletStore};

type Slot = Arc<Mutex<Option<WalletRecord>>>;

/// Non-durable store keeping each wallet behind its own lock.
///
/// The slot map is only locked long enough to find or insert a slot, so
/// writers for different addresses never wait on each other.
#[derive(Default)]
pub struct MemoryStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn existing_slot(&self, address: &str) -> Result<Option<Slot>, StorageError> {
        let slots = self.slots.read().map_err(|_| StorageError::Poisoned)?;
        Ok(slots.get(address).cloned())
    }

    fn slot(&self, address: &str) -> Result<Slot, StorageError> {
        if let Some(slot) = self.existing_slot(address)? {
            return Ok(slot);
        }
        let mut slots = self.slots.write().map_err(|_| StorageError::Poisoned)?;
        Ok(slots.entry(address.to_string()).or_default().clone())
    }
}

impl WalletStore for MemoryStore {
    fn get(&self, address: &str) -> Result<Option<WalletRecord>, StorageError> {
        let Some(slot) = self.existing_slot(address)? else {
            return Ok(None);
        };
        let guard = slot.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(guard.clone())
    }

    fn upsert(&self, address: &str, mutate: Mutator<'_>) -> Result<Upserted, StorageError> {
        let slot = self.slot(address)?;
        let mut guard = slot.lock().map_err(|_| StorageError::Poisoned)?;
        let created = guard.is_none();
        let mut record = guard
            .clone()
            .unwrap_or_else(|| WalletRecord::new(address));
        mutate(&mut record, created);
        // The key is the identity; a mutator cannot move a record.
        record.address = address.to_string();
        *guard = Some(record.clone());
        Ok(Upserted { record, created })
    }

    fn list_top(&self, limit: usize) -> Result<Vec<WalletRecord>, StorageError> {
        let slots: Vec<Slot> = {
            let slots = self.slots.read().map_err(|_| StorageError::Poisoned)?;
            slots.values().cloned().collect()
        };
        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            let guard = slot.lock().map_err(|_| StorageError::Poisoned)?;
            if let Some(record) = guard.as_ref() {
                records.push(record.clone());
            }
        }
        records.sort_by(leaderboard_order);
        records.truncate(limit);
        Ok(records)
    }
}
