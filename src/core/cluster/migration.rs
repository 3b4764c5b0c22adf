// src/core/cluster/migration.rs

//! Live per-slot migration orchestration (component 4.8). This crate does
//! not hold key bytes — the datastore is an external collaborator — so the
//! key-level transfer is expressed against the narrow `KeyMover` trait an
//! embedding binary implements against its real storage.

use crate::core::errors::CoreError;
use async_trait::async_trait;

/// The narrow interface the migration controller needs from the (external)
/// datastore to move keys out of a slot being migrated away.
#[async_trait]
pub trait KeyMover: Send + Sync {
    /// Returns up to `count` key identifiers currently stored under `slot`.
    async fn keys_in_slot(&self, slot: u16, count: usize) -> Result<Vec<Vec<u8>>, CoreError>;

    /// Copies one key to the target node and, only once the target
    /// confirms durable receipt, deletes it from the source. Implementors
    /// must make this atomic with respect to a crash: a key must never be
    /// visible at neither or both nodes following a failure mid-transfer.
    async fn migrate_key(&self, key: &[u8], target_node_id: &str) -> Result<(), CoreError>;
}

/// Drives the migration of up to `batch_size` keys currently in `slot`,
/// bounding per-call work as required by the concurrency model (component
/// 5) so a single tick is never stalled by an unbounded transfer.
///
/// Returns the number of keys moved; 0 means the slot is empty on the
/// source and the operator may proceed to `SETSLOT <slot> NODE <target>`.
pub async fn drive_slot_migration(
    mover: &dyn KeyMover,
    slot: u16,
    target_node_id: &str,
    batch_size: usize,
) -> Result<usize, CoreError> {
    let keys = mover.keys_in_slot(slot, batch_size).await?;
    for key in &keys {
        mover.migrate_key(key, target_node_id).await?;
    }
    Ok(keys.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct FakeStore {
        slots: Mutex<HashMap<u16, Vec<Vec<u8>>>>,
        migrated: Mutex<Vec<(Vec<u8>, String)>>,
    }

    #[async_trait]
    impl KeyMover for FakeStore {
        async fn keys_in_slot(&self, slot: u16, count: usize) -> Result<Vec<Vec<u8>>, CoreError> {
            let slots = self.slots.lock();
            Ok(slots
                .get(&slot)
                .map(|ks| ks.iter().take(count).cloned().collect())
                .unwrap_or_default())
        }

        async fn migrate_key(&self, key: &[u8], target_node_id: &str) -> Result<(), CoreError> {
            self.migrated
                .lock()
                .push((key.to_vec(), target_node_id.to_string()));
            let mut slots = self.slots.lock();
            for keys in slots.values_mut() {
                keys.retain(|k| k != key);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_a_slot_in_batches() {
        let mut slots = HashMap::new();
        slots.insert(100u16, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let store = FakeStore {
            slots: Mutex::new(slots),
            migrated: Mutex::new(vec![]),
        };

        let moved = drive_slot_migration(&store, 100, "node-b", 2).await.unwrap();
        assert_eq!(moved, 2);
        assert_eq!(store.migrated.lock().len(), 2);

        let moved = drive_slot_migration(&store, 100, "node-b", 2).await.unwrap();
        assert_eq!(moved, 1);

        let moved = drive_slot_migration(&store, 100, "node-b", 2).await.unwrap();
        assert_eq!(moved, 0, "slot should now be empty");
    }
}
