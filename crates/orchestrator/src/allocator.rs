//! Persistent-ID Allocator.
//!
//! Kept as a true global rather than folded into [`crate::context::Context`]
//! state, because identity of the counter *is* the contract: every caller
//! must see the same monotonic sequence regardless of how many references
//! exist.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::storage::Storage;

/// Hands out monotonically increasing 32-bit object IDs, checkpointed to
/// stable storage.
pub struct PersistentIdAllocator {
    next: AtomicU32,
    storage: Arc<dyn Storage>,
}

impl PersistentIdAllocator {
    /// Loads the starting value from storage. Failure to read is fatal, so
    /// this returns an error rather than defaulting.
    pub async fn load(storage: Arc<dyn Storage>) -> anyhow::Result<PersistentIdAllocator> {
        let high_water_mark = storage.load_persistent_id().await?;
        Ok(PersistentIdAllocator { next: AtomicU32::new(high_water_mark), storage })
    }

    /// Returns the next ID. IDs are never reused, even across a failed save.
    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Flushes the current high-water mark to storage. Called periodically
    /// by the control loop and once more during shutdown.
    pub async fn save(&self) -> anyhow::Result<()> {
        let value = self.next.load(Ordering::SeqCst);
        self.storage.save_persistent_id(value).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::FakeStorage;

    #[tokio::test]
    async fn allocates_strictly_increasing_ids() {
        let allocator = PersistentIdAllocator::load(Arc::new(FakeStorage::new())).await.unwrap();

        let a = allocator.allocate();
        let b = allocator.allocate();
        let c = allocator.allocate();

        assert!(a < b);
        assert!(b < c);
    }

    #[tokio::test]
    async fn survives_restart_via_save_and_reload() {
        let storage = Arc::new(FakeStorage::new());

        let first = PersistentIdAllocator::load(Arc::clone(&storage) as Arc<dyn Storage>).await.unwrap();
        first.allocate();
        first.allocate();
        first.save().await.unwrap();

        let second = PersistentIdAllocator::load(Arc::clone(&storage) as Arc<dyn Storage>).await.unwrap();
        let resumed = second.allocate();

        assert_eq!(resumed, 2);
    }
}
