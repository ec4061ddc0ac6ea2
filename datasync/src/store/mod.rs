pub mod memory;
pub mod negative_cache;
pub mod persistent;
pub mod status;

use crate::errors::StoreError;
use crate::kinds::{Collection, DataKind, ItemDescriptor, KeyedItem};
use async_trait::async_trait;

/// Versioned storage for every kind of item. Implementations must be safe
/// for concurrent `init` and `upsert` calls.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Replaces the entire contents and marks the store initialized.
    async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError>;

    /// Returns the item or tombstone stored under `key`, or `None` if the
    /// key has never been written.
    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError>;

    /// Returns every item of `kind`, tombstones included.
    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItem>, StoreError>;

    /// Stores `item` unless the current version is the same or newer.
    /// Returns whether the stored value changed.
    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError>;

    async fn is_initialized(&self) -> bool;

    /// Whether this store reports availability changes through
    /// [`status::DataStoreUpdates`].
    fn is_status_monitoring_enabled(&self) -> bool;

    async fn close(&self) -> Result<(), StoreError>;
}
