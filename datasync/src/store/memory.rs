use crate::errors::StoreError;
use crate::kinds::{Collection, DataKind, ItemDescriptor, KeyedItem};
use crate::store::DataStore;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Default)]
struct MemoryStoreInner {
    data: HashMap<DataKind, HashMap<String, ItemDescriptor>>,
    initialized: bool,
}

/// The default store: items are kept in their parsed form.
///
/// No lock is ever held across an await point, and nothing inside a critical
/// section can panic.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError> {
        let data: HashMap<DataKind, HashMap<String, ItemDescriptor>> = all_data
            .into_iter()
            .map(|coll| {
                let items = coll.items.into_iter().map(|i| (i.key, i.item)).collect();
                (coll.kind, items)
            })
            .collect();

        let mut inner = self.inner.write();
        inner.data = data;
        inner.initialized = true;
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.data.get(&kind).and_then(|items| items.get(key)).cloned())
    }

    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItem>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .data
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(key, item)| KeyedItem::new(key.as_str(), item.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let items = inner.data.entry(kind).or_default();
        let updated = items
            .get(key)
            .is_none_or(|existing| existing.version < item.version);
        if updated {
            items.insert(key.to_string(), item);
        }
        Ok(updated)
    }

    async fn is_initialized(&self) -> bool {
        self.inner.read().initialized
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
