use crate::broadcaster::Broadcaster;
use crate::errors::StoreError;
use crate::kinds::{
    Collection, DataKind, ItemDescriptor, KeyedItem, KeyedSerializedItem, SerializedCollection,
    SerializedItem,
};
use crate::model::{Clause, FeatureFlag, FlagRule, Prerequisite, Segment};
use crate::store::DataStore;
use crate::store::memory::MemoryStore;
use crate::store::persistent::PersistentDataStore;
use crate::store::status::{DataStoreStatusProvider, DataStoreUpdates};
use crate::updates::DataSourceUpdates;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub fn flag(key: &str, version: i64) -> ItemDescriptor {
    ItemDescriptor::from_flag(FeatureFlag::new(key, version))
}

/// A flag with the given prerequisite flags and one segment-match rule per
/// segment key.
pub fn flag_with(key: &str, version: i64, prereqs: &[&str], segments: &[&str]) -> ItemDescriptor {
    let mut flag = FeatureFlag::new(key, version);
    flag.prerequisites = prereqs
        .iter()
        .map(|p| Prerequisite {
            key: p.to_string(),
            variation: 0,
        })
        .collect();
    flag.rules = segments
        .iter()
        .map(|s| FlagRule {
            clauses: vec![Clause::segment_match([*s])],
            ..Default::default()
        })
        .collect();
    ItemDescriptor::from_flag(flag)
}

pub fn segment(key: &str, version: i64) -> ItemDescriptor {
    ItemDescriptor::from_segment(Segment::new(key, version))
}

/// Update sink over a fresh memory store, with outage logging disabled.
pub fn memory_updates() -> (Arc<DataSourceUpdates>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let store_updates = Arc::new(DataStoreUpdates::new(Arc::new(Broadcaster::new())));
    let provider = Arc::new(DataStoreStatusProvider::new(store.clone(), store_updates));
    let updates = DataSourceUpdates::new(
        "test",
        store.clone(),
        provider,
        Arc::new(Broadcaster::new()),
        Arc::new(Broadcaster::new()),
        Duration::ZERO,
    );
    (Arc::new(updates), store)
}

/// In-memory stand-in for a database integration, with switches to simulate
/// outages and counters to observe how often it is reached.
pub struct MockPersistentStore {
    data: Mutex<HashMap<DataKind, HashMap<String, SerializedItem>>>,
    initialized: AtomicBool,
    fail: AtomicBool,
    available: AtomicBool,
    delay: Option<Duration>,
    get_calls: AtomicUsize,
    init_calls: AtomicUsize,
    init_checks: AtomicUsize,
}

impl MockPersistentStore {
    pub fn new() -> Self {
        MockPersistentStore {
            data: Mutex::new(HashMap::new()),
            initialized: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            available: AtomicBool::new(true),
            delay: None,
            get_calls: AtomicUsize::new(0),
            init_calls: AtomicUsize::new(0),
            init_checks: AtomicUsize::new(0),
        }
    }

    /// Every read waits this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Makes every operation fail.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::SeqCst);
    }

    /// Writes directly, bypassing version checks, as another process would.
    pub fn put(&self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let serialized = kind.serialize(key, item).unwrap();
        self.data
            .lock()
            .entry(kind)
            .or_default()
            .insert(key.to_string(), serialized);
    }

    pub fn stored(&self, kind: DataKind, key: &str) -> Option<ItemDescriptor> {
        let data = self.data.lock();
        let serialized = data.get(&kind)?.get(key)?;
        Some(kind.deserialize(serialized).unwrap())
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn init_checks(&self) -> usize {
        self.init_checks.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated failure".into()));
        }
        Ok(())
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for MockPersistentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentDataStore for MockPersistentStore {
    async fn init(&self, all_data: Vec<SerializedCollection>) -> Result<(), StoreError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let mut data = self.data.lock();
        data.clear();
        for coll in all_data {
            let items = data.entry(coll.kind).or_default();
            for entry in coll.items {
                items.insert(entry.key, entry.item);
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        self.check()?;
        Ok(self
            .data
            .lock()
            .get(&kind)
            .and_then(|items| items.get(key))
            .cloned())
    }

    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedSerializedItem>, StoreError> {
        self.pause().await;
        self.check()?;
        Ok(self
            .data
            .lock()
            .get(&kind)
            .map(|items| {
                items
                    .iter()
                    .map(|(key, item)| KeyedSerializedItem {
                        key: key.clone(),
                        item: item.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data.lock();
        let items = data.entry(kind).or_default();
        let updated = items
            .get(key)
            .is_none_or(|existing| existing.version < item.version);
        if updated {
            items.insert(key.to_string(), item);
        }
        Ok(updated)
    }

    async fn is_initialized(&self) -> bool {
        self.init_checks.fetch_add(1, Ordering::SeqCst);
        self.initialized.load(Ordering::SeqCst)
    }

    async fn is_store_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A store without availability reporting whose full writes can be made to
/// fail. Single-item writes always succeed.
pub struct UnmonitoredStore {
    inner: MemoryStore,
    fail_init: AtomicBool,
    upserts: AtomicUsize,
}

impl UnmonitoredStore {
    pub fn new() -> Self {
        UnmonitoredStore {
            inner: MemoryStore::new(),
            fail_init: AtomicBool::new(false),
            upserts: AtomicUsize::new(0),
        }
    }

    pub fn set_fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

impl Default for UnmonitoredStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for UnmonitoredStore {
    async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("simulated failure".into()));
        }
        self.inner.init(all_data).await
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        self.inner.get(kind, key).await
    }

    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItem>, StoreError> {
        self.inner.get_all(kind).await
    }

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert(kind, key, item).await
    }

    async fn is_initialized(&self) -> bool {
        self.inner.is_initialized().await
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        false
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
