//! A [`DataStore`] backed by an external database.
//!
//! The wrapper adds an optional in-process cache in front of the database,
//! collapses concurrent identical cache misses into a single database read,
//! and tracks database availability. Once an operation fails the store is
//! reported unavailable and polled in the background until it answers again.
//!
//! In "cache forever" mode the cache is the authority during an outage: writes
//! land in the cache even when the database rejects them, and the cached data
//! set is written back to the database as soon as it recovers.

use crate::dependency_tracker::KindAndKey;
use crate::errors::StoreError;
use crate::kinds::{
    Collection, DataKind, ItemDescriptor, KeyedItem, KeyedSerializedItem, SerializedCollection,
    SerializedItem,
};
use crate::metrics_defs::PERSISTENT_STORE_READS;
use crate::store::DataStore;
use crate::store::negative_cache::{FOREVER_MODE_TTL, InitCheckCache};
use crate::store::status::{
    DataStoreStatusManager, DataStoreUpdates, PollFn, PollFuture, STATUS_POLL_INTERVAL,
};
use async_trait::async_trait;
use moka::future::Cache;
use shared::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The narrow contract a database integration implements. Items cross this
/// boundary in serialized form.
#[async_trait]
pub trait PersistentDataStore: Send + Sync {
    async fn init(&self, all_data: Vec<SerializedCollection>) -> Result<(), StoreError>;

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError>;

    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedSerializedItem>, StoreError>;

    /// Writes `item` unless the stored version is the same or newer.
    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: SerializedItem,
    ) -> Result<bool, StoreError>;

    /// Whether a full data set has ever been written, possibly by another
    /// process sharing the database.
    async fn is_initialized(&self) -> bool;

    /// A cheap liveness check used while the store is marked unavailable.
    async fn is_store_available(&self) -> bool;

    async fn close(&self) -> Result<(), StoreError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Every call reaches the database.
    Disabled,
    /// Entries expire after the given time.
    Ttl(Duration),
    /// Entries never expire, and the cache keeps serving through outages.
    Forever,
}

impl CacheMode {
    /// `0` disables the cache, a negative value caches forever.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            0 => CacheMode::Disabled,
            s if s < 0 => CacheMode::Forever,
            s => CacheMode::Ttl(Duration::from_secs(s.unsigned_abs())),
        }
    }

    fn is_forever(&self) -> bool {
        matches!(self, CacheMode::Forever)
    }
}

struct ItemCache {
    items: Cache<KindAndKey, Option<ItemDescriptor>>,
    all: Cache<DataKind, Arc<Vec<KeyedItem>>>,
}

impl ItemCache {
    fn new(ttl: Option<Duration>) -> Self {
        let items = Cache::builder();
        let all = Cache::builder();
        match ttl {
            Some(ttl) => ItemCache {
                items: items.time_to_live(ttl).build(),
                all: all.time_to_live(ttl).build(),
            },
            None => ItemCache {
                items: items.build(),
                all: all.build(),
            },
        }
    }

    fn flush(&self) {
        self.items.invalidate_all();
        self.all.invalidate_all();
    }

    async fn store_collection(&self, kind: DataKind, items: &[KeyedItem]) {
        self.all.insert(kind, Arc::new(items.to_vec())).await;
        for item in items {
            self.items
                .insert(KindAndKey::new(kind, item.key.as_str()), Some(item.item.clone()))
                .await;
        }
    }

    /// Patches one item inside an already cached collection. Does nothing if
    /// the collection is not cached.
    async fn patch_collection(&self, kind: DataKind, key: &str, item: &ItemDescriptor) {
        let Some(current) = self.all.get(&kind).await else {
            return;
        };
        let mut items = current.as_ref().clone();
        match items.iter_mut().find(|existing| existing.key == key) {
            Some(existing) => existing.item = item.clone(),
            None => items.push(KeyedItem::new(key, item.clone())),
        }
        self.all.insert(kind, Arc::new(items)).await;
    }
}

struct WrapperInner {
    core: Arc<dyn PersistentDataStore>,
    cache: Option<ItemCache>,
    cache_mode: CacheMode,
    init_checked: Option<InitCheckCache>,
    inited: AtomicBool,
    status: Arc<DataStoreStatusManager>,
}

impl WrapperInner {
    async fn process_error<T>(&self, result: &Result<T, StoreError>) {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Persistent store operation failed");
            self.status.update_availability(false).await;
        }
    }

    async fn load_item(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        counter!(PERSISTENT_STORE_READS).increment(1);
        let result = self.core.get(kind, key).await;
        self.process_error(&result).await;
        match result? {
            Some(serialized) => kind.deserialize(&serialized).map(Some),
            None => Ok(None),
        }
    }

    async fn load_all(&self, kind: DataKind) -> Result<Vec<KeyedItem>, StoreError> {
        counter!(PERSISTENT_STORE_READS).increment(1);
        let result = self.core.get_all(kind).await;
        self.process_error(&result).await;
        result?
            .into_iter()
            .map(|entry| -> Result<KeyedItem, StoreError> {
                let item = kind.deserialize(&entry.item)?;
                Ok(KeyedItem::new(entry.key, item))
            })
            .collect()
    }

    async fn init_core(&self, all_data: Vec<SerializedCollection>) -> Result<(), StoreError> {
        let result = self.core.init(all_data).await;
        self.process_error(&result).await;
        result?;
        self.inited.store(true, Ordering::Release);
        Ok(())
    }

    /// Runs on the availability poller. In forever mode a recovered store is
    /// rewritten from the cache before it is reported available.
    async fn poll_availability_after_outage(&self) -> bool {
        if !self.core.is_store_available().await {
            return false;
        }
        if self.cache_mode.is_forever()
            && let Some(cache) = &self.cache
        {
            let mut all_data = Vec::new();
            for kind in DataKind::ALL {
                if let Some(items) = cache.all.get(&kind).await {
                    match serialize_collection(kind, &items) {
                        Ok(collection) => all_data.push(collection),
                        Err(e) => {
                            tracing::error!(error = %e, %kind, "Could not serialize cached data");
                        }
                    }
                }
            }
            // Errors here must not go through process_error: the store is
            // already marked unavailable and this is the poller itself.
            match self.core.init(all_data).await {
                Ok(()) => {
                    self.inited.store(true, Ordering::Release);
                    tracing::warn!("Successfully updated persistent store from cached data");
                }
                Err(e) => tracing::error!(
                    error = %e,
                    "Tried to write cached data to persistent store after a store outage, but failed"
                ),
            }
        }
        true
    }
}

fn serialize_collection(
    kind: DataKind,
    items: &[KeyedItem],
) -> Result<SerializedCollection, StoreError> {
    let items = items
        .iter()
        .map(|entry| -> Result<KeyedSerializedItem, StoreError> {
            Ok(KeyedSerializedItem {
                key: entry.key.clone(),
                item: kind.serialize(&entry.key, &entry.item)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SerializedCollection { kind, items })
}

pub struct PersistentDataStoreWrapper {
    inner: Arc<WrapperInner>,
}

impl PersistentDataStoreWrapper {
    pub fn new(
        core: Arc<dyn PersistentDataStore>,
        updates: Arc<DataStoreUpdates>,
        cache_mode: CacheMode,
    ) -> Self {
        Self::with_poll_interval(core, updates, cache_mode, STATUS_POLL_INTERVAL)
    }

    pub(crate) fn with_poll_interval(
        core: Arc<dyn PersistentDataStore>,
        updates: Arc<DataStoreUpdates>,
        cache_mode: CacheMode,
        poll_interval: Duration,
    ) -> Self {
        let cache = match cache_mode {
            CacheMode::Disabled => None,
            CacheMode::Ttl(ttl) => Some(ItemCache::new(Some(ttl))),
            CacheMode::Forever => Some(ItemCache::new(None)),
        };
        let init_checked = match cache_mode {
            CacheMode::Disabled => None,
            CacheMode::Ttl(ttl) => Some(InitCheckCache::new(ttl)),
            CacheMode::Forever => Some(InitCheckCache::new(FOREVER_MODE_TTL)),
        };

        let inner = Arc::new_cyclic(|weak: &Weak<WrapperInner>| {
            let weak = weak.clone();
            let poll_fn: PollFn = Arc::new(move || -> PollFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => inner.poll_availability_after_outage().await,
                        None => false,
                    }
                })
            });
            WrapperInner {
                core,
                cache,
                cache_mode,
                init_checked,
                inited: AtomicBool::new(false),
                status: DataStoreStatusManager::new(
                    updates,
                    poll_fn,
                    poll_interval,
                    !cache_mode.is_forever(),
                ),
            }
        });
        PersistentDataStoreWrapper { inner }
    }

    pub fn is_available(&self) -> bool {
        self.inner.status.is_available()
    }
}

#[async_trait]
impl DataStore for PersistentDataStoreWrapper {
    async fn init(&self, all_data: Vec<Collection>) -> Result<(), StoreError> {
        let inner = &self.inner;
        let serialized = all_data
            .iter()
            .map(|coll| serialize_collection(coll.kind, &coll.items))
            .collect::<Result<Vec<_>, StoreError>>()?;

        let result = inner.init_core(serialized).await;
        if let Some(cache) = &inner.cache {
            cache.flush();
        }
        if result.is_err() && !inner.cache_mode.is_forever() {
            // A failed write with an expiring cache leaves us uninitialized
            // and with nothing cached.
            return result;
        }
        if let Some(cache) = &inner.cache {
            for coll in &all_data {
                cache.store_collection(coll.kind, &coll.items).await;
            }
        }
        inner.inited.store(true, Ordering::Release);
        result
    }

    async fn get(&self, kind: DataKind, key: &str) -> Result<Option<ItemDescriptor>, StoreError> {
        let inner = &self.inner;
        let Some(cache) = &inner.cache else {
            return inner.load_item(kind, key).await;
        };
        cache
            .items
            .try_get_with(KindAndKey::new(kind, key), inner.load_item(kind, key))
            .await
            .map_err(|e| e.as_ref().clone())
    }

    async fn get_all(&self, kind: DataKind) -> Result<Vec<KeyedItem>, StoreError> {
        let inner = &self.inner;
        let Some(cache) = &inner.cache else {
            return inner.load_all(kind).await;
        };
        let items = cache
            .all
            .try_get_with(kind, async { inner.load_all(kind).await.map(Arc::new) })
            .await
            .map_err(|e| e.as_ref().clone())?;
        Ok(items.as_ref().clone())
    }

    async fn upsert(
        &self,
        kind: DataKind,
        key: &str,
        item: ItemDescriptor,
    ) -> Result<bool, StoreError> {
        let inner = &self.inner;
        let serialized = kind.serialize(key, &item)?;
        let result = inner.core.upsert(kind, key, serialized).await;
        inner.process_error(&result).await;

        let forever = inner.cache_mode.is_forever();
        let Some(cache) = &inner.cache else {
            return result;
        };
        let cache_key = KindAndKey::new(kind, key);
        match result {
            Ok(true) => {
                cache.items.insert(cache_key, Some(item.clone())).await;
                if forever {
                    cache.patch_collection(kind, key, &item).await;
                } else {
                    cache.all.invalidate(&kind).await;
                }
                Ok(true)
            }
            Ok(false) => {
                // Someone else wrote a newer version; reload it.
                cache.items.invalidate(&cache_key).await;
                cache.all.invalidate(&kind).await;
                let _ = self.get(kind, key).await;
                Ok(false)
            }
            Err(e) if forever => {
                let newer = match cache.items.get(&cache_key).await {
                    Some(Some(cached)) => cached.version < item.version,
                    _ => true,
                };
                if newer {
                    cache.items.insert(cache_key, Some(item.clone())).await;
                    cache.patch_collection(kind, key, &item).await;
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn is_initialized(&self) -> bool {
        let inner = &self.inner;
        if inner.inited.load(Ordering::Acquire) {
            return true;
        }
        if let Some(checked) = &inner.init_checked
            && checked.is_known_uninitialized()
        {
            return false;
        }
        let inited = inner.core.is_initialized().await;
        if inited {
            inner.inited.store(true, Ordering::Release);
            if let Some(checked) = &inner.init_checked {
                checked.forget();
            }
        } else if let Some(checked) = &inner.init_checked {
            checked.remember_uninitialized();
        }
        inited
    }

    fn is_status_monitoring_enabled(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.inner.status.close();
        self.inner.core.close().await
    }
}
