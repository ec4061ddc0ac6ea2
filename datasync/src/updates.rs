//! The write path data sources use to push data into the store.

use crate::broadcaster::{Broadcaster, Subscription};
use crate::dependency_tracker::{DependencyTracker, KindAndKey, sort_collections_for_init};
use crate::errors::StoreError;
use crate::kinds::{Collection, DataKind, ItemDescriptor};
use crate::metrics_defs::{DATA_SOURCE_STATE, FLAG_CHANGE_EVENTS, STORE_ERRORS};
use crate::outage::OutageTracker;
use crate::status::{
    DataSourceErrorInfo, DataSourceErrorKind, DataSourceState, DataSourceStatus, FlagChangeEvent,
};
use crate::store::DataStore;
use crate::store::status::DataStoreStatusProvider;
use parking_lot::Mutex;
use shared::{counter, gauge};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

type Snapshot = HashMap<DataKind, HashMap<String, ItemDescriptor>>;

pub struct DataSourceUpdates {
    environment: String,
    store: Arc<dyn DataStore>,
    store_status: Arc<DataStoreStatusProvider>,
    status: Mutex<DataSourceStatus>,
    status_broadcaster: Arc<Broadcaster<DataSourceStatus>>,
    flag_change_broadcaster: Arc<Broadcaster<FlagChangeEvent>>,
    tracker: Mutex<DependencyTracker>,
    outage: OutageTracker,
    last_store_update_failed: AtomicBool,
}

impl DataSourceUpdates {
    pub fn new(
        environment: &str,
        store: Arc<dyn DataStore>,
        store_status: Arc<DataStoreStatusProvider>,
        status_broadcaster: Arc<Broadcaster<DataSourceStatus>>,
        flag_change_broadcaster: Arc<Broadcaster<FlagChangeEvent>>,
        outage_logging_timeout: Duration,
    ) -> Self {
        DataSourceUpdates {
            environment: environment.to_string(),
            store,
            store_status,
            status: Mutex::new(DataSourceStatus::initializing()),
            status_broadcaster,
            flag_change_broadcaster,
            tracker: Mutex::new(DependencyTracker::new()),
            outage: OutageTracker::new(environment, outage_logging_timeout),
            last_store_update_failed: AtomicBool::new(false),
        }
    }

    /// Replaces the store contents with a full data set. Returns false if the
    /// store rejected the write; the failure has then already been reported
    /// as an `Interrupted` status.
    pub async fn init(&self, all_data: Vec<Collection>) -> bool {
        let old_data = if self.flag_change_broadcaster.has_subscribers() {
            Some(self.snapshot().await)
        } else {
            None
        };

        let result = self
            .store
            .init(sort_collections_for_init(all_data.clone()))
            .await;
        if self.record_store_result(&result).await {
            return false;
        }

        let affected = {
            let mut tracker = self.tracker.lock();
            tracker.reset();
            for coll in &all_data {
                for item in &coll.items {
                    tracker.update(coll.kind, &item.key, &item.item);
                }
            }
            old_data.map(|old| changed_items(&tracker, &old, &all_data))
        };
        if let Some(affected) = affected {
            self.send_change_events(affected).await;
        }
        true
    }

    /// Writes one item. Returns whether the store accepted the operation,
    /// which is true even when the item was ignored as outdated.
    pub async fn upsert(&self, kind: DataKind, key: &str, item: ItemDescriptor) -> bool {
        let result = self.store.upsert(kind, key, item.clone()).await;
        if self.record_store_result(&result).await {
            return false;
        }
        if !matches!(result, Ok(true)) {
            return true;
        }

        let affected = {
            let mut tracker = self.tracker.lock();
            tracker.update(kind, key, &item);
            self.flag_change_broadcaster
                .has_subscribers()
                .then(|| tracker.affected_items(&KindAndKey::new(kind, key)))
        };
        if let Some(affected) = affected {
            self.send_change_events(affected).await;
        }
        true
    }

    /// Records a state change or error. An interruption before the first
    /// successful sync keeps the state `Initializing`.
    pub async fn update_status(&self, new_state: DataSourceState, new_error: Option<DataSourceErrorInfo>) {
        let updated = {
            let mut status = self.status.lock();
            // A closed or permanently failed data source stays off.
            if status.state == DataSourceState::Off && new_state != DataSourceState::Off {
                return;
            }
            let new_state = match (new_state, status.state) {
                (DataSourceState::Interrupted, DataSourceState::Initializing) => {
                    DataSourceState::Initializing
                }
                (state, _) => state,
            };
            if new_state == status.state && new_error.is_none() {
                return;
            }
            self.outage.track(new_state, new_error.as_ref());
            if new_state != status.state {
                status.state = new_state;
                status.state_since = SystemTime::now();
                gauge!(DATA_SOURCE_STATE, "environment" => self.environment.clone())
                    .set(new_state.as_gauge_value());
            }
            if new_error.is_some() {
                status.last_error = new_error;
            }
            status.clone()
        };
        self.status_broadcaster.publish(updated).await;
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.lock().clone()
    }

    pub fn data_store_status_provider(&self) -> Arc<DataStoreStatusProvider> {
        self.store_status.clone()
    }

    /// Waits until the data source reaches `desired`. Returns false on
    /// timeout or once the data source is `Off`, unless `Off` was desired.
    pub async fn wait_for(&self, desired: DataSourceState, timeout: Option<Duration>) -> bool {
        let mut sub = {
            let status = self.status.lock();
            if status.state == desired {
                return true;
            }
            if status.state == DataSourceState::Off {
                return false;
            }
            self.status_broadcaster.subscribe()
        };
        let id = sub.id();

        let wait = async {
            while let Some(status) = sub.recv().await {
                if status.state == desired {
                    return true;
                }
                if status.state == DataSourceState::Off {
                    return false;
                }
            }
            false
        };
        let reached = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, wait).await.unwrap_or(false),
            None => wait.await,
        };
        self.status_broadcaster.unsubscribe(id);
        reached
    }

    pub fn subscribe_status(&self) -> Subscription<DataSourceStatus> {
        self.status_broadcaster.subscribe()
    }

    async fn snapshot(&self) -> Snapshot {
        let mut old = Snapshot::new();
        for kind in DataKind::ALL {
            // A kind that cannot be read simply produces no change events.
            if let Ok(items) = self.store.get_all(kind).await {
                old.insert(kind, items.into_iter().map(|i| (i.key, i.item)).collect());
            }
        }
        old
    }

    /// Converts a store failure into an `Interrupted` status. Returns whether
    /// the operation failed. Only the first of consecutive failures is logged
    /// as a warning.
    async fn record_store_result<T>(&self, result: &Result<T, StoreError>) -> bool {
        let Err(e) = result else {
            self.last_store_update_failed.store(false, Ordering::Relaxed);
            return false;
        };
        counter!(STORE_ERRORS).increment(1);
        if !self.last_store_update_failed.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                environment = %self.environment,
                error = %e,
                "Unexpected data store error when trying to store an update received from the data source"
            );
        } else {
            tracing::debug!(environment = %self.environment, error = %e, "Data store error");
        }
        let info = DataSourceErrorInfo::new(DataSourceErrorKind::StoreError, e.to_string());
        self.update_status(DataSourceState::Interrupted, Some(info)).await;
        true
    }

    async fn send_change_events(&self, affected: HashSet<KindAndKey>) {
        for item in affected {
            if item.kind == DataKind::Features {
                counter!(FLAG_CHANGE_EVENTS).increment(1);
                self.flag_change_broadcaster
                    .publish(FlagChangeEvent { key: item.key })
                    .await;
            }
        }
    }
}

/// Every item added, removed or moved to a newer version between `old` and
/// `new`, plus everything that depends on one of them.
fn changed_items(
    tracker: &DependencyTracker,
    old: &Snapshot,
    new: &[Collection],
) -> HashSet<KindAndKey> {
    let mut affected = HashSet::new();
    let empty = HashMap::new();
    for kind in DataKind::ALL {
        let old_items = old.get(&kind).unwrap_or(&empty);
        let new_items: HashMap<&str, &ItemDescriptor> = new
            .iter()
            .filter(|coll| coll.kind == kind)
            .flat_map(|coll| coll.items.iter())
            .map(|i| (i.key.as_str(), &i.item))
            .collect();

        for (key, old_item) in old_items {
            let changed = new_items
                .get(key.as_str())
                .is_none_or(|new_item| new_item.version > old_item.version);
            if changed {
                tracker.add_affected_items(&mut affected, &KindAndKey::new(kind, key.as_str()));
            }
        }
        for key in new_items.keys() {
            if !old_items.contains_key(*key) {
                tracker.add_affected_items(&mut affected, &KindAndKey::new(kind, *key));
            }
        }
    }
    affected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::KeyedItem;
    use crate::store::persistent::{CacheMode, PersistentDataStoreWrapper};
    use crate::store::status::DataStoreUpdates;
    use crate::testutils::{MockPersistentStore, flag, flag_with, memory_updates, segment};

    fn updates_for(store: Arc<dyn DataStore>, store_updates: Arc<DataStoreUpdates>) -> DataSourceUpdates {
        let provider = Arc::new(DataStoreStatusProvider::new(store.clone(), store_updates));
        DataSourceUpdates::new(
            "test",
            store,
            provider,
            Arc::new(Broadcaster::new()),
            Arc::new(Broadcaster::new()),
            Duration::ZERO,
        )
    }

    fn failing_updates() -> (DataSourceUpdates, Arc<MockPersistentStore>) {
        let core = Arc::new(MockPersistentStore::new());
        core.set_fail(true);
        let store_updates = Arc::new(DataStoreUpdates::new(Arc::new(Broadcaster::new())));
        let store = Arc::new(PersistentDataStoreWrapper::new(
            core.clone(),
            store_updates.clone(),
            CacheMode::Disabled,
        ));
        (updates_for(store, store_updates), core)
    }

    fn data(flags: &[(&str, ItemDescriptor)], segments: &[(&str, ItemDescriptor)]) -> Vec<Collection> {
        let keyed = |items: &[(&str, ItemDescriptor)]| {
            items
                .iter()
                .map(|(k, v)| KeyedItem::new(*k, v.clone()))
                .collect::<Vec<_>>()
        };
        vec![
            Collection::new(DataKind::Features, keyed(flags)),
            Collection::new(DataKind::Segments, keyed(segments)),
        ]
    }

    fn drain(sub: &mut Subscription<FlagChangeEvent>) -> HashSet<String> {
        let mut keys = HashSet::new();
        while let Some(event) = sub.try_recv() {
            keys.insert(event.key);
        }
        keys
    }

    fn keys(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_init_and_upsert_scenarios() {
        let (updates, store) = memory_updates();
        assert!(updates.init(data(&[("f1", flag("f1", 1))], &[])).await);
        assert!(store.is_initialized().await);
        assert_eq!(
            store.get(DataKind::Features, "f1").await.unwrap(),
            Some(flag("f1", 1))
        );

        assert!(updates.upsert(DataKind::Features, "f1", flag("f1", 2)).await);
        // An outdated write is still a successful store operation.
        assert!(updates.upsert(DataKind::Features, "f1", flag("f1", 1)).await);
        assert_eq!(
            store.get(DataKind::Features, "f1").await.unwrap(),
            Some(flag("f1", 2))
        );
    }

    #[tokio::test]
    async fn test_segment_change_notifies_dependent_flag() {
        let (updates, _store) = memory_updates();
        updates
            .init(data(
                &[
                    ("F", flag_with("F", 1, &[], &["S"])),
                    ("G", flag("G", 1)),
                ],
                &[("S", segment("S", 1))],
            ))
            .await;

        let mut sub = updates.flag_change_broadcaster.subscribe();
        assert!(updates.upsert(DataKind::Segments, "S", segment("S", 2)).await);

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(FlagChangeEvent { key: "F".into() }));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_transitive_change_events() {
        let (updates, _store) = memory_updates();
        updates
            .init(data(
                &[
                    ("A", flag_with("A", 1, &[], &["S"])),
                    ("B", flag_with("B", 1, &["A"], &[])),
                    ("C", flag("C", 1)),
                ],
                &[("S", segment("S", 1))],
            ))
            .await;

        let mut sub = updates.flag_change_broadcaster.subscribe();
        updates.upsert(DataKind::Segments, "S", segment("S", 2)).await;
        assert_eq!(drain(&mut sub), keys(&["A", "B"]));

        // Outdated writes change nothing and notify nobody.
        updates.upsert(DataKind::Segments, "S", segment("S", 2)).await;
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn test_init_diff_produces_change_events() {
        let (updates, _store) = memory_updates();
        let mut sub = updates.flag_change_broadcaster.subscribe();

        updates
            .init(data(&[("f1", flag("f1", 1)), ("f2", flag("f2", 1))], &[]))
            .await;
        assert_eq!(drain(&mut sub), keys(&["f1", "f2"]));

        updates
            .init(data(
                &[
                    ("f1", flag("f1", 2)),
                    ("f2", flag("f2", 1)),
                    ("f3", flag("f3", 1)),
                ],
                &[],
            ))
            .await;
        assert_eq!(drain(&mut sub), keys(&["f1", "f3"]));

        updates.init(data(&[("f1", flag("f1", 2))], &[])).await;
        assert_eq!(drain(&mut sub), keys(&["f2", "f3"]));
    }

    #[tokio::test]
    async fn test_init_rebuilds_dependencies() {
        let (updates, _store) = memory_updates();
        updates
            .init(data(
                &[("F", flag_with("F", 1, &[], &["S"]))],
                &[("S", segment("S", 1))],
            ))
            .await;
        updates
            .init(data(&[("F", flag("F", 1))], &[("S", segment("S", 1))]))
            .await;

        let mut sub = updates.flag_change_broadcaster.subscribe();
        updates.upsert(DataKind::Segments, "S", segment("S", 2)).await;
        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_while_initializing_stays_initializing() {
        let (updates, _store) = memory_updates();
        let since = updates.status().state_since;
        let error = DataSourceErrorInfo::http(503);

        updates
            .update_status(DataSourceState::Interrupted, Some(error.clone()))
            .await;
        let status = updates.status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(status.state_since, since);
        assert_eq!(status.last_error, Some(error));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (updates, _store) = memory_updates();
        let mut sub = updates.subscribe_status();

        updates.update_status(DataSourceState::Valid, None).await;
        let valid = sub.recv().await.unwrap();
        assert_eq!(valid.state, DataSourceState::Valid);

        // Same state without an error is not a change.
        updates.update_status(DataSourceState::Valid, None).await;
        assert!(sub.try_recv().is_none());

        updates
            .update_status(
                DataSourceState::Interrupted,
                Some(DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, "reset")),
            )
            .await;
        let interrupted = sub.recv().await.unwrap();
        assert_eq!(interrupted.state, DataSourceState::Interrupted);
        assert!(interrupted.state_since >= valid.state_since);

        // Same state with a new error is published but keeps state_since.
        updates
            .update_status(DataSourceState::Interrupted, Some(DataSourceErrorInfo::http(502)))
            .await;
        let again = sub.recv().await.unwrap();
        assert_eq!(again.state_since, interrupted.state_since);
        assert_eq!(again.last_error.unwrap().status_code, Some(502));
    }

    #[tokio::test]
    async fn test_store_error_becomes_interrupted_status() {
        let (updates, _core) = failing_updates();
        updates.update_status(DataSourceState::Valid, None).await;

        assert!(!updates.init(data(&[("f1", flag("f1", 1))], &[])).await);
        let status = updates.status();
        assert_eq!(status.state, DataSourceState::Interrupted);
        assert_eq!(
            status.last_error.map(|e| e.kind),
            Some(DataSourceErrorKind::StoreError)
        );

        assert!(!updates.upsert(DataKind::Features, "f1", flag("f1", 2)).await);
        assert!(updates.last_store_update_failed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_store_recovery_clears_failure_flag() {
        let (updates, core) = failing_updates();
        assert!(!updates.upsert(DataKind::Features, "f1", flag("f1", 1)).await);
        core.set_fail(false);
        assert!(updates.upsert(DataKind::Features, "f1", flag("f1", 1)).await);
        assert!(!updates.last_store_update_failed.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_wait_for() {
        let (updates, _store) = memory_updates();

        assert!(
            !updates
                .wait_for(DataSourceState::Valid, Some(Duration::from_millis(20)))
                .await
        );

        let waiter = {
            let updates = updates.clone();
            tokio::spawn(async move { updates.wait_for(DataSourceState::Valid, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        updates.update_status(DataSourceState::Valid, None).await;
        assert!(waiter.await.unwrap());
        assert!(updates.wait_for(DataSourceState::Valid, None).await);

        updates.update_status(DataSourceState::Off, None).await;
        assert!(!updates.wait_for(DataSourceState::Valid, None).await);
        assert!(updates.wait_for(DataSourceState::Off, None).await);
    }

    #[tokio::test]
    async fn test_off_is_terminal() {
        let (updates, _store) = memory_updates();
        updates.update_status(DataSourceState::Valid, None).await;
        updates.update_status(DataSourceState::Off, None).await;
        let off_since = updates.status().state_since;

        updates.update_status(DataSourceState::Valid, None).await;
        updates
            .update_status(DataSourceState::Interrupted, Some(DataSourceErrorInfo::http(503)))
            .await;
        let status = updates.status();
        assert_eq!(status.state, DataSourceState::Off);
        assert_eq!(status.state_since, off_since);
        assert!(status.last_error.is_none());
    }
}
