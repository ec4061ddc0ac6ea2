use crate::broadcaster::{Broadcaster, Subscription, SubscriptionId};
use crate::store::DataStore;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Interval between availability checks while a store is down.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataStoreStatus {
    pub available: bool,
    /// Set on recovery when the store may have missed updates during the
    /// outage and the data source should resynchronize from scratch.
    pub needs_refresh: bool,
}

impl Default for DataStoreStatus {
    fn default() -> Self {
        DataStoreStatus {
            available: true,
            needs_refresh: false,
        }
    }
}

/// Where a store reports its availability. Broadcasts only real changes.
pub struct DataStoreUpdates {
    last_status: Mutex<DataStoreStatus>,
    broadcaster: Arc<Broadcaster<DataStoreStatus>>,
}

impl DataStoreUpdates {
    pub fn new(broadcaster: Arc<Broadcaster<DataStoreStatus>>) -> Self {
        DataStoreUpdates {
            last_status: Mutex::new(DataStoreStatus::default()),
            broadcaster,
        }
    }

    pub fn status(&self) -> DataStoreStatus {
        *self.last_status.lock()
    }

    pub async fn update_status(&self, new_status: DataStoreStatus) {
        let changed = {
            let mut last = self.last_status.lock();
            let changed = *last != new_status;
            *last = new_status;
            changed
        };
        if changed {
            self.broadcaster.publish(new_status).await;
        }
    }
}

/// Read side of the data store status, handed to data sources and to
/// anything reporting health.
pub struct DataStoreStatusProvider {
    store: Arc<dyn DataStore>,
    updates: Arc<DataStoreUpdates>,
}

impl DataStoreStatusProvider {
    pub fn new(store: Arc<dyn DataStore>, updates: Arc<DataStoreUpdates>) -> Self {
        DataStoreStatusProvider { store, updates }
    }

    pub fn status(&self) -> DataStoreStatus {
        self.updates.status()
    }

    pub fn is_status_monitoring_enabled(&self) -> bool {
        self.store.is_status_monitoring_enabled()
    }

    pub fn subscribe(&self) -> Subscription<DataStoreStatus> {
        self.updates.broadcaster.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.updates.broadcaster.unsubscribe(id);
    }
}

pub(crate) type PollFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub(crate) type PollFn = Arc<dyn Fn() -> PollFuture + Send + Sync>;

struct ManagerState {
    last_available: bool,
    // Dropping the sender stops the poller.
    poll_halt: Option<oneshot::Sender<()>>,
    closed: bool,
}

/// Tracks availability of a persistent store. When the store goes down a
/// background task polls `poll_fn` until it reports the store usable again.
pub(crate) struct DataStoreStatusManager {
    state: Mutex<ManagerState>,
    poll_fn: PollFn,
    poll_interval: Duration,
    refresh_on_recovery: bool,
    updates: Arc<DataStoreUpdates>,
}

impl DataStoreStatusManager {
    pub(crate) fn new(
        updates: Arc<DataStoreUpdates>,
        poll_fn: PollFn,
        poll_interval: Duration,
        refresh_on_recovery: bool,
    ) -> Arc<Self> {
        Arc::new(DataStoreStatusManager {
            state: Mutex::new(ManagerState {
                last_available: true,
                poll_halt: None,
                closed: false,
            }),
            poll_fn,
            poll_interval,
            refresh_on_recovery,
            updates,
        })
    }

    pub(crate) fn is_available(&self) -> bool {
        self.state.lock().last_available
    }

    pub(crate) async fn update_availability(self: &Arc<Self>, available: bool) {
        let new_status = {
            let mut state = self.state.lock();
            if state.closed || state.last_available == available {
                return;
            }
            state.last_available = available;
            if available {
                tracing::warn!("Persistent store is available again");
                state.poll_halt = None;
            } else {
                tracing::warn!(
                    "Detected persistent store unavailability; updates will be cached until it recovers"
                );
                if state.poll_halt.is_none() {
                    let (tx, rx) = oneshot::channel();
                    state.poll_halt = Some(tx);
                    self.spawn_poller(rx);
                }
            }
            DataStoreStatus {
                available,
                needs_refresh: available && self.refresh_on_recovery,
            }
        };
        self.updates.update_status(new_status).await;
    }

    fn spawn_poller(self: &Arc<Self>, mut halt: oneshot::Receiver<()>) {
        // Weak, so that dropping the manager also drops the halt sender.
        let manager = Arc::downgrade(self);
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = &mut halt => return,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else {
                            return;
                        };
                        if (manager.poll_fn)().await {
                            manager.update_availability(true).await;
                            return;
                        }
                    }
                }
            }
        });
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.poll_halt = None;
    }
}
