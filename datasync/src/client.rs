//! One environment's replica: a store kept in sync by a data source, plus
//! the status feeds around them.

use crate::broadcaster::{Broadcaster, Subscription, SubscriptionId};
use crate::config::{DataSourceConfig, EnvironmentConfig};
use crate::datasource::polling::PollingProcessor;
use crate::datasource::streaming::StreamProcessor;
use crate::datasource::{DataSource, ReadySignal};
use crate::errors::ValidationError;
use crate::status::{DataSourceStatus, FlagChangeEvent};
use crate::store::DataStore;
use crate::store::memory::MemoryStore;
use crate::store::persistent::{PersistentDataStore, PersistentDataStoreWrapper};
use crate::store::status::{DataStoreStatus, DataStoreStatusProvider, DataStoreUpdates};
use crate::updates::DataSourceUpdates;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatusReport {
    pub available: bool,
    pub needs_refresh: bool,
    pub status_monitoring_enabled: bool,
}

/// Point-in-time view of an environment, as served by the status endpoint.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub environment: String,
    pub data_source: DataSourceStatus,
    pub data_store: StoreStatusReport,
    pub initialized: bool,
}

pub struct EnvironmentClient {
    name: String,
    store: Arc<dyn DataStore>,
    store_status: Arc<DataStoreStatusProvider>,
    updates: Arc<DataSourceUpdates>,
    data_source: Box<dyn DataSource>,
    ready: watch::Receiver<bool>,
    status_broadcaster: Arc<Broadcaster<DataSourceStatus>>,
    store_status_broadcaster: Arc<Broadcaster<DataStoreStatus>>,
    flag_change_broadcaster: Arc<Broadcaster<FlagChangeEvent>>,
    closed: AtomicBool,
}

impl EnvironmentClient {
    /// Builds an environment backed by an in-memory store and starts its
    /// data source. Must be called from within a tokio runtime.
    pub fn new(config: &EnvironmentConfig) -> Result<Self, ValidationError> {
        config.validate()?;
        Self::build(config, |_| Arc::new(MemoryStore::new()))
    }

    /// Like [`EnvironmentClient::new`], but keeps the data in `core`, cached
    /// according to `config.store`.
    pub fn with_persistent_store(
        config: &EnvironmentConfig,
        core: Arc<dyn PersistentDataStore>,
    ) -> Result<Self, ValidationError> {
        config.validate()?;
        let cache_mode = config.store.cache_mode();
        Self::build(config, move |store_updates| {
            Arc::new(PersistentDataStoreWrapper::new(core, store_updates, cache_mode))
        })
    }

    fn build<F>(config: &EnvironmentConfig, make_store: F) -> Result<Self, ValidationError>
    where
        F: FnOnce(Arc<DataStoreUpdates>) -> Arc<dyn DataStore>,
    {
        let status_broadcaster = Arc::new(Broadcaster::new());
        let store_status_broadcaster = Arc::new(Broadcaster::new());
        let flag_change_broadcaster = Arc::new(Broadcaster::new());

        let store_updates = Arc::new(DataStoreUpdates::new(store_status_broadcaster.clone()));
        let store = make_store(store_updates.clone());
        let store_status = Arc::new(DataStoreStatusProvider::new(store.clone(), store_updates));
        let updates = Arc::new(DataSourceUpdates::new(
            &config.name,
            store.clone(),
            store_status.clone(),
            status_broadcaster.clone(),
            flag_change_broadcaster.clone(),
            config.outage_logging_timeout(),
        ));

        let client = reqwest::Client::new();
        let data_source: Box<dyn DataSource> = match &config.data_source {
            DataSourceConfig::Streaming(streaming) => Box::new(StreamProcessor::new(
                &config.name,
                client,
                &config.sdk_key,
                streaming,
                updates.clone(),
            )?),
            DataSourceConfig::Polling(polling) => Box::new(PollingProcessor::new(
                &config.name,
                client,
                &config.sdk_key,
                polling,
                updates.clone(),
            )?),
        };

        let (ready_signal, ready) = ReadySignal::new();
        tracing::info!(environment = %config.name, "Starting data source");
        data_source.start(ready_signal);

        Ok(EnvironmentClient {
            name: config.name.clone(),
            store,
            store_status,
            updates,
            data_source,
            ready,
            status_broadcaster,
            store_status_broadcaster,
            flag_change_broadcaster,
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read access for flag evaluation.
    pub fn store(&self) -> Arc<dyn DataStore> {
        self.store.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.data_source.is_initialized()
    }

    /// Waits until the data source either synchronized for the first time or
    /// gave up. Returns false on timeout.
    pub async fn wait_until_ready(&self, timeout: Duration) -> bool {
        let mut ready = self.ready.clone();
        matches!(
            tokio::time::timeout(timeout, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        )
    }

    pub fn data_source_status(&self) -> DataSourceStatus {
        self.updates.status()
    }

    pub fn subscribe_data_source_status(&self) -> Subscription<DataSourceStatus> {
        self.updates.subscribe_status()
    }

    pub fn data_store_status(&self) -> DataStoreStatus {
        self.store_status.status()
    }

    pub fn subscribe_data_store_status(&self) -> Subscription<DataStoreStatus> {
        self.store_status.subscribe()
    }

    pub fn subscribe_flag_changes(&self) -> Subscription<FlagChangeEvent> {
        self.flag_change_broadcaster.subscribe()
    }

    pub fn unsubscribe_flag_changes(&self, id: SubscriptionId) {
        self.flag_change_broadcaster.unsubscribe(id);
    }

    pub fn status_report(&self) -> StatusReport {
        let store_status = self.store_status.status();
        StatusReport {
            environment: self.name.clone(),
            data_source: self.updates.status(),
            data_store: StoreStatusReport {
                available: store_status.available,
                needs_refresh: store_status.needs_refresh,
                status_monitoring_enabled: self.store_status.is_status_monitoring_enabled(),
            },
            initialized: self.is_initialized(),
        }
    }

    /// Stops the data source, closes the store and ends every subscription.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(environment = %self.name, "Closing environment");
        self.data_source.close().await;
        if let Err(e) = self.store.close().await {
            tracing::warn!(environment = %self.name, error = %e, "Failed to close data store");
        }
        self.status_broadcaster.shutdown();
        self.store_status_broadcaster.shutdown();
        self.flag_change_broadcaster.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PollingConfig, StoreConfig, StreamingConfig};
    use crate::kinds::DataKind;
    use crate::status::DataSourceState;
    use crate::testutils::{MockPersistentStore, flag};
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PUT: &str = concat!(
        "event: put\n",
        r#"data: {"data":{"flags":{"f1":{"key":"f1","version":1}},"segments":{}}}"#,
        "\n\n",
    );

    fn streaming_config(server: &MockServer) -> EnvironmentConfig {
        let mut streaming = StreamingConfig::new(Url::parse(&server.uri()).unwrap());
        streaming.initial_reconnect_delay_ms = 10_000;
        EnvironmentConfig {
            name: "production".into(),
            sdk_key: "sdk-key".into(),
            data_source: DataSourceConfig::Streaming(streaming),
            store: StoreConfig::default(),
            outage_logging_timeout_secs: 0,
        }
    }

    async fn mount_stream(server: &MockServer, body: &str, delay: Duration) {
        Mock::given(method("GET"))
            .and(path("/all"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .set_delay(delay),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_streaming_environment() {
        let server = MockServer::start().await;
        mount_stream(&server, PUT, Duration::ZERO).await;

        let client = EnvironmentClient::new(&streaming_config(&server)).unwrap();
        assert!(client.wait_until_ready(Duration::from_secs(5)).await);
        assert!(client.is_initialized());
        assert_eq!(
            client.store().get(DataKind::Features, "f1").await.unwrap(),
            Some(flag("f1", 1))
        );

        let report = serde_json::to_value(client.status_report()).unwrap();
        assert_eq!(report["environment"], "production");
        assert_eq!(report["initialized"], true);
        assert_eq!(report["dataStore"]["available"], true);
        assert_eq!(report["dataStore"]["statusMonitoringEnabled"], false);
        client.close().await;
    }

    #[tokio::test]
    async fn test_flag_change_events() {
        let server = MockServer::start().await;
        let body = format!(
            "{PUT}event: patch\ndata: {}\n\n",
            r#"{"path":"/flags/f1","data":{"key":"f1","version":2}}"#
        );
        // The delay lets the subscription below exist before any event.
        mount_stream(&server, &body, Duration::from_millis(200)).await;

        let client = EnvironmentClient::new(&streaming_config(&server)).unwrap();
        let mut changes = client.subscribe_flag_changes();
        let event = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .unwrap();
        assert_eq!(
            event,
            Some(FlagChangeEvent {
                key: "f1".to_string()
            })
        );

        client.unsubscribe_flag_changes(changes.id());
        while changes.recv().await.is_some() {}
        client.close().await;
    }

    #[tokio::test]
    async fn test_persistent_environment() {
        let server = MockServer::start().await;
        mount_poll(&server).await;
        let config = polling_config(&server);

        let core = Arc::new(MockPersistentStore::new());
        let client = EnvironmentClient::with_persistent_store(&config, core.clone()).unwrap();
        assert!(client.wait_until_ready(Duration::from_secs(5)).await);
        assert_eq!(core.stored(DataKind::Features, "f1"), Some(flag("f1", 1)));
        assert!(client.data_store_status().available);
        assert!(client.status_report().data_store.status_monitoring_enabled);
        client.close().await;
    }

    fn polling_config(server: &MockServer) -> EnvironmentConfig {
        let mut config = streaming_config(server);
        config.data_source = DataSourceConfig::Polling(PollingConfig {
            base_uri: Url::parse(&server.uri()).unwrap(),
            poll_interval_secs: 30,
        });
        config
    }

    async fn mount_poll(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/sdk/latest-all"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"flags":{"f1":{"key":"f1","version":1}},"segments":{}}"#,
            ))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = MockServer::start().await;
        mount_poll(&server).await;

        let client = EnvironmentClient::new(&polling_config(&server)).unwrap();
        assert!(client.wait_until_ready(Duration::from_secs(5)).await);
        let mut statuses = client.subscribe_data_source_status();

        client.close().await;
        client.close().await;
        assert_eq!(client.data_source_status().state, DataSourceState::Off);

        let mut last = None;
        while let Some(status) = statuses.recv().await {
            last = Some(status.state);
        }
        assert_eq!(last, Some(DataSourceState::Off));
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let server = MockServer::start().await;
        let mut config = streaming_config(&server);
        config.sdk_key = String::new();
        assert!(matches!(
            EnvironmentClient::new(&config),
            Err(ValidationError::EmptySdkKey(_))
        ));
    }

    #[tokio::test]
    async fn test_not_ready_before_timeout() {
        let server = MockServer::start().await;
        mount_stream(&server, PUT, Duration::from_secs(5)).await;

        let client = EnvironmentClient::new(&streaming_config(&server)).unwrap();
        assert!(!client.wait_until_ready(Duration::from_millis(50)).await);
        assert_eq!(
            client.data_source_status().state,
            DataSourceState::Initializing
        );
        client.close().await;
    }
}
