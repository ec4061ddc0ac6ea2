//! Long-lived server-sent events connection to the upstream service.
//!
//! A `put` event replaces the whole data set, `patch` and `delete` events
//! change a single item. Any payload that cannot be parsed restarts the
//! connection, since the data set can no longer be trusted to be complete.

use crate::broadcaster::Subscription;
use crate::config::StreamingConfig;
use crate::datasource::backoff::Backoff;
use crate::datasource::protocol::{self, DELETE_EVENT, ItemUpdate, PATCH_EVENT, PUT_EVENT};
use crate::datasource::sse::{Event, EventParser};
use crate::datasource::{DataSource, ReadySignal, USER_AGENT, report_request_error};
use crate::errors::{ProtocolError, RequestError, ValidationError};
use crate::metrics_defs::{
    STREAM_CONNECT_DURATION, STREAM_CONNECTION_ATTEMPTS, STREAM_EVENTS, STREAM_MALFORMED_EVENTS,
};
use crate::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use crate::store::status::DataStoreStatus;
use crate::updates::DataSourceUpdates;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use shared::{counter, histogram};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use url::Url;

const STREAM_ERROR_CONTEXT: &str = "on stream connection";
const ALL_PATH: &str = "all";

enum Next {
    Reconnect,
    Stop,
}

enum EventOutcome {
    Continue,
    Restart,
    Stop,
}

pub struct StreamProcessor {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    environment: String,
    client: reqwest::Client,
    url: Url,
    sdk_key: String,
    updates: Arc<DataSourceUpdates>,
    initial_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    read_timeout: Duration,
    initialized: AtomicBool,
    halt: watch::Sender<bool>,
    closed: AtomicBool,
}

impl StreamProcessor {
    pub fn new(
        environment: &str,
        client: reqwest::Client,
        sdk_key: &str,
        config: &StreamingConfig,
        updates: Arc<DataSourceUpdates>,
    ) -> Result<Self, ValidationError> {
        let full_url = format!(
            "{}/{}",
            config.stream_uri.as_str().trim_end_matches('/'),
            ALL_PATH
        );
        let url = Url::parse(&full_url)
            .map_err(|_| ValidationError::InvalidBaseUri(config.stream_uri.to_string()))?;
        let (halt, _) = watch::channel(false);

        Ok(StreamProcessor {
            inner: Arc::new(StreamInner {
                environment: environment.to_string(),
                client,
                url,
                sdk_key: sdk_key.to_string(),
                updates,
                initial_reconnect_delay: config.initial_reconnect_delay(),
                max_reconnect_delay: config.max_reconnect_delay(),
                read_timeout: config.read_timeout(),
                initialized: AtomicBool::new(false),
                halt,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

#[async_trait]
impl DataSource for StreamProcessor {
    fn start(&self, ready: ReadySignal) {
        tokio::spawn(self.inner.clone().run(ready));
    }

    fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::Acquire)
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.halt.send_replace(true);
        self.inner
            .updates
            .update_status(DataSourceState::Off, None)
            .await;
    }
}

/// Next availability change of the store, or never if the store does not
/// report availability.
async fn next_store_status(sub: &mut Option<Subscription<DataStoreStatus>>) -> DataStoreStatus {
    if let Some(sub) = sub
        && let Some(status) = sub.recv().await
    {
        return status;
    }
    std::future::pending().await
}

impl StreamInner {
    async fn run(self: Arc<Self>, ready: ReadySignal) {
        let mut halt = self.halt.subscribe();
        let store_status = self.updates.data_store_status_provider();
        let mut store_sub = store_status
            .is_status_monitoring_enabled()
            .then(|| store_status.subscribe());
        let mut backoff = Backoff::new(self.initial_reconnect_delay, self.max_reconnect_delay);

        loop {
            if *halt.borrow() {
                break;
            }
            if let Next::Stop = self
                .connect(&ready, &mut backoff, &mut halt, &mut store_sub)
                .await
            {
                break;
            }
            let delay = backoff.next_delay();
            tracing::info!(environment = %self.environment, ?delay, "Will reconnect to stream");
            if !self
                .wait_to_reconnect(delay, &ready, &mut halt, &mut store_sub)
                .await
            {
                break;
            }
        }

        if let Some(sub) = store_sub {
            store_status.unsubscribe(sub.id());
        }
        tracing::debug!(environment = %self.environment, "Stream worker stopped");
    }

    async fn connect(
        &self,
        ready: &ReadySignal,
        backoff: &mut Backoff,
        halt: &mut watch::Receiver<bool>,
        store_sub: &mut Option<Subscription<DataStoreStatus>>,
    ) -> Next {
        counter!(STREAM_CONNECTION_ATTEMPTS).increment(1);
        let started = Instant::now();
        tracing::info!(environment = %self.environment, url = %self.url, "Connecting to stream");

        let request = self
            .client
            .get(self.url.clone())
            .header(AUTHORIZATION, &self.sdk_key)
            .header(ACCEPT, "text/event-stream")
            .header(reqwest::header::USER_AGENT, USER_AGENT);
        let response = tokio::select! {
            _ = halt.changed() => return Next::Stop,
            response = request.send() => response,
        };
        let response = match response {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                let err = RequestError::Status(response.status().as_u16());
                return self.connection_failed(&err, ready).await;
            }
            Err(e) => return self.connection_failed(&RequestError::Network(e), ready).await,
        };

        let elapsed = started.elapsed();
        histogram!(STREAM_CONNECT_DURATION).record(elapsed.as_secs_f64());
        tracing::debug!(
            environment = %self.environment,
            ?elapsed,
            "Stream connection established"
        );
        backoff.mark_connected();
        self.consume(response, ready, halt, store_sub).await
    }

    async fn connection_failed(&self, err: &RequestError, ready: &ReadySignal) -> Next {
        if report_request_error(&self.updates, &self.environment, STREAM_ERROR_CONTEXT, err).await
        {
            Next::Reconnect
        } else {
            ready.signal();
            Next::Stop
        }
    }

    async fn consume(
        &self,
        mut response: reqwest::Response,
        ready: &ReadySignal,
        halt: &mut watch::Receiver<bool>,
        store_sub: &mut Option<Subscription<DataStoreStatus>>,
    ) -> Next {
        let mut parser = EventParser::new();
        loop {
            tokio::select! {
                _ = halt.changed() => return Next::Stop,
                status = next_store_status(store_sub) => {
                    if self.store_status_changed(status, ready) {
                        return Next::Reconnect;
                    }
                }
                chunk = tokio::time::timeout(self.read_timeout, response.chunk()) => {
                    let bytes = match chunk {
                        Ok(Ok(Some(bytes))) => bytes,
                        Ok(Ok(None)) => return self.interrupted("stream closed by server").await,
                        Ok(Err(e)) => {
                            let err = RequestError::Network(e);
                            return self.connection_failed(&err, ready).await;
                        }
                        Err(_) => return self.interrupted("no data received within read timeout").await,
                    };
                    for event in parser.push(&bytes) {
                        match self.handle_event(event, ready).await {
                            EventOutcome::Continue => {}
                            EventOutcome::Restart => return Next::Reconnect,
                            EventOutcome::Stop => return Next::Stop,
                        }
                    }
                }
            }
        }
    }

    async fn interrupted(&self, message: &str) -> Next {
        tracing::warn!(environment = %self.environment, "Stream interrupted: {message}");
        let info = DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, message);
        self.updates
            .update_status(DataSourceState::Interrupted, Some(info))
            .await;
        Next::Reconnect
    }

    /// Reacts to a store availability change. Returns whether the stream has
    /// to be restarted to resynchronize.
    fn store_status_changed(&self, status: DataStoreStatus, ready: &ReadySignal) -> bool {
        if !status.available {
            return false;
        }
        if status.needs_refresh {
            tracing::warn!(
                environment = %self.environment,
                "Restarting stream to refresh data after data store outage"
            );
            return true;
        }
        // The store was rewritten from its own cache.
        self.set_initialized(ready);
        false
    }

    async fn wait_to_reconnect(
        &self,
        delay: Duration,
        ready: &ReadySignal,
        halt: &mut watch::Receiver<bool>,
        store_sub: &mut Option<Subscription<DataStoreStatus>>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = halt.changed() => return false,
                _ = &mut sleep => return true,
                status = next_store_status(store_sub) => {
                    // The recovered store needs the data now, not after the delay.
                    if self.store_status_changed(status, ready) {
                        return true;
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: Event, ready: &ReadySignal) -> EventOutcome {
        let label = match event.event.as_str() {
            PUT_EVENT => PUT_EVENT,
            PATCH_EVENT => PATCH_EVENT,
            DELETE_EVENT => DELETE_EVENT,
            _ => "other",
        };
        counter!(STREAM_EVENTS, "event" => label).increment(1);

        let result = match event.event.as_str() {
            PUT_EVENT => self.handle_put(&event.data, ready).await,
            PATCH_EVENT => match protocol::parse_patch(&event.data) {
                Ok(update) => Ok(self.apply_update(update).await),
                Err(e) => Err(e),
            },
            DELETE_EVENT => match protocol::parse_delete(&event.data) {
                Ok(update) => Ok(self.apply_update(update).await),
                Err(e) => Err(e),
            },
            other => {
                tracing::debug!(environment = %self.environment, "Ignoring unexpected stream event {other}");
                Ok(EventOutcome::Continue)
            }
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => self.malformed_event(&event.event, e).await,
        }
    }

    async fn handle_put(&self, data: &str, ready: &ReadySignal) -> Result<EventOutcome, ProtocolError> {
        let collections = protocol::parse_put(data)?;
        if self.is_closed() {
            return Ok(EventOutcome::Stop);
        }
        if !self.updates.init(collections).await {
            return Ok(self.store_update_failed("streaming initialization"));
        }
        if self.is_closed() {
            return Ok(EventOutcome::Stop);
        }
        self.updates
            .update_status(DataSourceState::Valid, None)
            .await;
        self.set_initialized(ready);
        Ok(EventOutcome::Continue)
    }

    async fn apply_update(&self, update: Option<ItemUpdate>) -> EventOutcome {
        let Some(update) = update else {
            tracing::debug!(environment = %self.environment, "Ignoring update for unknown kind");
            return EventOutcome::Continue;
        };
        if self.is_closed() {
            return EventOutcome::Stop;
        }
        if !self
            .updates
            .upsert(update.kind, &update.key, update.item)
            .await
        {
            let description = format!("streaming update of {} {}", update.kind, update.key);
            return self.store_update_failed(&description);
        }
        if self.is_closed() {
            return EventOutcome::Stop;
        }
        self.updates
            .update_status(DataSourceState::Valid, None)
            .await;
        EventOutcome::Continue
    }

    /// The store rejected a write. The status is already `Interrupted`; a
    /// store that reports its own recovery is trusted to do so, any other
    /// store gets the data again through a fresh connection.
    fn store_update_failed(&self, description: &str) -> EventOutcome {
        let provider = self.updates.data_store_status_provider();
        if provider.is_status_monitoring_enabled() {
            tracing::error!(
                environment = %self.environment,
                "Failed to store {description} in data store; will try to update the data store when it is available again"
            );
            EventOutcome::Continue
        } else {
            tracing::error!(
                environment = %self.environment,
                "Failed to store {description} in data store; will restart stream until successful"
            );
            EventOutcome::Restart
        }
    }

    async fn malformed_event(&self, event: &str, err: ProtocolError) -> EventOutcome {
        counter!(STREAM_MALFORMED_EVENTS).increment(1);
        tracing::error!(
            environment = %self.environment,
            error = %err,
            "Received streaming \"{event}\" event with malformed data; will restart stream"
        );
        let info = DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, err.to_string());
        self.updates
            .update_status(DataSourceState::Interrupted, Some(info))
            .await;
        EventOutcome::Restart
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_initialized(&self, ready: &ReadySignal) {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            tracing::info!(environment = %self.environment, "Stream initialized");
        }
        ready.signal();
    }
}
