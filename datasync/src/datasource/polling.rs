use crate::config::PollingConfig;
use crate::datasource::requestor::{PollResult, Requestor};
use crate::datasource::{DataSource, ReadySignal, report_request_error};
use crate::errors::ValidationError;
use crate::metrics_defs::{POLL_NOT_MODIFIED, POLL_REQUESTS};
use crate::status::DataSourceState;
use crate::updates::DataSourceUpdates;
use async_trait::async_trait;
use shared::counter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

const POLL_ERROR_CONTEXT: &str = "on polling request";

/// Fetches the full data set on a fixed interval.
pub struct PollingProcessor {
    inner: Arc<PollingInner>,
}

struct PollingInner {
    environment: String,
    requestor: Requestor,
    poll_interval: Duration,
    updates: Arc<DataSourceUpdates>,
    initialized: AtomicBool,
    halt: watch::Sender<bool>,
    closed: AtomicBool,
}

impl PollingProcessor {
    pub fn new(
        environment: &str,
        client: reqwest::Client,
        sdk_key: &str,
        config: &PollingConfig,
        updates: Arc<DataSourceUpdates>,
    ) -> Result<Self, ValidationError> {
        let requestor = Requestor::new(client, &config.base_uri, sdk_key)?;
        Ok(Self::with_requestor(
            environment,
            requestor,
            config.poll_interval(),
            updates,
        ))
    }

    /// Skips the lower bound on the interval.
    pub(crate) fn with_requestor(
        environment: &str,
        requestor: Requestor,
        poll_interval: Duration,
        updates: Arc<DataSourceUpdates>,
    ) -> Self {
        let (halt, _) = watch::channel(false);
        PollingProcessor {
            inner: Arc::new(PollingInner {
                environment: environment.to_string(),
                requestor,
                poll_interval,
                updates,
                initialized: AtomicBool::new(false),
                halt,
                closed: AtomicBool::new(false),
            }),
        }
    }
}

#[async_trait]
impl DataSource for PollingProcessor {
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

impl PollingInner {
    async fn run(self: Arc<Self>, ready: ReadySignal) {
        let mut halt = self.halt.subscribe();
        if *halt.borrow() {
            return;
        }
        tracing::info!(
            environment = %self.environment,
            interval = ?self.poll_interval,
            "Starting polling"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = halt.changed() => break,
                _ = ticker.tick() => {
                    // A request in flight is abandoned as soon as we are closed.
                    let keep_polling = tokio::select! {
                        _ = halt.changed() => break,
                        keep_polling = self.poll(&ready) => keep_polling,
                    };
                    if !keep_polling {
                        ready.signal();
                        break;
                    }
                }
            }
        }
        tracing::debug!(environment = %self.environment, "Polling stopped");
    }

    /// Returns false once polling should stop for good.
    async fn poll(&self, ready: &ReadySignal) -> bool {
        counter!(POLL_REQUESTS).increment(1);
        let result = self.requestor.request_all().await;
        if self.is_closed() {
            return false;
        }
        match result {
            Ok(PollResult::NotModified) => {
                counter!(POLL_NOT_MODIFIED).increment(1);
                tracing::debug!(environment = %self.environment, "Data set not modified");
                self.updates
                    .update_status(DataSourceState::Valid, None)
                    .await;
                self.set_initialized(ready);
                true
            }
            Ok(PollResult::Updated(collections)) => {
                if self.updates.init(collections).await {
                    self.updates
                        .update_status(DataSourceState::Valid, None)
                        .await;
                    self.set_initialized(ready);
                } else {
                    // The store missed this snapshot, so the next poll must
                    // not be answered with 304.
                    self.requestor.reset_cache();
                }
                true
            }
            Err(err) => {
                report_request_error(&self.updates, &self.environment, POLL_ERROR_CONTEXT, &err)
                    .await
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn set_initialized(&self, ready: &ReadySignal) {
        if !self.initialized.swap(true, Ordering::AcqRel) {
            tracing::info!(environment = %self.environment, "First polling request successful");
        }
        ready.signal();
    }
}
