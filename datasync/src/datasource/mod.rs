//! Data sources keep the store synchronized with the upstream service.

pub mod backoff;
pub mod polling;
pub mod protocol;
pub mod requestor;
pub mod sse;
pub mod streaming;

use crate::errors::RequestError;
use crate::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use crate::updates::DataSourceUpdates;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

pub const USER_AGENT: &str = concat!("FlagRelay/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait DataSource: Send + Sync {
    /// Spawns the background worker. `ready` fires after the first
    /// successful synchronization, or once the data source gives up.
    fn start(&self, ready: ReadySignal);

    fn is_initialized(&self) -> bool;

    /// Stops the worker and reports `Off`. Safe to call more than once.
    async fn close(&self);
}

/// Fires at most once; later calls are ignored.
#[derive(Clone)]
pub struct ReadySignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadySignal {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (ReadySignal { tx: Arc::new(tx) }, rx)
    }

    pub fn signal(&self) {
        self.tx.send_if_modified(|ready| !std::mem::replace(ready, true));
    }
}

/// 400, 408 and 429 are worth retrying, every other client error is not.
pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

pub(crate) fn http_error_description(status: u16) -> String {
    match status {
        401 | 403 => format!("HTTP error {status} (invalid SDK key)"),
        _ => format!("HTTP error {status}"),
    }
}

/// Logs a failed request and records it as a status change. Returns whether
/// the data source should keep retrying; if not, the state is now `Off`.
pub(crate) async fn report_request_error(
    updates: &DataSourceUpdates,
    environment: &str,
    context: &str,
    err: &RequestError,
) -> bool {
    let (info, description, recoverable) = match err {
        RequestError::Status(code) => (
            DataSourceErrorInfo::http(*code),
            http_error_description(*code),
            is_http_error_recoverable(*code),
        ),
        RequestError::Network(e) => (
            DataSourceErrorInfo::new(DataSourceErrorKind::NetworkError, e.to_string()),
            e.to_string(),
            true,
        ),
        RequestError::InvalidData(e) => (
            DataSourceErrorInfo::new(DataSourceErrorKind::InvalidData, e.to_string()),
            e.to_string(),
            true,
        ),
    };

    if recoverable {
        tracing::warn!(%environment, "Error {context} (will retry): {description}");
        updates
            .update_status(DataSourceState::Interrupted, Some(info))
            .await;
    } else {
        tracing::error!(%environment, "Error {context} (giving up permanently): {description}");
        updates.update_status(DataSourceState::Off, Some(info)).await;
    }
    recoverable
}
