//! Escalates a data source outage to an error log once it has lasted too long.

use crate::status::{DataSourceErrorInfo, DataSourceErrorKind, DataSourceState};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ErrorKey {
    kind: DataSourceErrorKind,
    status_code: Option<u16>,
}

impl fmt::Display for ErrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "{}({code})", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

type ErrorCounts = BTreeMap<ErrorKey, u32>;

fn describe_errors(counts: &ErrorCounts) -> String {
    counts
        .iter()
        .map(|(key, count)| {
            let plural = if *count == 1 { "time" } else { "times" };
            format!("{key} ({count} {plural})")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

struct Outage {
    errors: Arc<Mutex<ErrorCounts>>,
    // Dropped when the outage ends, which cancels the escalation timer.
    _halt: oneshot::Sender<()>,
}

pub(crate) struct OutageTracker {
    environment: String,
    timeout: Duration,
    current: Mutex<Option<Outage>>,
    escalations: Arc<AtomicUsize>,
}

impl OutageTracker {
    /// A zero `timeout` disables escalation.
    pub(crate) fn new(environment: &str, timeout: Duration) -> Self {
        OutageTracker {
            environment: environment.to_string(),
            timeout,
            current: Mutex::new(None),
            escalations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Feeds one status update into the tracker. An outage starts with the
    /// first interruption or error and ends with the next update that carries
    /// neither.
    pub(crate) fn track(&self, state: DataSourceState, error: Option<&DataSourceErrorInfo>) {
        if self.timeout.is_zero() {
            return;
        }
        let mut current = self.current.lock();
        let in_outage = state == DataSourceState::Interrupted
            || error.is_some()
            || (state == DataSourceState::Initializing && current.is_some());
        if !in_outage {
            *current = None;
            return;
        }

        let outage = current.get_or_insert_with(|| self.start_outage());
        if let Some(error) = error {
            let key = ErrorKey {
                kind: error.kind,
                status_code: error.status_code,
            };
            *outage.errors.lock().entry(key).or_default() += 1;
        }
    }

    fn start_outage(&self) -> Outage {
        let errors = Arc::new(Mutex::new(ErrorCounts::new()));
        let (halt_tx, halt_rx) = oneshot::channel::<()>();

        let timeout = self.timeout;
        let environment = self.environment.clone();
        let counts = errors.clone();
        let escalations = self.escalations.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = halt_rx => {}
                _ = tokio::time::sleep(timeout) => {
                    let description = describe_errors(&counts.lock());
                    escalations.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        environment = %environment,
                        "Upstream connection has not been re-established within {:?} after it was interrupted. Errors encountered: {}",
                        timeout,
                        description,
                    );
                }
            }
        });

        Outage {
            errors,
            _halt: halt_tx,
        }
    }

    #[cfg(test)]
    fn escalations(&self) -> usize {
        self.escalations.load(Ordering::Relaxed)
    }
}
