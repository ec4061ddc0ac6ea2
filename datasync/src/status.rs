//! Status of the upstream synchronization channel.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceState {
    /// Not yet synchronized since startup.
    Initializing,
    Valid,
    /// Was valid, currently failing and retrying.
    Interrupted,
    /// Permanently stopped, either closed or after an unrecoverable error.
    Off,
}

impl DataSourceState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DataSourceState::Initializing => "INITIALIZING",
            DataSourceState::Valid => "VALID",
            DataSourceState::Interrupted => "INTERRUPTED",
            DataSourceState::Off => "OFF",
        }
    }

    /// Reported through the state gauge: 0 starting, 1 valid, 2 interrupted,
    /// 3 off.
    pub const fn as_gauge_value(&self) -> f64 {
        match self {
            DataSourceState::Initializing => 0.0,
            DataSourceState::Valid => 1.0,
            DataSourceState::Interrupted => 2.0,
            DataSourceState::Off => 3.0,
        }
    }
}

impl fmt::Display for DataSourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSourceErrorKind {
    Unknown,
    /// The connection failed or dropped before an HTTP status was received.
    NetworkError,
    /// The service answered with an error status.
    ErrorResponse,
    /// A payload could not be parsed.
    InvalidData,
    /// The data store rejected a write.
    StoreError,
}

impl DataSourceErrorKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DataSourceErrorKind::Unknown => "UNKNOWN",
            DataSourceErrorKind::NetworkError => "NETWORK_ERROR",
            DataSourceErrorKind::ErrorResponse => "ERROR_RESPONSE",
            DataSourceErrorKind::InvalidData => "INVALID_DATA",
            DataSourceErrorKind::StoreError => "STORE_ERROR",
        }
    }
}

impl fmt::Display for DataSourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceErrorInfo {
    pub kind: DataSourceErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub message: String,
    #[serde(serialize_with = "serialize_epoch_millis")]
    pub time: SystemTime,
}

impl DataSourceErrorInfo {
    pub fn new<M: Into<String>>(kind: DataSourceErrorKind, message: M) -> Self {
        DataSourceErrorInfo {
            kind,
            status_code: None,
            message: message.into(),
            time: SystemTime::now(),
        }
    }

    pub fn http(status_code: u16) -> Self {
        DataSourceErrorInfo {
            status_code: Some(status_code),
            ..Self::new(DataSourceErrorKind::ErrorResponse, "")
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    #[serde(serialize_with = "serialize_epoch_millis")]
    pub state_since: SystemTime,
    pub last_error: Option<DataSourceErrorInfo>,
}

impl DataSourceStatus {
    pub fn initializing() -> Self {
        DataSourceStatus {
            state: DataSourceState::Initializing,
            state_since: SystemTime::now(),
            last_error: None,
        }
    }
}

/// Published when a flag, or anything it depends on, changed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FlagChangeEvent {
    pub key: String,
}

fn serialize_epoch_millis<S: Serializer>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let millis = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    serializer.serialize_u64(millis)
}
