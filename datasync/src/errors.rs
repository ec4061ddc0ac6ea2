use crate::kinds::DataKind;

/// Errors surfaced by a data store.
///
/// `Clone` because a single failed core read is handed to every caller that
/// was coalesced onto it.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("persistent store error: {0}")]
    Backend(String),

    #[error("could not serialize {kind} item {key}: {message}")]
    Serialize {
        kind: DataKind,
        key: String,
        message: String,
    },

    #[error("could not deserialize {kind} item: {message}")]
    Deserialize { kind: DataKind, message: String },
}

/// A stream or poll payload that could not be understood.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("malformed JSON data in {event} event: {source}")]
    Json {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed {kind} item {key} in {event} event: {source}")]
    Item {
        event: &'static str,
        kind: DataKind,
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{event} event is missing its path")]
    MissingPath { event: &'static str },
}

/// Failure of a single upstream HTTP request.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("HTTP error {0}")]
    Status(u16),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid response body: {0}")]
    InvalidData(#[from] ProtocolError),
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("environment name cannot be empty")]
    EmptyEnvironmentName,

    #[error("SDK key cannot be empty for environment {0}")]
    EmptySdkKey(String),

    #[error("URI {0} cannot be used as a base URI")]
    InvalidBaseUri(String),
}
