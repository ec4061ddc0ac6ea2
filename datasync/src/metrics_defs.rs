//! Metrics definitions for the synchronization core.

use shared::metrics_defs::{MetricDef, MetricType};

pub const STREAM_CONNECTION_ATTEMPTS: MetricDef = MetricDef {
    name: "stream.connection.attempts",
    metric_type: MetricType::Counter,
    description: "Number of attempts to open the upstream stream",
};

pub const STREAM_EVENTS: MetricDef = MetricDef {
    name: "stream.events",
    metric_type: MetricType::Counter,
    description: "Number of stream events received, tagged by event type",
};

pub const STREAM_CONNECT_DURATION: MetricDef = MetricDef {
    name: "stream.connect.duration",
    metric_type: MetricType::Histogram,
    description: "Time in seconds until the upstream stream accepted the connection",
};

pub const STREAM_MALFORMED_EVENTS: MetricDef = MetricDef {
    name: "stream.events.malformed",
    metric_type: MetricType::Counter,
    description: "Number of stream events that could not be parsed",
};

pub const POLL_REQUESTS: MetricDef = MetricDef {
    name: "poll.requests",
    metric_type: MetricType::Counter,
    description: "Number of snapshot poll requests sent upstream",
};

pub const POLL_NOT_MODIFIED: MetricDef = MetricDef {
    name: "poll.not_modified",
    metric_type: MetricType::Counter,
    description: "Number of poll requests answered with an unchanged snapshot",
};

pub const PERSISTENT_STORE_READS: MetricDef = MetricDef {
    name: "persistent_store.core.reads",
    metric_type: MetricType::Counter,
    description: "Number of reads that reached the persistent store core",
};

pub const INIT_CHECK_CACHE_HIT: MetricDef = MetricDef {
    name: "persistent_store.init_check.cache_hit",
    metric_type: MetricType::Counter,
    description: "Number of initialization checks answered by the negative cache",
};

pub const INIT_CHECK_CACHE_MISS: MetricDef = MetricDef {
    name: "persistent_store.init_check.cache_miss",
    metric_type: MetricType::Counter,
    description: "Number of initialization checks that missed the negative cache",
};

pub const STORE_ERRORS: MetricDef = MetricDef {
    name: "store.errors",
    metric_type: MetricType::Counter,
    description: "Number of data store write failures",
};

pub const DATA_SOURCE_STATE: MetricDef = MetricDef {
    name: "data_source.state",
    metric_type: MetricType::Gauge,
    description: "Current data source state per environment (0 initializing, 1 valid, 2 interrupted, 3 off)",
};

pub const FLAG_CHANGE_EVENTS: MetricDef = MetricDef {
    name: "flag_change.events",
    metric_type: MetricType::Counter,
    description: "Number of flag change events published to listeners",
};

pub const ALL_METRICS: &[MetricDef] = &[
    STREAM_CONNECTION_ATTEMPTS,
    STREAM_EVENTS,
    STREAM_CONNECT_DURATION,
    STREAM_MALFORMED_EVENTS,
    POLL_REQUESTS,
    POLL_NOT_MODIFIED,
    PERSISTENT_STORE_READS,
    INIT_CHECK_CACHE_HIT,
    INIT_CHECK_CACHE_MISS,
    STORE_ERRORS,
    DATA_SOURCE_STATE,
    FLAG_CHANGE_EVENTS,
];
