//! Keeps a local replica of feature flags and segments in sync with the
//! upstream flag service, either over a server-sent events stream or by
//! polling, and reports how healthy that replica is.

pub mod broadcaster;
pub mod client;
pub mod config;
pub mod datasource;
pub mod dependency_tracker;
pub mod errors;
pub mod kinds;
pub mod metrics_defs;
pub mod model;
mod outage;
pub mod status;
pub mod store;
pub mod updates;

#[cfg(test)]
pub(crate) mod testutils;

pub use client::{EnvironmentClient, StatusReport};
pub use config::EnvironmentConfig;
