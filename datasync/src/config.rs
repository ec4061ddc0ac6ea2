use crate::errors::ValidationError;
use crate::store::persistent::CacheMode;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Polling more often than this is not allowed.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(30);

fn default_initial_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_cache_ttl_secs() -> i64 {
    30
}

fn default_outage_logging_timeout_secs() -> u64 {
    60
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct StreamingConfig {
    pub stream_uri: Url,
    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_secs")]
    pub max_reconnect_delay_secs: u64,
    /// A connection that delivers nothing, not even a heartbeat, for this
    /// long is considered stalled.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl StreamingConfig {
    pub fn new(stream_uri: Url) -> Self {
        StreamingConfig {
            stream_uri,
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_secs: default_max_reconnect_delay_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }

    pub fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.max_reconnect_delay_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct PollingConfig {
    pub base_uri: Url,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl PollingConfig {
    /// The configured interval, raised to [`MIN_POLL_INTERVAL`] if lower.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs).max(MIN_POLL_INTERVAL)
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "mode")]
pub enum DataSourceConfig {
    Streaming(StreamingConfig),
    Polling(PollingConfig),
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct StoreConfig {
    /// `0` disables caching, a negative value caches forever.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,
}

impl StoreConfig {
    pub fn cache_mode(&self) -> CacheMode {
        CacheMode::from_secs(self.cache_ttl_secs)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct EnvironmentConfig {
    pub name: String,
    pub sdk_key: String,
    pub data_source: DataSourceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    /// How long an outage may last before it is logged as an error. `0`
    /// disables escalation.
    #[serde(default = "default_outage_logging_timeout_secs")]
    pub outage_logging_timeout_secs: u64,
}

impl EnvironmentConfig {
    pub fn outage_logging_timeout(&self) -> Duration {
        Duration::from_secs(self.outage_logging_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyEnvironmentName);
        }
        if self.sdk_key.trim().is_empty() {
            return Err(ValidationError::EmptySdkKey(self.name.clone()));
        }
        let uri = match &self.data_source {
            DataSourceConfig::Streaming(streaming) => &streaming.stream_uri,
            DataSourceConfig::Polling(polling) => &polling.base_uri,
        };
        if uri.cannot_be_a_base() {
            return Err(ValidationError::InvalidBaseUri(uri.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_streaming_defaults() {
        let yaml = r#"
name: production
sdk_key: sdk-123
data_source:
  mode: streaming
  stream_uri: https://stream.example.com
"#;
        let config: EnvironmentConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let DataSourceConfig::Streaming(streaming) = &config.data_source else {
            panic!("expected streaming");
        };
        assert_eq!(streaming.initial_reconnect_delay(), Duration::from_secs(1));
        assert_eq!(streaming.max_reconnect_delay(), Duration::from_secs(30));
        assert_eq!(streaming.read_timeout(), Duration::from_secs(300));
        assert_eq!(
            config.store.cache_mode(),
            CacheMode::Ttl(Duration::from_secs(30))
        );
        assert_eq!(config.outage_logging_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_polling_interval_is_clamped() {
        let yaml = r#"
name: staging
sdk_key: sdk-456
data_source:
  mode: polling
  base_uri: https://sdk.example.com
  poll_interval_secs: 5
store:
  cache_ttl_secs: -1
"#;
        let config: EnvironmentConfig = serde_yaml::from_str(yaml).unwrap();
        let DataSourceConfig::Polling(polling) = &config.data_source else {
            panic!("expected polling");
        };
        assert_eq!(polling.poll_interval(), MIN_POLL_INTERVAL);
        assert_eq!(config.store.cache_mode(), CacheMode::Forever);
    }

    #[test]
    fn test_validate() {
        let mut config = EnvironmentConfig {
            name: "prod".into(),
            sdk_key: " ".into(),
            data_source: DataSourceConfig::Streaming(StreamingConfig::new(
                Url::parse("https://stream.example.com").unwrap(),
            )),
            store: StoreConfig::default(),
            outage_logging_timeout_secs: 0,
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::EmptySdkKey("prod".into()))
        );

        config.sdk_key = "key".into();
        config.data_source = DataSourceConfig::Polling(PollingConfig {
            base_uri: Url::parse("mailto:ops@example.com").unwrap(),
            poll_interval_secs: 30,
        });
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidBaseUri(_))
        ));

        config.name = String::new();
        assert_eq!(config.validate(), Err(ValidationError::EmptyEnvironmentName));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let yaml = r#"
name: production
sdk_key: sdk-123
data_source:
  mode: carrier-pigeon
"#;
        assert!(serde_yaml::from_str::<EnvironmentConfig>(yaml).is_err());
    }
}
