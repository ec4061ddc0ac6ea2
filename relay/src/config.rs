use datasync::EnvironmentConfig;
use datasync::errors::ValidationError;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs::File;

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 3000,
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub admin_listener: Listener,
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
    pub environments: Vec<EnvironmentConfig>,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admin_listener.port == 0 {
            return Err(ConfigError::InvalidListenerPort);
        }
        if self.environments.is_empty() {
            return Err(ConfigError::NoEnvironments);
        }
        let mut names = HashSet::new();
        for env in &self.environments {
            env.validate()?;
            if !names.insert(env.name.as_str()) {
                return Err(ConfigError::DuplicateEnvironment(env.name.clone()));
            }
        }
        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid environment: {0}")]
    InvalidEnvironment(#[from] ValidationError),
    #[error("environment {0} is configured more than once")]
    DuplicateEnvironment(String),
    #[error("no environments configured")]
    NoEnvironments,
    #[error("admin listener port must not be 0")]
    InvalidListenerPort,
}
