mod config;

use clap::Parser;
use config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use datasync::EnvironmentClient;
use datasync::errors::ValidationError;
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use serde_json::Value;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use shared::metrics_defs::describe_metrics;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const METRICS_PREFIX: &str = "flag_relay";
const READY_WARNING_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(version, about = "Keeps local replicas of feature flag environments in sync")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short, default_value = "relay.yaml")]
    config: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum RelayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not start environment: {0}")]
    Environment(#[from] ValidationError),
    #[error("could not set up statsd: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderAlreadySet,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Sentry has to be set up before the runtime starts its threads.
    let _sentry = init_logging(config.logging.as_ref());

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Relay stopped");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: Option<&LoggingConfig>) -> Option<sentry::ClientInitGuard> {
    let guard = config.map(|logging| {
        sentry::init((
            logging.sentry_dsn.as_str(),
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(guard.as_ref().map(|_| sentry::integrations::tracing::layer()))
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), RelayError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(METRICS_PREFIX))?;
    metrics::set_global_recorder(recorder).map_err(|_| RelayError::RecorderAlreadySet)?;
    describe_metrics(datasync::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Sending metrics to statsd"
    );
    Ok(())
}

fn run(config: Config) -> Result<(), RelayError> {
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_async(config))
}

fn status_of(clients: &[EnvironmentClient]) -> Value {
    Value::Object(
        clients
            .iter()
            .filter_map(|client| {
                let report = serde_json::to_value(client.status_report()).ok()?;
                Some((client.name().to_string(), report))
            })
            .collect(),
    )
}

async fn run_async(config: Config) -> Result<(), RelayError> {
    let mut clients = Vec::with_capacity(config.environments.len());
    for env in &config.environments {
        clients.push(EnvironmentClient::new(env)?);
    }
    let clients = Arc::new(clients);

    let watched = clients.clone();
    tokio::spawn(async move {
        for client in watched.iter() {
            if client.wait_until_ready(READY_WARNING_TIMEOUT).await {
                tracing::info!(environment = client.name(), "Environment ready");
            } else {
                tracing::warn!(
                    environment = client.name(),
                    "Environment not ready after {READY_WARNING_TIMEOUT:?}; still trying"
                );
            }
        }
    });

    let ready_clients = clients.clone();
    let status_clients = clients.clone();
    let admin = AdminService::new(
        move || ready_clients.iter().all(|c| c.is_initialized()),
        move || status_of(&status_clients),
    );
    let host = config.admin_listener.host.clone();
    let port = config.admin_listener.port;
    let admin_task =
        tokio::spawn(async move { run_http_service::<_, std::io::Error>(&host, port, admin).await });

    let result = tokio::select! {
        joined = admin_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::Io(e)),
            Err(e) => Err(RelayError::Io(std::io::Error::other(e))),
        },
        signal = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            signal.map_err(RelayError::Io)
        }
    };

    for client in clients.iter() {
        client.close().await;
    }
    result
}
