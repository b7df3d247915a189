use crate::config::CommonConfig;
use metrics_exporter_statsd::{StatsdBuilder, StatsdError};
use shared::metrics_defs::describe_all;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const METRICS_PREFIX: &str = "enroller";

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("could not install log subscriber: {0}")]
    Subscriber(#[from] TryInitError),
    #[error("could not build statsd recorder: {0}")]
    Statsd(#[from] StatsdError),
    #[error("a metrics recorder is already installed")]
    RecorderInstalled,
}

/// Keeps Sentry alive until the process exits.
pub struct TelemetryGuard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Installs logging, Sentry error reporting and the statsd recorder.
pub fn init(config: &CommonConfig) -> Result<TelemetryGuard, TelemetryError> {
    let sentry_guard = config.logging.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.logging.level)?,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_guard.is_some().then(|| sentry::integrations::tracing::layer()))
        .try_init()?;

    if let Some(metrics_config) = &config.metrics {
        let recorder =
            StatsdBuilder::from(metrics_config.statsd_host.clone(), metrics_config.statsd_port)
                .build(Some(METRICS_PREFIX))?;
        metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;

        describe_all(enrollment::metrics_defs::ALL_METRICS);
        describe_all(crm::metrics_defs::ALL_METRICS);

        tracing::info!(
            host = %metrics_config.statsd_host,
            port = metrics_config.statsd_port,
            "Sending metrics to statsd"
        );
    }

    Ok(TelemetryGuard {
        _sentry: sentry_guard,
    })
}
