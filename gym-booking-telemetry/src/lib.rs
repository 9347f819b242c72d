use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
pub use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, Layer};

/// Used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_LOG_LEVEL: &str =
    "info,gym_booking_core=debug,gym_booking_backend=debug,hyper=info,diesel_async=info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_LEVEL.into())
}

/// Installs the global subscriber: human readable lines on stdout, filtered by `RUST_LOG`.
pub fn setup_telemetry() -> Result<(), TryInitError> {
    let stdout_log = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(stdout_log.with_filter(filter()))
        .try_init()?;
    tracing::debug!("telemetry installed");
    Ok(())
}
