use core::time::Duration;
use std::sync::Arc;

use gym_booking_backend::{run_server, AppError};
use gym_booking_config::{get_config, Config};
use gym_booking_core::clock::SystemClock;
use gym_booking_core::memory::MemoryStore;
use gym_booking_core::notify::LogNotifier;
use gym_booking_core::policy::Policy;
use gym_booking_core::store::BookingStore;
use gym_booking_core::BookingService;
use gym_booking_database::PgStore;
use gym_booking_telemetry::setup_telemetry;
use tracing::{info, warn};

async fn start<S: BookingStore>(store: Arc<S>, config: &Config) -> Result<(), AppError> {
    let policy = Policy::from_config(&config.policy)?;
    let service = Arc::new(BookingService::new(
        store,
        Arc::new(LogNotifier),
        Arc::new(SystemClock),
        policy,
    ));
    let flush_every = Duration::from_secs(config.notification_flush_seconds.max(1));
    run_server(service, config.listen_address, flush_every)
        .await?
        .await
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    setup_telemetry()?;
    let config = get_config()?;

    match &config.database_url {
        Some(database_url) => {
            let store = PgStore::from_url(database_url)?;
            store.migrate().await?;
            info!("using postgres store");
            start(Arc::new(store), &config).await
        }
        None => {
            warn!("no database_url configured, bookings only live in memory");
            start(Arc::new(MemoryStore::new()), &config).await
        }
    }
}
