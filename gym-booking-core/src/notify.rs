use async_trait::async_trait;
use tracing::info;

use crate::store::SeatAvailable;

#[derive(thiserror::Error, Debug)]
#[error("notification delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Outbound "a seat became available" signal, e.g. a push notification dispatcher.
#[async_trait]
pub trait SeatNotifier: Send + Sync + 'static {
    async fn seat_available(&self, notice: &SeatAvailable) -> Result<(), NotifyError>;
}

/// Writes the notice to the log, for deployments without a push dispatcher.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl SeatNotifier for LogNotifier {
    async fn seat_available(&self, notice: &SeatAvailable) -> Result<(), NotifyError> {
        info!(
            user = %notice.user,
            session = %notice.session,
            booking = %notice.booking,
            "seat available"
        );
        Ok(())
    }
}
