use serde::{Deserialize, Serialize};

use crate::types::{Booking, ClassSession};
use crate::waitlist::SessionLedger;

/// A session as the catalog shows it, with enrollment derived from its bookings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub session: ClassSession,
    pub enrolled: u32,
    pub waitlisted: u32,
}

impl SessionView {
    #[must_use]
    pub fn from_bookings<'a>(
        session: ClassSession,
        bookings: impl IntoIterator<Item = &'a Booking>,
    ) -> Self {
        let (enrolled, waitlisted) =
            bookings
                .into_iter()
                .fold((0_u32, 0_u32), |(enrolled, waitlisted), booking| {
                    (
                        enrolled + u32::from(booking.is_confirmed()),
                        waitlisted + u32::from(booking.is_waitlisted()),
                    )
                });
        Self {
            session,
            enrolled,
            waitlisted,
        }
    }

    #[must_use]
    pub const fn has_free_seat(&self) -> bool {
        self.enrolled < self.session.capacity
    }
}

impl From<&SessionLedger> for SessionView {
    fn from(ledger: &SessionLedger) -> Self {
        Self::from_bookings(ledger.session().clone(), ledger.bookings())
    }
}
