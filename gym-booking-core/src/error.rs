use chrono::{DateTime, Utc};

use crate::types::{BookingStatus, SessionId};

/// Failure of the backing store. The whole operation may be retried from scratch.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct StoreError(String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BookingError {
    #[error("you already hold a booking for this class")]
    AlreadyBooked,
    #[error("no active booking for this class")]
    BookingNotFound,
    #[error("your account is blocked until {until}")]
    UserBlocked { until: DateTime<Utc> },
    #[error("the class is full")]
    SessionFull,
    #[error("your membership does not include this class")]
    IneligibleSubscription,
    #[error("class {0} does not exist")]
    SessionNotFound(SessionId),
    #[error("an active membership is required")]
    NoActiveMembership,
    #[error("the monthly class quota is used up")]
    QuotaExhausted,
    #[error("the ticket has no sessions left")]
    TicketExhausted,
    #[error("classes can no longer be switched this close to the start")]
    SwitchWindowClosed,
    #[error("classes can only be switched within the same day")]
    NotSameDay,
    #[error("cannot switch a class with itself")]
    SameSession,
    #[error("registration for this class opens at {opens_at}")]
    RegistrationNotOpen { opens_at: DateTime<Utc> },
    #[error("the confirmation belongs to a different booking")]
    ConsentMismatch,
    #[error("not permitted")]
    NotPermitted,
    #[error("booking cannot change from {from} to {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("nobody is waiting for this class")]
    WaitlistEmpty,
    #[error("attendance can be recorded once the class started at {starts_at}")]
    ClassNotStarted { starts_at: DateTime<Utc> },
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl BookingError {
    /// Stable machine readable name.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyBooked => "already_booked",
            Self::BookingNotFound => "booking_not_found",
            Self::UserBlocked { .. } => "user_blocked",
            Self::SessionFull => "session_full",
            Self::IneligibleSubscription => "ineligible_subscription",
            Self::SessionNotFound(_) => "session_not_found",
            Self::NoActiveMembership => "no_active_membership",
            Self::QuotaExhausted => "quota_exhausted",
            Self::TicketExhausted => "ticket_exhausted",
            Self::SwitchWindowClosed => "switch_window_closed",
            Self::NotSameDay => "not_same_day",
            Self::SameSession => "same_session",
            Self::RegistrationNotOpen { .. } => "registration_not_open",
            Self::ConsentMismatch => "consent_mismatch",
            Self::NotPermitted => "not_permitted",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::WaitlistEmpty => "waitlist_empty",
            Self::ClassNotStarted { .. } => "class_not_started",
            Self::Store(_) => "store_failure",
        }
    }

    /// Policy decisions are final, only store failures are worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}
