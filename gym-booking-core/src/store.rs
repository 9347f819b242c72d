use alloc::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::SessionView;
use crate::error::{BookingError, StoreError};
use crate::membership::Membership;
use crate::penalty::PenaltyState;
use crate::types::{Booking, BookingId, ClassSession, NotificationId, SessionId, UserId};
use crate::waitlist::{BookingChange, SessionLedger};

/// "A seat became available for this user on this session", queued together with the
/// promotion that caused it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAvailable {
    pub id: NotificationId,
    pub booking: BookingId,
    pub user: UserId,
    pub session: SessionId,
    pub promoted_at: DateTime<Utc>,
}

impl SeatAvailable {
    #[must_use]
    pub fn for_promotion(booking: &Booking, now: DateTime<Utc>) -> Self {
        Self {
            id: NotificationId::random(),
            booking: booking.id,
            user: booking.user,
            session: booking.session,
            promoted_at: now,
        }
    }
}

/// What a transaction locks and loads.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Scope {
    sessions: Vec<SessionId>,
    user: Option<UserId>,
}

impl Scope {
    #[must_use]
    pub fn session(session: SessionId) -> Self {
        Self::sessions([session])
    }

    /// Sessions are kept sorted so concurrent transactions lock them in the same order.
    #[must_use]
    pub fn sessions(sessions: impl IntoIterator<Item = SessionId>) -> Self {
        let mut sessions: Vec<SessionId> = sessions.into_iter().collect();
        sessions.sort_unstable();
        sessions.dedup();
        Self {
            sessions,
            user: None,
        }
    }

    #[must_use]
    pub fn user(user: UserId) -> Self {
        Self {
            sessions: Vec::new(),
            user: Some(user),
        }
    }

    #[must_use]
    pub const fn with_user(mut self, user: UserId) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn session_ids(&self) -> &[SessionId] {
        &self.sessions
    }

    #[must_use]
    pub const fn user_id(&self) -> Option<UserId> {
        self.user
    }
}

/// Everything a transaction has to write, produced only when the work succeeded.
#[derive(Clone, Debug, Default)]
pub struct Changes {
    pub bookings: Vec<BookingChange>,
    pub penalty: Option<PenaltyState>,
    pub membership: Option<Membership>,
    pub notifications: Vec<SeatAvailable>,
}

impl Changes {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
            && self.penalty.is_none()
            && self.membership.is_none()
            && self.notifications.is_empty()
    }
}

/// Snapshot of the locked records. Policy code mutates it synchronously; the store persists
/// [`UnitOfWork::into_changes`] in the same transaction or discards it.
#[derive(Debug)]
pub struct UnitOfWork {
    now: DateTime<Utc>,
    ledgers: BTreeMap<SessionId, SessionLedger>,
    penalty: Option<PenaltyState>,
    membership: Option<Membership>,
    penalty_changed: bool,
    membership_changed: bool,
    notifications: Vec<SeatAvailable>,
}

impl UnitOfWork {
    #[must_use]
    pub fn new(
        now: DateTime<Utc>,
        ledgers: impl IntoIterator<Item = SessionLedger>,
        penalty: Option<PenaltyState>,
        membership: Option<Membership>,
    ) -> Self {
        Self {
            now,
            ledgers: ledgers
                .into_iter()
                .map(|ledger| (ledger.session().id, ledger))
                .collect(),
            penalty,
            membership,
            penalty_changed: false,
            membership_changed: false,
            notifications: Vec::new(),
        }
    }

    #[must_use]
    pub const fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn ledger(&self, session: SessionId) -> Result<&SessionLedger, BookingError> {
        self.ledgers
            .get(&session)
            .ok_or(BookingError::SessionNotFound(session))
    }

    pub fn ledger_mut(&mut self, session: SessionId) -> Result<&mut SessionLedger, BookingError> {
        self.ledgers
            .get_mut(&session)
            .ok_or(BookingError::SessionNotFound(session))
    }

    pub fn penalty(&self) -> Result<&PenaltyState, BookingError> {
        self.penalty
            .as_ref()
            .ok_or_else(|| StoreError::new("penalty state was not loaded").into())
    }

    pub fn penalty_mut(&mut self) -> Result<&mut PenaltyState, BookingError> {
        let penalty = self
            .penalty
            .as_mut()
            .ok_or_else(|| StoreError::new("penalty state was not loaded"))?;
        self.penalty_changed = true;
        Ok(penalty)
    }

    #[must_use]
    pub const fn membership(&self) -> Option<&Membership> {
        self.membership.as_ref()
    }

    pub fn membership_mut(&mut self) -> Option<&mut Membership> {
        let membership = self.membership.as_mut()?;
        self.membership_changed = true;
        Some(membership)
    }

    pub fn notify(&mut self, notice: SeatAvailable) {
        self.notifications.push(notice);
    }

    #[must_use]
    pub fn into_changes(self) -> Changes {
        let Self {
            ledgers,
            penalty,
            membership,
            penalty_changed,
            membership_changed,
            notifications,
            ..
        } = self;
        Changes {
            bookings: ledgers.values().flat_map(SessionLedger::changes).collect(),
            penalty: penalty.filter(|_| penalty_changed),
            membership: membership.filter(|_| membership_changed),
            notifications,
        }
    }
}

/// The persistent store holding sessions, bookings, penalty states and memberships.
#[async_trait]
pub trait BookingStore: Send + Sync + 'static {
    async fn session(&self, id: SessionId) -> Result<Option<ClassSession>, StoreError>;

    /// Sessions starting in `[from, to)` with derived enrollment.
    async fn sessions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionView>, StoreError>;

    /// All bookings of a session, waitlisted ones ordered by position.
    async fn session_bookings(&self, session: SessionId) -> Result<Vec<Booking>, StoreError>;

    async fn booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;

    /// Users without a row have a clean state.
    async fn penalty(&self, user: UserId) -> Result<PenaltyState, StoreError>;

    async fn membership(&self, user: UserId) -> Result<Option<Membership>, StoreError>;

    /// Locks `scope`, runs `work` on the snapshot and persists its changes atomically.
    /// An `Err` from `work` leaves the store untouched.
    async fn transact<T, F>(
        &self,
        scope: Scope,
        now: DateTime<Utc>,
        work: F,
    ) -> Result<T, BookingError>
    where
        T: Send + 'static,
        F: FnOnce(&mut UnitOfWork) -> Result<T, BookingError> + Send + 'static;

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<SeatAvailable>, StoreError>;

    async fn mark_notified(&self, id: NotificationId) -> Result<(), StoreError>;
}
