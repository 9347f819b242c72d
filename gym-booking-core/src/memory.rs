use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::catalog::SessionView;
use crate::error::{BookingError, StoreError};
use crate::membership::Membership;
use crate::penalty::PenaltyState;
use crate::store::{BookingStore, Changes, Scope, SeatAvailable, UnitOfWork};
use crate::types::{Booking, BookingId, ClassSession, NotificationId, SessionId, UserId};
use crate::waitlist::{BookingChange, SessionLedger};

#[derive(Debug, Default)]
struct State {
    sessions: BTreeMap<SessionId, ClassSession>,
    bookings: BTreeMap<SessionId, Vec<Booking>>,
    penalties: BTreeMap<UserId, PenaltyState>,
    memberships: BTreeMap<UserId, Membership>,
    /// Undelivered notices only, in promotion order.
    outbox: Vec<SeatAvailable>,
}

impl State {
    fn apply(&mut self, changes: Changes) {
        for change in changes.bookings {
            let (BookingChange::Insert(booking) | BookingChange::Update(booking)) = change;
            let bookings = self.bookings.entry(booking.session).or_default();
            match bookings.iter_mut().find(|existing| existing.id == booking.id) {
                Some(existing) => *existing = booking,
                None => bookings.push(booking),
            }
        }
        if let Some(penalty) = changes.penalty {
            self.penalties.insert(penalty.user, penalty);
        }
        if let Some(membership) = changes.membership {
            self.memberships.insert(membership.user, membership);
        }
        self.outbox.extend(changes.notifications);
    }
}

/// Process-local store. One lock over everything makes every transaction serializable.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Publishes a session, replacing one with the same id.
    pub async fn insert_session(&self, session: ClassSession) {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id, session);
    }

    pub async fn insert_membership(&self, membership: Membership) {
        self.state
            .lock()
            .await
            .memberships
            .insert(membership.user, membership);
    }

    pub async fn set_penalty(&self, penalty: PenaltyState) {
        self.state
            .lock()
            .await
            .penalties
            .insert(penalty.user, penalty);
    }

    /// Simulates an outage: every following call fails with a [`StoreError`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::new("store unavailable"))
        }
    }
}

fn ordered(mut bookings: Vec<Booking>) -> Vec<Booking> {
    bookings.sort_by_key(|booking| {
        (
            booking.is_waitlisted(),
            booking.waitlist_position,
            booking.created_at,
        )
    });
    bookings
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn session(&self, id: SessionId) -> Result<Option<ClassSession>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.sessions.get(&id).cloned())
    }

    async fn sessions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionView>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut views: Vec<SessionView> = state
            .sessions
            .values()
            .filter(|session| session.starts_at >= from && session.starts_at < to)
            .map(|session| {
                SessionView::from_bookings(
                    session.clone(),
                    state.bookings.get(&session.id).into_iter().flatten(),
                )
            })
            .collect();
        views.sort_by_key(|view| view.session.starts_at);
        Ok(views)
    }

    async fn session_bookings(&self, session: SessionId) -> Result<Vec<Booking>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(ordered(
            state.bookings.get(&session).cloned().unwrap_or_default(),
        ))
    }

    async fn booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .bookings
            .values()
            .flatten()
            .find(|booking| booking.id == id)
            .cloned())
    }

    async fn penalty(&self, user: UserId) -> Result<PenaltyState, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state
            .penalties
            .get(&user)
            .cloned()
            .unwrap_or_else(|| PenaltyState::new(user)))
    }

    async fn membership(&self, user: UserId) -> Result<Option<Membership>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.memberships.get(&user).cloned())
    }

    async fn transact<T, F>(
        &self,
        scope: Scope,
        now: DateTime<Utc>,
        work: F,
    ) -> Result<T, BookingError>
    where
        T: Send + 'static,
        F: FnOnce(&mut UnitOfWork) -> Result<T, BookingError> + Send + 'static,
    {
        let mut state = self.state.lock().await;
        self.check_available()?;
        let mut ledgers = Vec::with_capacity(scope.session_ids().len());
        for id in scope.session_ids() {
            let session = state
                .sessions
                .get(id)
                .cloned()
                .ok_or(BookingError::SessionNotFound(*id))?;
            let bookings = state.bookings.get(id).cloned().unwrap_or_default();
            ledgers.push(SessionLedger::new(session, ordered(bookings)));
        }
        let penalty = scope.user_id().map(|user| {
            state
                .penalties
                .get(&user)
                .cloned()
                .unwrap_or_else(|| PenaltyState::new(user))
        });
        let membership = scope
            .user_id()
            .and_then(|user| state.memberships.get(&user).cloned());

        let mut unit = UnitOfWork::new(now, ledgers, penalty, membership);
        let value = work(&mut unit)?;
        let changes = unit.into_changes();
        debug!(
            bookings = changes.bookings.len(),
            notifications = changes.notifications.len(),
            "committing"
        );
        state.apply(changes);
        Ok(value)
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<SeatAvailable>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        Ok(state.outbox.iter().take(limit).cloned().collect())
    }

    async fn mark_notified(&self, id: NotificationId) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let index = state
            .outbox
            .iter()
            .position(|notice| notice.id == id)
            .ok_or_else(|| StoreError::new(format!("unknown notification {id}")))?;
        state.outbox.remove(index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeSet;

    use chrono::{TimeDelta, TimeZone as _};

    use super::*;
    use crate::types::Tier;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn session() -> ClassSession {
        ClassSession {
            id: SessionId::random(),
            title: "Crossfit".to_owned(),
            starts_at: now() + TimeDelta::days(1),
            capacity: 1,
            eligible_tiers: BTreeSet::from([Tier::Basic]),
            waitlist_enabled: true,
        }
    }

    #[tokio::test]
    async fn failed_work_writes_nothing() {
        let store = MemoryStore::new();
        let session = session();
        store.insert_session(session.clone()).await;
        let user = UserId::random();
        let id = session.id;

        let result: Result<(), BookingError> = store
            .transact(Scope::session(id).with_user(user), now(), move |work| {
                work.ledger_mut(id)?.reserve(user, now())?;
                work.penalty_mut()?.late_cancellation_count = 7;
                Err(BookingError::SessionFull)
            })
            .await;
        assert_eq!(result, Err(BookingError::SessionFull));
        assert!(store.session_bookings(id).await.unwrap().is_empty());
        assert_eq!(store.penalty(user).await.unwrap(), PenaltyState::new(user));
    }

    #[tokio::test]
    async fn committed_work_is_visible() {
        let store = MemoryStore::new();
        let session = session();
        store.insert_session(session.clone()).await;
        let id = session.id;

        for _ in 0..3 {
            let user = UserId::random();
            store
                .transact(Scope::session(id), now(), move |work| {
                    work.ledger_mut(id)?.reserve(user, now())
                })
                .await
                .unwrap();
        }
        let bookings = store.session_bookings(id).await.unwrap();
        let positions: Vec<Option<u32>> = bookings.iter().map(|b| b.waitlist_position).collect();
        assert_eq!(positions, vec![None, Some(1), Some(2)]);

        let views = store
            .sessions_between(now(), now() + TimeDelta::days(2))
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert_eq!((views[0].enrolled, views[0].waitlisted), (1, 2));
    }

    #[tokio::test]
    async fn delivered_notices_leave_the_outbox() {
        let store = MemoryStore::new();
        let session = session();
        store.insert_session(session.clone()).await;
        let id = session.id;
        let user = UserId::random();

        store
            .transact(Scope::session(id), now(), move |work| {
                let booking = work.ledger_mut(id)?.reserve_seat(user, now())?;
                work.notify(SeatAvailable::for_promotion(&booking, now()));
                work.notify(SeatAvailable::for_promotion(&booking, now()));
                Ok(())
            })
            .await
            .unwrap();
        let pending = store.pending_notifications(10).await.unwrap();
        assert_eq!(pending.len(), 2);

        store.mark_notified(pending[0].id).await.unwrap();
        assert_eq!(store.pending_notifications(10).await.unwrap(), vec![pending[1].clone()]);
        store.mark_notified(pending[1].id).await.unwrap();
        assert!(store.state.lock().await.outbox.is_empty());
        assert!(store.mark_notified(pending[0].id).await.is_err());
    }

    #[tokio::test]
    async fn unknown_session_aborts() {
        let store = MemoryStore::new();
        let missing = SessionId::random();
        let result = store
            .transact(Scope::session(missing), now(), |_| Ok(()))
            .await;
        assert_eq!(result, Err(BookingError::SessionNotFound(missing)));
    }

    #[tokio::test]
    async fn outage_is_a_store_error() {
        let store = MemoryStore::new();
        store.set_available(false);
        let error = store
            .transact(Scope::user(UserId::random()), now(), |_| Ok(()))
            .await
            .unwrap_err();
        assert!(error.is_retryable());
    }
}
