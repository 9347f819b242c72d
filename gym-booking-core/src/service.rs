use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use crate::cancellation::{
    self, classify_cancellation, preview_penalty, CancellationDecision, CancellationKind,
    CancellationOutcome, CancellationReceipt, LateCancellationConsent,
};
use crate::catalog::SessionView;
use crate::clock::Clock;
use crate::error::{BookingError, StoreError};
use crate::membership::check_membership;
use crate::notify::SeatNotifier;
use crate::penalty::PenaltyState;
use crate::policy::Policy;
use crate::store::{BookingStore, Scope, SeatAvailable};
use crate::switch::{self, SwitchOptions, SwitchReceipt};
use crate::types::{Actor, Booking, BookingId, SessionId, UserId};
use crate::waitlist::Attendance;

const NOTIFICATION_BATCH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyStatus {
    pub user: UserId,
    pub late_cancellation_count: u32,
    pub threshold: u32,
    /// Only set while the block is running.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl PenaltyStatus {
    fn new(state: &PenaltyState, now: DateTime<Utc>, policy: &Policy) -> Self {
        Self {
            user: state.user,
            late_cancellation_count: state.late_cancellation_count,
            threshold: policy.block_threshold,
            blocked_until: state.active_block(now),
        }
    }
}

fn log_rejection(operation: &'static str, error: &BookingError) {
    if error.is_retryable() {
        error!(operation, %error, "store failure");
    } else {
        warn!(operation, kind = error.kind(), %error, "rejected");
    }
}

/// Members act on their own bookings, staff on anybody's.
fn authorize(actor: &Actor, user: UserId) -> Result<(), BookingError> {
    if actor.user == user || actor.is_staff() {
        Ok(())
    } else {
        Err(BookingError::NotPermitted)
    }
}

/// Entry point for everything that changes bookings.
///
/// Every operation reads the clock once and runs its decision and its writes in a single
/// store transaction, so the block state and capacity it acts on are never stale.
pub struct BookingService<S, N> {
    store: Arc<S>,
    notifier: Arc<N>,
    clock: Arc<dyn Clock>,
    policy: Arc<Policy>,
    flushing: Mutex<()>,
}

impl<S: BookingStore, N: SeatNotifier> BookingService<S, N> {
    pub fn new(store: Arc<S>, notifier: Arc<N>, clock: Arc<dyn Clock>, policy: Policy) -> Self {
        Self {
            store,
            notifier,
            clock,
            policy: Arc::new(policy),
            flushing: Mutex::new(()),
        }
    }

    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Sessions starting in `[from, to)`.
    pub async fn catalog(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionView>, BookingError> {
        Ok(self.store.sessions_between(from, to).await?)
    }

    pub async fn roster(
        &self,
        actor: Actor,
        session: SessionId,
    ) -> Result<Vec<Booking>, BookingError> {
        if !actor.is_staff() {
            return Err(BookingError::NotPermitted);
        }
        if self.store.session(session).await?.is_none() {
            return Err(BookingError::SessionNotFound(session));
        }
        Ok(self.store.session_bookings(session).await?)
    }

    /// Confirms while seats are free and queues afterwards.
    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn request_booking(
        &self,
        actor: Actor,
        user: UserId,
        session: SessionId,
    ) -> Result<Booking, BookingError> {
        authorize(&actor, user)?;
        let policy = Arc::clone(&self.policy);
        self.store
            .transact(
                Scope::session(session).with_user(user),
                self.clock.now(),
                move |work| {
                    let now = work.now();
                    if work.ledger(session)?.active_booking(user).is_some() {
                        return Err(BookingError::AlreadyBooked);
                    }
                    work.penalty()?.ensure_not_blocked(&actor, now)?;
                    if !actor.is_admin() {
                        let class = work.ledger(session)?.session().clone();
                        let tier = check_membership(work.membership(), &class, now)?.tier();
                        policy.check_registration(&class, Some(tier), now)?;
                    }
                    work.ledger_mut(session)?.reserve(user, now)
                },
            )
            .await
            .inspect_err(|error| log_rejection("request_booking", error))
    }

    /// Cancels right away when that is free of charge, otherwise describes the penalty and
    /// leaves the booking alone until [`Self::confirm_late_cancellation`].
    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn request_cancellation(
        &self,
        actor: Actor,
        user: UserId,
        session: SessionId,
    ) -> Result<CancellationOutcome, BookingError> {
        authorize(&actor, user)?;
        let policy = Arc::clone(&self.policy);
        self.store
            .transact(
                Scope::session(session).with_user(user),
                self.clock.now(),
                move |work| {
                    let now = work.now();
                    let ledger = work.ledger(session)?;
                    let class = ledger.session().clone();
                    let booking = ledger
                        .active_booking(user)
                        .ok_or(BookingError::BookingNotFound)?
                        .clone();
                    let decision = classify_cancellation(
                        &booking,
                        &class,
                        work.penalty()?,
                        now,
                        actor.is_admin(),
                        &policy,
                    );
                    match decision {
                        CancellationDecision::Blocked(until) => {
                            Err(BookingError::UserBlocked { until })
                        }
                        CancellationDecision::Normal => cancellation::cancel(
                            work,
                            user,
                            session,
                            CancellationKind::Normal,
                            &policy,
                        )
                        .map(CancellationOutcome::Cancelled),
                        CancellationDecision::LateRequiresConfirmation => {
                            let penalty =
                                preview_penalty(work.penalty()?, work.membership(), now, &policy);
                            Ok(CancellationOutcome::ConfirmationRequired(
                                cancellation::notice(&booking, &class, penalty, now),
                            ))
                        }
                    }
                },
            )
            .await
            .inspect_err(|error| log_rejection("request_cancellation", error))
    }

    /// Finalizes a late cancellation the user agreed to. The block and the window are
    /// evaluated again, a block that started since the notice wins.
    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn confirm_late_cancellation(
        &self,
        actor: Actor,
        user: UserId,
        session: SessionId,
        consent: LateCancellationConsent,
    ) -> Result<CancellationReceipt, BookingError> {
        authorize(&actor, user)?;
        let policy = Arc::clone(&self.policy);
        self.store
            .transact(
                Scope::session(session).with_user(user),
                self.clock.now(),
                move |work| {
                    let now = work.now();
                    let ledger = work.ledger(session)?;
                    let class = ledger.session().clone();
                    let booking = ledger
                        .active_booking(user)
                        .ok_or(BookingError::BookingNotFound)?
                        .clone();
                    if booking.id != consent.booking {
                        return Err(BookingError::ConsentMismatch);
                    }
                    let kind = match classify_cancellation(
                        &booking,
                        &class,
                        work.penalty()?,
                        now,
                        actor.is_admin(),
                        &policy,
                    ) {
                        CancellationDecision::Blocked(until) => {
                            return Err(BookingError::UserBlocked { until })
                        }
                        CancellationDecision::Normal => CancellationKind::Normal,
                        CancellationDecision::LateRequiresConfirmation => CancellationKind::Late,
                    };
                    cancellation::cancel(work, user, session, kind, &policy)
                },
            )
            .await
            .inspect_err(|error| log_rejection("confirm_late_cancellation", error))
    }

    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn switch_options(
        &self,
        actor: Actor,
        user: UserId,
        session: SessionId,
    ) -> Result<SwitchOptions, BookingError> {
        authorize(&actor, user)?;
        let now = self.clock.now();
        let class = self
            .store
            .session(session)
            .await?
            .ok_or(BookingError::SessionNotFound(session))?;
        let held = self
            .store
            .session_bookings(session)
            .await?
            .iter()
            .any(|booking| booking.user == user && booking.is_active());
        if !held {
            return Err(BookingError::BookingNotFound);
        }
        self.store
            .penalty(user)
            .await?
            .ensure_not_blocked(&actor, now)?;
        let tier = if actor.is_admin() {
            None
        } else {
            let membership = self
                .store
                .membership(user)
                .await?
                .ok_or(BookingError::NoActiveMembership)?;
            Some(membership.tier())
        };
        let (from, to) = self.policy.day_bounds(self.policy.local_date(class.starts_at));
        let candidates = self.store.sessions_between(from, to).await?;
        Ok(switch::switch_options(
            &class,
            candidates,
            tier,
            now,
            &self.policy,
        ))
    }

    /// Exchanges the booking in `from` for a seat in `to`, all or nothing.
    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn switch(
        &self,
        actor: Actor,
        user: UserId,
        from: SessionId,
        to: SessionId,
    ) -> Result<SwitchReceipt, BookingError> {
        authorize(&actor, user)?;
        if from == to {
            return Err(BookingError::SameSession);
        }
        let policy = Arc::clone(&self.policy);
        self.store
            .transact(
                Scope::sessions([from, to]).with_user(user),
                self.clock.now(),
                move |work| switch::switch(work, &actor, user, from, to, &policy),
            )
            .await
            .inspect_err(|error| log_rejection("switch", error))
    }

    /// Administrator approval of the head of the waitlist into a free seat.
    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn promote_from_waitlist(
        &self,
        actor: Actor,
        session: SessionId,
    ) -> Result<Booking, BookingError> {
        if !actor.is_admin() {
            return Err(BookingError::NotPermitted);
        }
        self.store
            .transact(Scope::session(session), self.clock.now(), move |work| {
                let now = work.now();
                let ledger = work.ledger_mut(session)?;
                if ledger.waitlist_len() == 0 {
                    return Err(BookingError::WaitlistEmpty);
                }
                let promoted = ledger.promote_next(now).ok_or(BookingError::SessionFull)?;
                work.notify(SeatAvailable::for_promotion(&promoted, now));
                Ok(promoted)
            })
            .await
            .inspect_err(|error| log_rejection("promote_from_waitlist", error))
    }

    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn mark_attendance(
        &self,
        actor: Actor,
        booking: BookingId,
        attendance: Attendance,
    ) -> Result<Booking, BookingError> {
        if !actor.is_staff() {
            return Err(BookingError::NotPermitted);
        }
        let Some(current) = self.store.booking(booking).await? else {
            return Err(BookingError::BookingNotFound);
        };
        self.store
            .transact(
                Scope::session(current.session).with_user(current.user),
                self.clock.now(),
                move |work| {
                    let now = work.now();
                    let updated = work
                        .ledger_mut(current.session)?
                        .record_attendance(booking, attendance, now)?;
                    if attendance == Attendance::Attended {
                        if let Some(membership) = work.membership_mut() {
                            membership.record_attendance();
                        }
                    }
                    Ok(updated)
                },
            )
            .await
            .inspect_err(|error| log_rejection("mark_attendance", error))
    }

    #[instrument(skip(self, actor), fields(actor = %actor.user))]
    pub async fn reset_penalties(
        &self,
        actor: Actor,
        user: UserId,
    ) -> Result<PenaltyStatus, BookingError> {
        if !actor.is_admin() {
            return Err(BookingError::NotPermitted);
        }
        let policy = Arc::clone(&self.policy);
        let status = self
            .store
            .transact(Scope::user(user), self.clock.now(), move |work| {
                let now = work.now();
                let penalty = work.penalty_mut()?;
                penalty.reset();
                Ok(PenaltyStatus::new(penalty, now, &policy))
            })
            .await
            .inspect_err(|error| log_rejection("reset_penalties", error))?;
        info!(%user, "penalties reset");
        Ok(status)
    }

    pub async fn penalty_status(
        &self,
        actor: Actor,
        user: UserId,
    ) -> Result<PenaltyStatus, BookingError> {
        authorize(&actor, user)?;
        let state = self.store.penalty(user).await?;
        Ok(PenaltyStatus::new(&state, self.clock.now(), &self.policy))
    }

    /// Hands queued promotions to the notifier. A notice is marked only after it was
    /// delivered, failed ones stay queued for the next flush. Returns the delivered count.
    pub async fn flush_notifications(&self) -> Result<usize, StoreError> {
        let _flushing = self.flushing.lock().await;
        let pending = self.store.pending_notifications(NOTIFICATION_BATCH).await?;
        let mut delivered = 0;
        for notice in pending {
            match self.notifier.seat_available(&notice).await {
                Ok(()) => {
                    self.store.mark_notified(notice.id).await?;
                    delivered += 1;
                }
                Err(error) => {
                    error!(notification = %notice.id, user = %notice.user, %error, "delivery failed");
                }
            }
        }
        Ok(delivered)
    }
}
