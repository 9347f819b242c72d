//! Cancellation policy.
//!
//! Cancelling is split into stages the caller sequences explicitly: a pure
//! [`classify_cancellation`], an optional confirmation by the user for late cancellations,
//! and [`cancel`] which mutates the ledgers inside a store transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BookingError;
use crate::membership::Membership;
use crate::penalty::PenaltyState;
use crate::policy::Policy;
use crate::store::{SeatAvailable, UnitOfWork};
use crate::types::{Booking, BookingId, ClassSession, SessionId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", content = "until", rename_all = "snake_case")]
pub enum CancellationDecision {
    Normal,
    LateRequiresConfirmation,
    Blocked(DateTime<Utc>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationKind {
    Normal,
    Late,
}

/// The two penalty currencies. Subscribers collect late cancellations towards a block,
/// ticket holders pay with a session of their ticket instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Penalty {
    LateCancellation {
        late_cancellation_count: u32,
        threshold: u32,
        blocked_until: Option<DateTime<Utc>>,
    },
    TicketCredit {
        remaining_sessions: u32,
    },
}

/// Shown to the user before a late cancellation, describes the penalty it would cause.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LateCancellationNotice {
    pub booking: BookingId,
    pub session: SessionId,
    pub starts_at: DateTime<Utc>,
    pub hours_until_class: f64,
    pub penalty: Penalty,
}

impl LateCancellationNotice {
    #[must_use]
    pub const fn consent(&self) -> LateCancellationConsent {
        LateCancellationConsent {
            booking: self.booking,
        }
    }
}

/// The user's explicit agreement to a charge-bearing cancellation of one booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateCancellationConsent {
    pub booking: BookingId,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationReceipt {
    pub booking: Booking,
    pub kind: CancellationKind,
    pub penalty: Option<Penalty>,
    /// Whoever got the freed seat.
    pub promoted: Option<Booking>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CancellationOutcome {
    Cancelled(CancellationReceipt),
    ConfirmationRequired(LateCancellationNotice),
}

/// Decides how a cancellation of `booking` is treated at `now`.
///
/// The block is checked first: a blocked user may not even cancel late.
#[must_use]
pub fn classify_cancellation(
    booking: &Booking,
    session: &ClassSession,
    penalty: &PenaltyState,
    now: DateTime<Utc>,
    is_admin: bool,
    policy: &Policy,
) -> CancellationDecision {
    debug_assert_eq!(booking.session, session.id);
    if !is_admin {
        if let Some(until) = penalty.active_block(now) {
            return CancellationDecision::Blocked(until);
        }
    }
    let decision = if is_admin || !policy.is_late_cancellation(session, now) {
        CancellationDecision::Normal
    } else {
        CancellationDecision::LateRequiresConfirmation
    };
    debug!(booking = %booking.id, hours_until_class = session.hours_until_start(now), ?decision, "classified cancellation");
    decision
}

/// The penalty a late cancellation would cause, without applying it.
#[must_use]
pub fn preview_penalty(
    penalty: &PenaltyState,
    membership: Option<&Membership>,
    now: DateTime<Utc>,
    policy: &Policy,
) -> Penalty {
    let mut penalty = penalty.clone();
    let mut membership = membership.cloned();
    charge(&mut penalty, membership.as_mut(), now, policy)
}

fn charge(
    penalty: &mut PenaltyState,
    membership: Option<&mut Membership>,
    now: DateTime<Utc>,
    policy: &Policy,
) -> Penalty {
    if let Some(remaining_sessions) = membership.and_then(Membership::consume_ticket_credit) {
        return Penalty::TicketCredit { remaining_sessions };
    }
    let record = penalty.record_late_cancellation(now, policy);
    Penalty::LateCancellation {
        late_cancellation_count: record.late_cancellation_count,
        threshold: policy.block_threshold,
        blocked_until: record.blocked_until,
    }
}

#[must_use]
pub fn notice(
    booking: &Booking,
    session: &ClassSession,
    penalty: Penalty,
    now: DateTime<Utc>,
) -> LateCancellationNotice {
    LateCancellationNotice {
        booking: booking.id,
        session: session.id,
        starts_at: session.starts_at,
        hours_until_class: session.hours_until_start(now),
        penalty,
    }
}

/// Cancels the active booking of `user` in `session`, promotes into a freed seat and
/// charges the penalty of a late cancellation, all within one unit of work.
pub fn cancel(
    work: &mut UnitOfWork,
    user: UserId,
    session: SessionId,
    kind: CancellationKind,
    policy: &Policy,
) -> Result<CancellationReceipt, BookingError> {
    let now = work.now();
    let ledger = work.ledger_mut(session)?;
    let booking = ledger
        .active_booking(user)
        .ok_or(BookingError::BookingNotFound)?
        .id;
    let released = ledger.release(booking, now)?;
    let promoted = if released.freed_seat {
        ledger.promote_next(now)
    } else {
        None
    };
    if let Some(promoted) = &promoted {
        work.notify(SeatAvailable::for_promotion(promoted, now));
    }
    let penalty = match kind {
        CancellationKind::Normal => None,
        CancellationKind::Late => {
            let mut penalty = work.penalty()?.clone();
            let mut membership = work.membership().cloned();
            let charged = charge(&mut penalty, membership.as_mut(), now, policy);
            match charged {
                Penalty::TicketCredit { .. } => {
                    if let (Some(stored), Some(charged)) = (work.membership_mut(), membership) {
                        *stored = charged;
                    }
                }
                Penalty::LateCancellation { .. } => *work.penalty_mut()? = penalty,
            }
            Some(charged)
        }
    };
    info!(
        booking = %released.booking.id,
        %session,
        %user,
        ?kind,
        ?penalty,
        promoted = ?promoted.as_ref().map(|booking| booking.id),
        "cancelled"
    );
    Ok(CancellationReceipt {
        booking: released.booking,
        kind,
        penalty,
        promoted,
    })
}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeSet;

    use chrono::{TimeDelta, TimeZone as _};

    use super::*;
    use crate::membership::Plan;
    use crate::types::{BookingStatus, Tier};
    use crate::waitlist::SessionLedger;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn session_in(hours: i64) -> ClassSession {
        ClassSession {
            id: SessionId::random(),
            title: "Pilates".to_owned(),
            starts_at: now() + TimeDelta::hours(hours),
            capacity: 1,
            eligible_tiers: BTreeSet::from([Tier::Basic, Tier::Ticket]),
            waitlist_enabled: true,
        }
    }

    fn booking(session: &ClassSession, user: UserId) -> Booking {
        Booking {
            id: BookingId::random(),
            session: session.id,
            user,
            status: BookingStatus::Confirmed,
            created_at: now(),
            updated_at: now(),
            waitlist_position: None,
        }
    }

    #[test]
    fn six_hours_ahead_is_normal() {
        let session = session_in(6);
        let user = UserId::random();
        let decision = classify_cancellation(
            &booking(&session, user),
            &session,
            &PenaltyState::new(user),
            now(),
            false,
            &Policy::default(),
        );
        assert_eq!(decision, CancellationDecision::Normal);
    }

    #[test]
    fn inside_the_window_or_after_start_is_late() {
        let user = UserId::random();
        for hours in [5, 0, -1] {
            let session = session_in(hours);
            let decision = classify_cancellation(
                &booking(&session, user),
                &session,
                &PenaltyState::new(user),
                now(),
                false,
                &Policy::default(),
            );
            assert_eq!(decision, CancellationDecision::LateRequiresConfirmation);
        }
    }

    #[test]
    fn admins_always_cancel_normally() {
        let session = session_in(1);
        let user = UserId::random();
        let blocked = PenaltyState {
            user,
            late_cancellation_count: 3,
            block_end: Some(now() + TimeDelta::days(1)),
        };
        let decision = classify_cancellation(
            &booking(&session, user),
            &session,
            &blocked,
            now(),
            true,
            &Policy::default(),
        );
        assert_eq!(decision, CancellationDecision::Normal);
    }

    #[test]
    fn block_wins_over_everything() {
        let session = session_in(48);
        let user = UserId::random();
        let until = now() + TimeDelta::days(1);
        let blocked = PenaltyState {
            user,
            late_cancellation_count: 3,
            block_end: Some(until),
        };
        let decision = classify_cancellation(
            &booking(&session, user),
            &session,
            &blocked,
            now(),
            false,
            &Policy::default(),
        );
        assert_eq!(decision, CancellationDecision::Blocked(until));
    }

    #[test]
    fn preview_does_not_touch_the_ledger() {
        let user = UserId::random();
        let penalty = PenaltyState {
            user,
            late_cancellation_count: 2,
            block_end: None,
        };
        let preview = preview_penalty(&penalty, None, now(), &Policy::default());
        assert_eq!(
            preview,
            Penalty::LateCancellation {
                late_cancellation_count: 3,
                threshold: 3,
                blocked_until: Some(now() + TimeDelta::days(3)),
            }
        );
        assert_eq!(penalty.late_cancellation_count, 2);
    }

    #[test]
    fn ticket_holders_pay_with_a_session() {
        let session = session_in(2);
        let user = UserId::random();
        let membership = Membership {
            user,
            plan: Plan::Ticket {
                total_sessions: 10,
                sessions_used: 4,
                expires_at: None,
            },
        };
        let ledger = SessionLedger::new(session.clone(), vec![booking(&session, user)]);
        let mut work = UnitOfWork::new(
            now(),
            [ledger],
            Some(PenaltyState::new(user)),
            Some(membership),
        );
        let receipt = cancel(
            &mut work,
            user,
            session.id,
            CancellationKind::Late,
            &Policy::default(),
        )
        .unwrap();
        assert_eq!(
            receipt.penalty,
            Some(Penalty::TicketCredit {
                remaining_sessions: 5
            })
        );
        let changes = work.into_changes();
        assert!(changes.penalty.is_none());
        assert_eq!(
            changes.membership.map(|m| m.plan),
            Some(Plan::Ticket {
                total_sessions: 10,
                sessions_used: 5,
                expires_at: None,
            })
        );
    }

    #[test]
    fn late_cancellation_promotes_and_counts() {
        let session = session_in(3);
        let user = UserId::random();
        let waiting_user = UserId::random();
        let waiting = Booking {
            id: BookingId::random(),
            user: waiting_user,
            status: BookingStatus::WaitingList,
            waitlist_position: Some(1),
            ..booking(&session, waiting_user)
        };
        let ledger = SessionLedger::new(session.clone(), vec![booking(&session, user), waiting]);
        let mut work = UnitOfWork::new(
            now(),
            [ledger],
            Some(PenaltyState {
                user,
                late_cancellation_count: 2,
                block_end: None,
            }),
            None,
        );
        let receipt = cancel(
            &mut work,
            user,
            session.id,
            CancellationKind::Late,
            &Policy::default(),
        )
        .unwrap();
        assert_eq!(receipt.booking.status, BookingStatus::Cancelled);
        assert_eq!(receipt.promoted.as_ref().map(|b| b.user), Some(waiting_user));
        let changes = work.into_changes();
        let penalty = changes.penalty.unwrap();
        assert_eq!(penalty.late_cancellation_count, 3);
        assert_eq!(penalty.block_end, Some(now() + TimeDelta::days(3)));
        assert_eq!(changes.notifications.len(), 1);
        assert_eq!(changes.notifications[0].user, waiting_user);
    }
}
