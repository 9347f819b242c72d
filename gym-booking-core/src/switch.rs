//! Exchanging a held booking for another class on the same day.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cancellation::{self, CancellationKind, CancellationReceipt};
use crate::catalog::SessionView;
use crate::error::BookingError;
use crate::policy::Policy;
use crate::store::UnitOfWork;
use crate::types::{Actor, Booking, ClassSession, SessionId, Tier, UserId};

/// A booking may be switched until `policy.switch_cutoff` before its class starts.
#[must_use]
pub fn can_switch(session: &ClassSession, now: DateTime<Utc>, policy: &Policy) -> bool {
    session.time_until_start(now) >= policy.switch_cutoff
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchOptions {
    pub allowed: bool,
    /// Last instant a switch is accepted.
    pub cutoff: DateTime<Utc>,
    pub alternatives: Vec<SessionView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchReceipt {
    pub cancelled: CancellationReceipt,
    pub booking: Booking,
}

/// Same local day, not yet started, admitting `tier` and with a free seat.
/// `tier == None` admits everything, which is how administrators see the catalog.
#[must_use]
pub fn eligible_alternatives(
    current: &ClassSession,
    candidates: impl IntoIterator<Item = SessionView>,
    tier: Option<Tier>,
    now: DateTime<Utc>,
    policy: &Policy,
) -> Vec<SessionView> {
    let day = policy.local_date(current.starts_at);
    let mut alternatives: Vec<SessionView> = candidates
        .into_iter()
        .filter(|view| view.session.id != current.id)
        .filter(|view| policy.local_date(view.session.starts_at) == day)
        .filter(|view| view.session.starts_at > now)
        .filter(|view| tier.map_or(true, |tier| view.session.admits(tier)))
        .filter(SessionView::has_free_seat)
        .collect();
    alternatives.sort_by_key(|view| view.session.starts_at);
    alternatives
}

#[must_use]
pub fn switch_options(
    current: &ClassSession,
    candidates: impl IntoIterator<Item = SessionView>,
    tier: Option<Tier>,
    now: DateTime<Utc>,
    policy: &Policy,
) -> SwitchOptions {
    let allowed = can_switch(current, now, policy);
    SwitchOptions {
        allowed,
        cutoff: current.starts_at - policy.switch_cutoff,
        alternatives: if allowed {
            eligible_alternatives(current, candidates, tier, now, policy)
        } else {
            Vec::new()
        },
    }
}

/// Cancels the booking in `from` as a normal cancellation and takes a seat in `to`.
///
/// Runs on one unit of work holding both sessions, so any failure leaves the original
/// booking in place.
pub fn switch(
    work: &mut UnitOfWork,
    actor: &Actor,
    user: UserId,
    from: SessionId,
    to: SessionId,
    policy: &Policy,
) -> Result<SwitchReceipt, BookingError> {
    if from == to {
        return Err(BookingError::SameSession);
    }
    let now = work.now();
    let original = work.ledger(from)?.session().clone();
    let target = work.ledger(to)?.session().clone();
    if policy.local_date(original.starts_at) != policy.local_date(target.starts_at) {
        return Err(BookingError::NotSameDay);
    }
    // the target follows the same rule as the offered alternatives
    if !can_switch(&original, now, policy) || target.starts_at <= now {
        return Err(BookingError::SwitchWindowClosed);
    }
    work.penalty()?.ensure_not_blocked(actor, now)?;
    if work.ledger(from)?.active_booking(user).is_none() {
        return Err(BookingError::BookingNotFound);
    }
    if !actor.is_admin() {
        let membership = work.membership().ok_or(BookingError::NoActiveMembership)?;
        membership.check_tier(&target, now)?;
        policy.check_registration(&target, Some(membership.tier()), now)?;
    }

    let cancelled = cancellation::cancel(work, user, from, CancellationKind::Normal, policy)?;
    let booking = work.ledger_mut(to)?.reserve_seat(user, now)?;
    info!(%user, %from, %to, booking = %booking.id, "switched class");
    Ok(SwitchReceipt { cancelled, booking })
}
