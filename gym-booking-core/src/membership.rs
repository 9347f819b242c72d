use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BookingError;
use crate::types::{ClassSession, Tier, UserId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Plan {
    Subscription {
        tier: Tier,
        /// `None` means unlimited.
        classes_per_month: Option<u32>,
        classes_used: u32,
        expires_at: Option<DateTime<Utc>>,
    },
    /// A pass for a fixed number of sessions.
    Ticket {
        total_sessions: u32,
        sessions_used: u32,
        expires_at: Option<DateTime<Utc>>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user: UserId,
    pub plan: Plan,
}

impl Membership {
    #[must_use]
    pub const fn tier(&self) -> Tier {
        match self.plan {
            Plan::Subscription { tier, .. } => tier,
            Plan::Ticket { .. } => Tier::Ticket,
        }
    }

    #[must_use]
    pub const fn is_ticket(&self) -> bool {
        matches!(self.plan, Plan::Ticket { .. })
    }

    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let (Plan::Subscription { expires_at, .. } | Plan::Ticket { expires_at, .. }) = &self.plan;
        expires_at.map_or(true, |expires_at| expires_at > now)
    }

    #[must_use]
    pub const fn remaining_sessions(&self) -> Option<u32> {
        match self.plan {
            Plan::Ticket {
                total_sessions,
                sessions_used,
                ..
            } => Some(total_sessions.saturating_sub(sessions_used)),
            Plan::Subscription {
                classes_per_month: Some(limit),
                classes_used,
                ..
            } => Some(limit.saturating_sub(classes_used)),
            Plan::Subscription {
                classes_per_month: None,
                ..
            } => None,
        }
    }

    /// Active plan whose tier the session admits.
    pub fn check_tier(&self, session: &ClassSession, now: DateTime<Utc>) -> Result<(), BookingError> {
        if !self.is_active(now) {
            return Err(BookingError::NoActiveMembership);
        }
        if !session.admits(self.tier()) {
            return Err(BookingError::IneligibleSubscription);
        }
        Ok(())
    }

    /// Everything a member needs to take a new place in `session`.
    pub fn check_bookable(
        &self,
        session: &ClassSession,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        self.check_tier(session, now)?;
        match self.remaining_sessions() {
            Some(0) if self.is_ticket() => Err(BookingError::TicketExhausted),
            Some(0) => Err(BookingError::QuotaExhausted),
            _ => Ok(()),
        }
    }

    /// A late cancellation on a ticket costs the session. Returns what is left.
    pub(crate) fn consume_ticket_credit(&mut self) -> Option<u32> {
        match &mut self.plan {
            Plan::Ticket {
                total_sessions,
                sessions_used,
                ..
            } => {
                *sessions_used = sessions_used.saturating_add(1).min(*total_sessions);
                Some(*total_sessions - *sessions_used)
            }
            Plan::Subscription { .. } => None,
        }
    }

    pub(crate) fn record_attendance(&mut self) {
        match &mut self.plan {
            Plan::Subscription { classes_used, .. } => *classes_used = classes_used.saturating_add(1),
            Plan::Ticket {
                total_sessions,
                sessions_used,
                ..
            } => *sessions_used = sessions_used.saturating_add(1).min(*total_sessions),
        }
    }
}

pub fn check_membership<'a>(
    membership: Option<&'a Membership>,
    session: &ClassSession,
    now: DateTime<Utc>,
) -> Result<&'a Membership, BookingError> {
    let membership = membership.ok_or(BookingError::NoActiveMembership)?;
    membership.check_bookable(session, now)?;
    Ok(membership)
}
