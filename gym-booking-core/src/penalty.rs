use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::BookingError;
use crate::policy::Policy;
use crate::types::{Actor, UserId};

/// Late cancellation bookkeeping of one user, kept apart from the rest of the profile.
///
/// A block is never lifted explicitly: it is over once `block_end` lies in the past.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyState {
    pub user: UserId,
    pub late_cancellation_count: u32,
    pub block_end: Option<DateTime<Utc>>,
}

/// What a recorded late cancellation did to the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateCancellationRecord {
    pub late_cancellation_count: u32,
    /// Set when this cancellation started a new block.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl PenaltyState {
    #[must_use]
    pub const fn new(user: UserId) -> Self {
        Self {
            user,
            late_cancellation_count: 0,
            block_end: None,
        }
    }

    #[must_use]
    pub fn active_block(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.block_end.filter(|end| *end > now)
    }

    #[must_use]
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.active_block(now).is_some()
    }

    pub fn ensure_not_blocked(&self, actor: &Actor, now: DateTime<Utc>) -> Result<(), BookingError> {
        if actor.is_admin() {
            return Ok(());
        }
        match self.active_block(now) {
            Some(until) => Err(BookingError::UserBlocked { until }),
            None => Ok(()),
        }
    }

    /// Counts one late cancellation. Reaching the threshold starts a block unless one is
    /// already running, blocks never stack.
    pub(crate) fn record_late_cancellation(
        &mut self,
        now: DateTime<Utc>,
        policy: &Policy,
    ) -> LateCancellationRecord {
        self.late_cancellation_count = self.late_cancellation_count.saturating_add(1);
        let blocked_until = if self.late_cancellation_count >= policy.block_threshold
            && !self.is_blocked(now)
        {
            let until = now + policy.block_duration;
            self.block_end = Some(until);
            info!(user = %self.user, %until, count = self.late_cancellation_count, "blocking user");
            Some(until)
        } else {
            None
        };
        LateCancellationRecord {
            late_cancellation_count: self.late_cancellation_count,
            blocked_until,
        }
    }

    /// Administrative reset, the only way back below the threshold.
    pub(crate) fn reset(&mut self) {
        self.late_cancellation_count = 0;
        self.block_end = None;
    }
}
