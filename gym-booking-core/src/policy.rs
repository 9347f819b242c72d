use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset as _, TimeDelta, Utc};
use gym_booking_config::PolicyConfig;

use crate::error::BookingError;
use crate::registration::{InvalidWeeklyUnlock, WeeklyUnlock};
use crate::types::{ClassSession, Tier};

#[derive(thiserror::Error, Debug)]
pub enum PolicyError {
    #[error("utc offset of {0} minutes is out of range")]
    UtcOffset(i32),
    #[error("block threshold must be at least one")]
    BlockThreshold,
    #[error("weekly unlock: {0}")]
    WeeklyUnlock(#[from] InvalidWeeklyUnlock),
}

/// Time limits and thresholds of the booking rules.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Cancelling closer than this to the start is a late cancellation.
    pub late_cancellation_window: TimeDelta,
    pub switch_cutoff: TimeDelta,
    pub block_threshold: u32,
    pub block_duration: TimeDelta,
    pub local_offset: FixedOffset,
    pub weekly_unlock: Option<WeeklyUnlock>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            late_cancellation_window: TimeDelta::hours(6),
            switch_cutoff: TimeDelta::hours(1),
            block_threshold: 3,
            block_duration: TimeDelta::days(3),
            local_offset: Utc.fix(),
            weekly_unlock: None,
        }
    }
}

impl Policy {
    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        if config.block_threshold == 0 {
            return Err(PolicyError::BlockThreshold);
        }
        let local_offset = config
            .utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or(PolicyError::UtcOffset(config.utc_offset_minutes))?;
        Ok(Self {
            late_cancellation_window: TimeDelta::hours(i64::from(config.late_cancellation_hours)),
            switch_cutoff: TimeDelta::hours(i64::from(config.switch_cutoff_hours)),
            block_threshold: config.block_threshold,
            block_duration: TimeDelta::days(i64::from(config.block_days)),
            local_offset,
            weekly_unlock: config
                .weekly_unlock
                .as_ref()
                .map(WeeklyUnlock::from_config)
                .transpose()?,
        })
    }

    /// Anything that starts sooner than the late window, including classes already running.
    #[must_use]
    pub fn is_late_cancellation(&self, session: &ClassSession, now: DateTime<Utc>) -> bool {
        session.time_until_start(now) < self.late_cancellation_window
    }

    /// Always open without a configured weekly unlock.
    pub fn check_registration(
        &self,
        session: &ClassSession,
        tier: Option<Tier>,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        self.weekly_unlock
            .as_ref()
            .map_or(Ok(()), |unlock| {
                unlock.check(session, tier, self.local_offset, now)
            })
    }

    #[must_use]
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.local_offset).date_naive()
    }

    /// Start (inclusive) and end (exclusive) of a local calendar day.
    #[must_use]
    pub fn day_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let midnight = date.and_time(NaiveTime::MIN);
        let start =
            midnight.and_utc() - TimeDelta::seconds(i64::from(self.local_offset.local_minus_utc()));
        (start, start + TimeDelta::days(1))
    }
}
