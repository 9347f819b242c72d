//! Weekly opening of registration.
//!
//! Weeks start on sunday, local time. Classes of the current week are always open, the next
//! week opens on the unlock weekday of the current week, anything later is not open yet.
//! Some tiers get an earlier weekday.

use alloc::collections::BTreeSet;
use core::str::FromStr;

use chrono::{DateTime, Datelike as _, Days, FixedOffset, TimeDelta, Utc, Weekday};
use gym_booking_config::WeeklyUnlockConfig;

use crate::error::BookingError;
use crate::types::{ClassSession, Tier};

#[derive(thiserror::Error, Debug)]
pub enum InvalidWeeklyUnlock {
    #[error("unknown weekday {0:?}")]
    Weekday(String),
    #[error("unknown tier {0:?}")]
    Tier(String),
    #[error("hour {0} is not within 0..24")]
    Hour(u32),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeeklyUnlock {
    pub weekday: Weekday,
    pub early_weekday: Weekday,
    pub hour: u32,
    pub early_tiers: BTreeSet<Tier>,
}

impl WeeklyUnlock {
    pub fn from_config(config: &WeeklyUnlockConfig) -> Result<Self, InvalidWeeklyUnlock> {
        let weekday = |value: &str| {
            Weekday::from_str(value).map_err(|_| InvalidWeeklyUnlock::Weekday(value.to_owned()))
        };
        if config.hour >= 24 {
            return Err(InvalidWeeklyUnlock::Hour(config.hour));
        }
        Ok(Self {
            weekday: weekday(&config.weekday)?,
            early_weekday: weekday(&config.early_weekday)?,
            hour: config.hour,
            early_tiers: config
                .early_tiers
                .iter()
                .map(|tier| {
                    tier.parse::<Tier>()
                        .map_err(|_| InvalidWeeklyUnlock::Tier(tier.clone()))
                })
                .collect::<Result<_, _>>()?,
        })
    }

    /// When booking of `session` opens for a member of `tier`.
    #[must_use]
    pub fn opens_at(
        &self,
        session: &ClassSession,
        tier: Option<Tier>,
        offset: FixedOffset,
    ) -> Option<DateTime<Utc>> {
        let weekday = match tier {
            Some(tier) if self.early_tiers.contains(&tier) => self.early_weekday,
            _ => self.weekday,
        };
        let date = session.starts_at.with_timezone(&offset).date_naive();
        let week_start = date.checked_sub_days(Days::new(u64::from(
            date.weekday().num_days_from_sunday(),
        )))?;
        let unlock_date = week_start
            .checked_sub_days(Days::new(7))?
            .checked_add_days(Days::new(u64::from(weekday.num_days_from_sunday())))?;
        let local = unlock_date.and_hms_opt(self.hour, 0, 0)?;
        Some(local.and_utc() - TimeDelta::seconds(i64::from(offset.local_minus_utc())))
    }

    pub fn check(
        &self,
        session: &ClassSession,
        tier: Option<Tier>,
        offset: FixedOffset,
        now: DateTime<Utc>,
    ) -> Result<(), BookingError> {
        match self.opens_at(session, tier, offset) {
            Some(opens_at) if now < opens_at => Err(BookingError::RegistrationNotOpen { opens_at }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;
    use crate::types::SessionId;

    fn unlock() -> WeeklyUnlock {
        WeeklyUnlock::from_config(&WeeklyUnlockConfig {
            weekday: "thursday".to_owned(),
            early_weekday: "wednesday".to_owned(),
            hour: 12,
            early_tiers: vec!["unlimited".to_owned()],
        })
        .unwrap()
    }

    fn session_at(starts_at: DateTime<Utc>) -> ClassSession {
        ClassSession {
            id: SessionId::random(),
            title: "Spinning".to_owned(),
            starts_at,
            capacity: 8,
            eligible_tiers: BTreeSet::from([Tier::Basic, Tier::Unlimited]),
            waitlist_enabled: true,
        }
    }

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn next_week_opens_thursday_noon() {
        // 2026-03-15 is a sunday
        let session = session_at(Utc.with_ymd_and_hms(2026, 3, 17, 18, 0, 0).unwrap());
        let opens_at = unlock().opens_at(&session, Some(Tier::Basic), utc());
        assert_eq!(
            opens_at,
            Some(Utc.with_ymd_and_hms(2026, 3, 12, 12, 0, 0).unwrap())
        );

        let wednesday = Utc.with_ymd_and_hms(2026, 3, 11, 15, 0, 0).unwrap();
        assert!(matches!(
            unlock().check(&session, Some(Tier::Basic), utc(), wednesday),
            Err(BookingError::RegistrationNotOpen { .. })
        ));
        let thursday = Utc.with_ymd_and_hms(2026, 3, 12, 12, 0, 0).unwrap();
        assert!(unlock()
            .check(&session, Some(Tier::Basic), utc(), thursday)
            .is_ok());
    }

    #[test]
    fn unlimited_members_get_wednesday() {
        let session = session_at(Utc.with_ymd_and_hms(2026, 3, 17, 18, 0, 0).unwrap());
        let wednesday = Utc.with_ymd_and_hms(2026, 3, 11, 15, 0, 0).unwrap();
        assert!(unlock()
            .check(&session, Some(Tier::Unlimited), utc(), wednesday)
            .is_ok());
    }

    #[test]
    fn current_week_is_always_open_and_far_future_is_not() {
        let monday = Utc.with_ymd_and_hms(2026, 3, 16, 8, 0, 0).unwrap();
        let this_week = session_at(Utc.with_ymd_and_hms(2026, 3, 20, 18, 0, 0).unwrap());
        assert!(unlock()
            .check(&this_week, Some(Tier::Basic), utc(), monday)
            .is_ok());

        let in_two_weeks = session_at(Utc.with_ymd_and_hms(2026, 3, 31, 18, 0, 0).unwrap());
        assert!(unlock()
            .check(&in_two_weeks, Some(Tier::Basic), utc(), monday)
            .is_err());
    }

    #[test]
    fn rejects_unknown_weekday() {
        let config = WeeklyUnlockConfig {
            weekday: "someday".to_owned(),
            early_weekday: "wednesday".to_owned(),
            hour: 12,
            early_tiers: Vec::new(),
        };
        assert!(matches!(
            WeeklyUnlock::from_config(&config),
            Err(InvalidWeeklyUnlock::Weekday(_))
        ));
    }
}
