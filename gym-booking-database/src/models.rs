use chrono::{DateTime, Utc};
use diesel::prelude::*;
use gym_booking_core::membership::{Membership, Plan};
use gym_booking_core::penalty::PenaltyState;
use gym_booking_core::store::SeatAvailable;
use gym_booking_core::types::{Booking, BookingStatus, ClassSession, Tier, UserId};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::schema::{bookings, class_sessions, memberships, penalty_states, seat_notifications};

fn to_i32(value: u32) -> Result<i32, DatabaseError> {
    i32::try_from(value).map_err(|_| DatabaseError::Corrupt(format!("{value} does not fit a column")))
}

fn to_u32(column: &str, value: i32) -> Result<u32, DatabaseError> {
    u32::try_from(value).map_err(|_| DatabaseError::Corrupt(format!("negative {column}: {value}")))
}

fn tier(value: &str) -> Result<Tier, DatabaseError> {
    value
        .parse()
        .map_err(|error| DatabaseError::Corrupt(format!("{error}")))
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = class_sessions)]
pub struct SessionRow {
    pub id: Uuid,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub capacity: i32,
    pub eligible_tiers: Vec<String>,
    pub waitlist_enabled: bool,
}

impl TryFrom<&ClassSession> for SessionRow {
    type Error = DatabaseError;

    fn try_from(session: &ClassSession) -> Result<Self, Self::Error> {
        Ok(Self {
            id: session.id.0,
            title: session.title.clone(),
            starts_at: session.starts_at,
            capacity: to_i32(session.capacity)?,
            eligible_tiers: session
                .eligible_tiers
                .iter()
                .map(|tier| tier.as_str().to_owned())
                .collect(),
            waitlist_enabled: session.waitlist_enabled,
        })
    }
}

impl TryFrom<SessionRow> for ClassSession {
    type Error = DatabaseError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            title: row.title,
            starts_at: row.starts_at,
            capacity: to_u32("capacity", row.capacity)?,
            eligible_tiers: row
                .eligible_tiers
                .iter()
                .map(|value| tier(value))
                .collect::<Result<_, _>>()?,
            waitlist_enabled: row.waitlist_enabled,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = bookings, treat_none_as_null = true)]
pub struct BookingRow {
    pub id: Uuid,
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub waitlist_position: Option<i32>,
}

impl TryFrom<&Booking> for BookingRow {
    type Error = DatabaseError;

    fn try_from(booking: &Booking) -> Result<Self, Self::Error> {
        Ok(Self {
            id: booking.id.0,
            session_id: booking.session.0,
            user_id: booking.user.0,
            status: booking.status.as_str().to_owned(),
            created_at: booking.created_at,
            updated_at: booking.updated_at,
            waitlist_position: booking.waitlist_position.map(to_i32).transpose()?,
        })
    }
}

impl TryFrom<BookingRow> for Booking {
    type Error = DatabaseError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            session: row.session_id.into(),
            user: row.user_id.into(),
            status: row
                .status
                .parse::<BookingStatus>()
                .map_err(|error| DatabaseError::Corrupt(format!("{error}")))?,
            created_at: row.created_at,
            updated_at: row.updated_at,
            waitlist_position: row
                .waitlist_position
                .map(|position| to_u32("waitlist position", position))
                .transpose()?,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = penalty_states, treat_none_as_null = true)]
pub struct PenaltyRow {
    pub user_id: Uuid,
    pub late_cancellation_count: i32,
    pub block_end: Option<DateTime<Utc>>,
}

impl PenaltyRow {
    pub const fn clean(user: UserId) -> Self {
        Self {
            user_id: user.0,
            late_cancellation_count: 0,
            block_end: None,
        }
    }
}

impl TryFrom<&PenaltyState> for PenaltyRow {
    type Error = DatabaseError;

    fn try_from(state: &PenaltyState) -> Result<Self, Self::Error> {
        Ok(Self {
            user_id: state.user.0,
            late_cancellation_count: to_i32(state.late_cancellation_count)?,
            block_end: state.block_end,
        })
    }
}

impl TryFrom<PenaltyRow> for PenaltyState {
    type Error = DatabaseError;

    fn try_from(row: PenaltyRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user: row.user_id.into(),
            late_cancellation_count: to_u32("late cancellation count", row.late_cancellation_count)?,
            block_end: row.block_end,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, AsChangeset, Debug)]
#[diesel(table_name = memberships, treat_none_as_null = true)]
pub struct MembershipRow {
    pub user_id: Uuid,
    pub kind: String,
    pub tier: Option<String>,
    pub classes_per_month: Option<i32>,
    pub classes_used: i32,
    pub total_sessions: Option<i32>,
    pub sessions_used: i32,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<&Membership> for MembershipRow {
    type Error = DatabaseError;

    fn try_from(membership: &Membership) -> Result<Self, Self::Error> {
        let user_id = membership.user.0;
        Ok(match &membership.plan {
            Plan::Subscription {
                tier,
                classes_per_month,
                classes_used,
                expires_at,
            } => Self {
                user_id,
                kind: "subscription".to_owned(),
                tier: Some(tier.as_str().to_owned()),
                classes_per_month: classes_per_month.map(to_i32).transpose()?,
                classes_used: to_i32(*classes_used)?,
                total_sessions: None,
                sessions_used: 0,
                expires_at: *expires_at,
            },
            Plan::Ticket {
                total_sessions,
                sessions_used,
                expires_at,
            } => Self {
                user_id,
                kind: "ticket".to_owned(),
                tier: None,
                classes_per_month: None,
                classes_used: 0,
                total_sessions: Some(to_i32(*total_sessions)?),
                sessions_used: to_i32(*sessions_used)?,
                expires_at: *expires_at,
            },
        })
    }
}

impl TryFrom<MembershipRow> for Membership {
    type Error = DatabaseError;

    fn try_from(row: MembershipRow) -> Result<Self, Self::Error> {
        let plan = match (row.kind.as_str(), row.tier, row.total_sessions) {
            ("subscription", Some(value), _) => Plan::Subscription {
                tier: tier(&value)?,
                classes_per_month: row
                    .classes_per_month
                    .map(|limit| to_u32("classes per month", limit))
                    .transpose()?,
                classes_used: to_u32("classes used", row.classes_used)?,
                expires_at: row.expires_at,
            },
            ("ticket", _, Some(total)) => Plan::Ticket {
                total_sessions: to_u32("total sessions", total)?,
                sessions_used: to_u32("sessions used", row.sessions_used)?,
                expires_at: row.expires_at,
            },
            (kind, ..) => {
                return Err(DatabaseError::Corrupt(format!(
                    "incomplete {kind} membership of {}",
                    row.user_id
                )))
            }
        };
        Ok(Self {
            user: row.user_id.into(),
            plan,
        })
    }
}

#[derive(Queryable, Selectable, Insertable, Debug)]
#[diesel(table_name = seat_notifications)]
pub struct NotificationRow {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub promoted_at: DateTime<Utc>,
}

impl From<&SeatAvailable> for NotificationRow {
    fn from(notice: &SeatAvailable) -> Self {
        Self {
            id: notice.id.0,
            booking_id: notice.booking.0,
            user_id: notice.user.0,
            session_id: notice.session.0,
            promoted_at: notice.promoted_at,
        }
    }
}

impl From<NotificationRow> for SeatAvailable {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id.into(),
            booking: row.booking_id.into(),
            user: row.user_id.into(),
            session: row.session_id.into(),
            promoted_at: row.promoted_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeZone as _;
    use gym_booking_core::types::{BookingId, SessionId};

    use super::*;

    #[test]
    fn waitlisted_booking_keeps_its_position() {
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap();
        let booking = Booking {
            id: BookingId::random(),
            session: SessionId::random(),
            user: UserId::random(),
            status: BookingStatus::WaitingList,
            created_at: now,
            updated_at: now,
            waitlist_position: Some(3),
        };
        let row = BookingRow::try_from(&booking).unwrap();
        assert_eq!(row.status, "waiting_list");
        assert_eq!(row.waitlist_position, Some(3));
        assert_eq!(Booking::try_from(row).unwrap(), booking);
    }

    #[test]
    fn unknown_tier_is_corrupt() {
        let row = SessionRow {
            id: Uuid::nil(),
            title: "Yoga".to_owned(),
            starts_at: Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
            capacity: 10,
            eligible_tiers: vec!["basic".to_owned(), "gold".to_owned()],
            waitlist_enabled: true,
        };
        assert!(matches!(
            ClassSession::try_from(row),
            Err(DatabaseError::Corrupt(_))
        ));
    }

    #[test]
    fn ticket_membership_without_total_is_corrupt() {
        let row = MembershipRow {
            user_id: Uuid::nil(),
            kind: "ticket".to_owned(),
            tier: None,
            classes_per_month: None,
            classes_used: 0,
            total_sessions: None,
            sessions_used: 2,
            expires_at: None,
        };
        assert!(matches!(
            Membership::try_from(row),
            Err(DatabaseError::Corrupt(_))
        ));
    }

    #[test]
    fn tiers_are_stored_by_name() {
        let session = ClassSession {
            id: SessionId::random(),
            title: "Pilates".to_owned(),
            starts_at: Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap(),
            capacity: 4,
            eligible_tiers: BTreeSet::from([Tier::Ticket, Tier::Vip]),
            waitlist_enabled: false,
        };
        let row = SessionRow::try_from(&session).unwrap();
        assert_eq!(row.eligible_tiers, vec!["vip", "ticket"]);
    }
}
