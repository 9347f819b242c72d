use alloc::collections::BTreeSet;
use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            #[must_use]
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(value).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

id_type!(
    /// A single scheduled occurrence of a class.
    SessionId
);
id_type!(UserId);
id_type!(BookingId);
id_type!(NotificationId);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown {kind} {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant,)+
        }

        impl $name {
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseEnumError {
                        kind: $kind,
                        value: value.to_owned(),
                    }),
                }
            }
        }
    };
}

string_enum!(
    /// Membership level a session can be restricted to.
    Tier, "tier" {
        Basic => "basic",
        Premium => "premium",
        Vip => "vip",
        Unlimited => "unlimited",
        Limited => "limited",
        Ticket => "ticket",
    }
);

string_enum!(Role, "role" {
    Member => "member",
    Coach => "coach",
    Admin => "admin",
});

string_enum!(BookingStatus, "booking status" {
    Confirmed => "confirmed",
    WaitingList => "waiting_list",
    Cancelled => "cancelled",
    Completed => "completed",
    NoShow => "no_show",
});

impl BookingStatus {
    /// Active bookings hold a seat or a waitlist position.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Confirmed | Self::WaitingList)
    }
}

/// Whoever issues a request. Administrators are exempt from blocks and from the late window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: UserId,
    pub role: Role,
}

impl Actor {
    #[must_use]
    pub const fn member(user: UserId) -> Self {
        Self {
            user,
            role: Role::Member,
        }
    }

    #[must_use]
    pub const fn admin(user: UserId) -> Self {
        Self {
            user,
            role: Role::Admin,
        }
    }

    #[must_use]
    pub const fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    #[must_use]
    pub const fn is_staff(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Coach)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSession {
    pub id: SessionId,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub capacity: u32,
    pub eligible_tiers: BTreeSet<Tier>,
    /// A full session without a waitlist rejects further requests.
    pub waitlist_enabled: bool,
}

impl ClassSession {
    #[must_use]
    pub fn admits(&self, tier: Tier) -> bool {
        self.eligible_tiers.contains(&tier)
    }

    #[must_use]
    pub fn time_until_start(&self, now: DateTime<Utc>) -> TimeDelta {
        self.starts_at - now
    }

    /// Fractional hours, negative once the class has started.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hours_until_start(&self, now: DateTime<Utc>) -> f64 {
        self.time_until_start(now).num_seconds() as f64 / 3600.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub session: SessionId,
    pub user: UserId,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only set while waitlisted, dense 1..N per session.
    pub waitlist_position: Option<u32>,
}

impl Booking {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    #[must_use]
    pub const fn is_confirmed(&self) -> bool {
        matches!(self.status, BookingStatus::Confirmed)
    }

    #[must_use]
    pub const fn is_waitlisted(&self) -> bool {
        matches!(self.status, BookingStatus::WaitingList)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_match_storage_format() {
        for status in [
            BookingStatus::Confirmed,
            BookingStatus::WaitingList,
            BookingStatus::Cancelled,
            BookingStatus::Completed,
            BookingStatus::NoShow,
        ] {
            assert_eq!(status.as_str().parse::<BookingStatus>(), Ok(status));
        }
        assert_eq!(BookingStatus::WaitingList.as_str(), "waiting_list");
        assert_eq!(
            serde_json::to_string(&BookingStatus::NoShow).unwrap(),
            "\"no_show\""
        );
        assert!("late".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn only_confirmed_and_waitlisted_are_active() {
        assert!(BookingStatus::Confirmed.is_active());
        assert!(BookingStatus::WaitingList.is_active());
        assert!(!BookingStatus::Cancelled.is_active());
        assert!(!BookingStatus::Completed.is_active());
        assert!(!BookingStatus::NoShow.is_active());
    }

    #[test]
    fn ids_round_trip_through_strings() {
        let id = SessionId::random();
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert_eq!(serde_json::to_string(&id).unwrap(), format!("\"{id}\""));
    }

    #[test]
    fn coaches_are_staff_but_not_admins() {
        let coach = Actor {
            user: UserId::random(),
            role: Role::Coach,
        };
        assert!(coach.is_staff());
        assert!(!coach.is_admin());
        assert!(Actor::admin(UserId::random()).is_admin());
        assert!(!Actor::member(UserId::random()).is_staff());
    }
}
