//! Capacity and waitlist bookkeeping of a single session.
//!
//! A [`SessionLedger`] is the locked snapshot of one session and all of its bookings inside a
//! store transaction. It upholds two invariants after every operation:
//! confirmed bookings never exceed capacity, and waitlist positions are exactly `1..=N`.

use alloc::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::BookingError;
use crate::types::{Booking, BookingId, BookingStatus, ClassSession, UserId};

/// Persisted change of a booking, in the order it has to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BookingChange {
    Insert(Booking),
    Update(Booking),
}

impl BookingChange {
    #[must_use]
    pub const fn booking(&self) -> &Booking {
        match self {
            Self::Insert(booking) | Self::Update(booking) => booking,
        }
    }
}

/// Outcome of taking a booking out of the active set.
#[derive(Clone, Debug)]
pub struct Released {
    pub booking: Booking,
    pub freed_seat: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attendance {
    Attended,
    NoShow,
}

impl Attendance {
    const fn status(self) -> BookingStatus {
        match self {
            Self::Attended => BookingStatus::Completed,
            Self::NoShow => BookingStatus::NoShow,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionLedger {
    session: ClassSession,
    bookings: Vec<Booking>,
    inserted: BTreeSet<BookingId>,
    updated: BTreeSet<BookingId>,
}

impl SessionLedger {
    #[must_use]
    pub fn new(session: ClassSession, bookings: Vec<Booking>) -> Self {
        debug_assert!(bookings.iter().all(|booking| booking.session == session.id));
        Self {
            session,
            bookings,
            inserted: BTreeSet::new(),
            updated: BTreeSet::new(),
        }
    }

    #[must_use]
    pub const fn session(&self) -> &ClassSession {
        &self.session
    }

    #[must_use]
    pub fn bookings(&self) -> &[Booking] {
        &self.bookings
    }

    #[must_use]
    pub fn confirmed_count(&self) -> u32 {
        let confirmed = self.bookings.iter().filter(|b| b.is_confirmed()).count();
        u32::try_from(confirmed).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn waitlist_len(&self) -> u32 {
        let waiting = self.bookings.iter().filter(|b| b.is_waitlisted()).count();
        u32::try_from(waiting).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn has_free_seat(&self) -> bool {
        self.confirmed_count() < self.session.capacity
    }

    /// Waitlisted bookings by ascending position.
    #[must_use]
    pub fn waitlist(&self) -> Vec<&Booking> {
        let mut waiting: Vec<&Booking> =
            self.bookings.iter().filter(|b| b.is_waitlisted()).collect();
        waiting.sort_by_key(|b| (b.waitlist_position, b.created_at));
        waiting
    }

    #[must_use]
    pub fn active_booking(&self, user: UserId) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|booking| booking.user == user && booking.is_active())
    }

    #[must_use]
    pub fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.bookings.iter().find(|booking| booking.id == id)
    }

    /// Confirms while a seat is free, otherwise queues at the end of the waitlist.
    pub fn reserve(&mut self, user: UserId, now: DateTime<Utc>) -> Result<Booking, BookingError> {
        if self.active_booking(user).is_some() {
            return Err(BookingError::AlreadyBooked);
        }
        if self.has_free_seat() {
            return Ok(self.insert(user, BookingStatus::Confirmed, None, now));
        }
        if !self.session.waitlist_enabled {
            return Err(BookingError::SessionFull);
        }
        let position = self.waitlist_len() + 1;
        Ok(self.insert(user, BookingStatus::WaitingList, Some(position), now))
    }

    /// Takes a seat or fails, never queues.
    pub fn reserve_seat(&mut self, user: UserId, now: DateTime<Utc>) -> Result<Booking, BookingError> {
        if self.active_booking(user).is_some() {
            return Err(BookingError::AlreadyBooked);
        }
        if !self.has_free_seat() {
            return Err(BookingError::SessionFull);
        }
        Ok(self.insert(user, BookingStatus::Confirmed, None, now))
    }

    fn insert(
        &mut self,
        user: UserId,
        status: BookingStatus,
        waitlist_position: Option<u32>,
        now: DateTime<Utc>,
    ) -> Booking {
        let booking = Booking {
            id: BookingId::random(),
            session: self.session.id,
            user,
            status,
            created_at: now,
            updated_at: now,
            waitlist_position,
        };
        info!(
            booking = %booking.id,
            session = %self.session.id,
            %user,
            %status,
            position = ?waitlist_position,
            "reserved"
        );
        self.inserted.insert(booking.id);
        self.bookings.push(booking.clone());
        booking
    }

    fn transition(
        &mut self,
        id: BookingId,
        to: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<Booking, BookingError> {
        let booking = self
            .bookings
            .iter_mut()
            .find(|booking| booking.id == id)
            .ok_or(BookingError::BookingNotFound)?;
        let allowed = match (booking.status, to) {
            (BookingStatus::Confirmed | BookingStatus::WaitingList, BookingStatus::Cancelled)
            | (
                BookingStatus::Confirmed,
                BookingStatus::Completed | BookingStatus::NoShow,
            )
            | (BookingStatus::WaitingList, BookingStatus::Confirmed) => true,
            _ => false,
        };
        if !allowed {
            return Err(BookingError::InvalidTransition {
                from: booking.status,
                to,
            });
        }
        booking.status = to;
        booking.waitlist_position = None;
        booking.updated_at = now;
        let booking = booking.clone();
        self.touch(id);
        Ok(booking)
    }

    fn touch(&mut self, id: BookingId) {
        if !self.inserted.contains(&id) {
            self.updated.insert(id);
        }
    }

    /// Cancels an active booking. A released waitlist position closes its gap, a released
    /// seat is reported so that the caller promotes exactly once for it.
    pub fn release(&mut self, id: BookingId, now: DateTime<Utc>) -> Result<Released, BookingError> {
        let freed_seat = self
            .booking(id)
            .ok_or(BookingError::BookingNotFound)?
            .is_confirmed();
        let booking = self.transition(id, BookingStatus::Cancelled, now)?;
        if !freed_seat {
            self.reindex_waitlist(now);
        }
        Ok(Released {
            booking,
            freed_seat,
        })
    }

    /// Confirms the head of the waitlist if a seat is free.
    pub fn promote_next(&mut self, now: DateTime<Utc>) -> Option<Booking> {
        if !self.has_free_seat() {
            return None;
        }
        let head = self.waitlist().first().map(|booking| booking.id)?;
        let promoted = self
            .transition(head, BookingStatus::Confirmed, now)
            .ok()?;
        self.reindex_waitlist(now);
        info!(booking = %promoted.id, session = %self.session.id, user = %promoted.user, "promoted from waitlist");
        Some(promoted)
    }

    /// Only once the class has started, so a freed seat never bypasses the waitlist.
    pub fn record_attendance(
        &mut self,
        id: BookingId,
        attendance: Attendance,
        now: DateTime<Utc>,
    ) -> Result<Booking, BookingError> {
        if now < self.session.starts_at {
            return Err(BookingError::ClassNotStarted {
                starts_at: self.session.starts_at,
            });
        }
        self.transition(id, attendance.status(), now)
    }

    /// Renumbers the waitlist to `1..=N`, keeping the relative order.
    fn reindex_waitlist(&mut self, now: DateTime<Utc>) {
        let order: Vec<BookingId> = self.waitlist().iter().map(|booking| booking.id).collect();
        for (index, id) in order.into_iter().enumerate() {
            let position = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let Some(booking) = self.bookings.iter_mut().find(|booking| booking.id == id) else {
                continue;
            };
            if booking.waitlist_position != Some(position) {
                debug!(booking = %id, from = ?booking.waitlist_position, to = position, "moving up the waitlist");
                booking.waitlist_position = Some(position);
                booking.updated_at = now;
                self.touch(id);
            }
        }
    }

    /// Changed bookings ordered so that unique waitlist positions never collide while
    /// written one by one: status changes first, then waitlist entries by ascending position.
    #[must_use]
    pub fn changes(&self) -> Vec<BookingChange> {
        let mut changed: Vec<&Booking> = self
            .bookings
            .iter()
            .filter(|b| self.inserted.contains(&b.id) || self.updated.contains(&b.id))
            .collect();
        changed.sort_by_key(|b| (b.is_waitlisted(), b.waitlist_position));
        changed
            .into_iter()
            .map(|booking| {
                if self.inserted.contains(&booking.id) {
                    BookingChange::Insert(booking.clone())
                } else {
                    BookingChange::Update(booking.clone())
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeDelta, TimeZone as _};

    use super::*;
    use crate::types::{SessionId, Tier};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 10, 0, 0).unwrap()
    }

    fn ledger(capacity: u32) -> SessionLedger {
        SessionLedger::new(
            ClassSession {
                id: SessionId::random(),
                title: "HIIT".to_owned(),
                starts_at: now() + TimeDelta::days(1),
                capacity,
                eligible_tiers: BTreeSet::from([Tier::Basic]),
                waitlist_enabled: true,
            },
            Vec::new(),
        )
    }

    fn positions(ledger: &SessionLedger) -> Vec<Option<u32>> {
        ledger
            .waitlist()
            .iter()
            .map(|b| b.waitlist_position)
            .collect()
    }

    #[test]
    fn fills_seats_then_queues() {
        let mut ledger = ledger(2);
        assert!(ledger.reserve(UserId::random(), now()).unwrap().is_confirmed());
        assert!(ledger.reserve(UserId::random(), now()).unwrap().is_confirmed());
        let third = ledger.reserve(UserId::random(), now()).unwrap();
        assert_eq!(third.status, BookingStatus::WaitingList);
        assert_eq!(third.waitlist_position, Some(1));
        let fourth = ledger.reserve(UserId::random(), now()).unwrap();
        assert_eq!(fourth.waitlist_position, Some(2));
        assert_eq!(ledger.confirmed_count(), 2);
    }

    #[test]
    fn second_active_booking_is_rejected() {
        let mut ledger = ledger(1);
        let user = UserId::random();
        ledger.reserve(user, now()).unwrap();
        assert_eq!(
            ledger.reserve(user, now()).err(),
            Some(BookingError::AlreadyBooked)
        );
    }

    #[test]
    fn full_session_without_waitlist_is_full() {
        let mut ledger = ledger(1);
        ledger.session.waitlist_enabled = false;
        ledger.reserve(UserId::random(), now()).unwrap();
        assert_eq!(
            ledger.reserve(UserId::random(), now()).err(),
            Some(BookingError::SessionFull)
        );
    }

    #[test]
    fn promotion_takes_the_head_and_closes_the_gap() {
        let mut ledger = ledger(1);
        let seat = ledger.reserve(UserId::random(), now()).unwrap();
        let first = ledger.reserve(UserId::random(), now()).unwrap();
        let second = ledger.reserve(UserId::random(), now()).unwrap();
        let third = ledger.reserve(UserId::random(), now()).unwrap();

        let released = ledger.release(seat.id, now()).unwrap();
        assert!(released.freed_seat);
        assert_eq!(released.booking.status, BookingStatus::Cancelled);
        let promoted = ledger.promote_next(now()).unwrap();
        assert_eq!(promoted.id, first.id);
        assert_eq!(promoted.waitlist_position, None);
        assert_eq!(positions(&ledger), vec![Some(1), Some(2)]);
        assert_eq!(ledger.waitlist()[0].id, second.id);
        assert_eq!(ledger.waitlist()[1].id, third.id);
        assert_eq!(ledger.promote_next(now()), None);
    }

    #[test]
    fn leaving_the_waitlist_renumbers_without_promoting() {
        let mut ledger = ledger(1);
        ledger.reserve(UserId::random(), now()).unwrap();
        let first = ledger.reserve(UserId::random(), now()).unwrap();
        let second = ledger.reserve(UserId::random(), now()).unwrap();

        let released = ledger.release(first.id, now()).unwrap();
        assert!(!released.freed_seat);
        assert_eq!(positions(&ledger), vec![Some(1)]);
        assert_eq!(ledger.waitlist()[0].id, second.id);
        assert_eq!(ledger.confirmed_count(), 1);
    }

    #[test]
    fn attendance_only_from_confirmed() {
        let mut ledger = ledger(1);
        let seat = ledger.reserve(UserId::random(), now()).unwrap();
        let waiting = ledger.reserve(UserId::random(), now()).unwrap();
        let during = ledger.session.starts_at + TimeDelta::minutes(30);
        assert_eq!(
            ledger
                .record_attendance(seat.id, Attendance::Attended, during)
                .unwrap()
                .status,
            BookingStatus::Completed
        );
        assert_eq!(
            ledger
                .record_attendance(waiting.id, Attendance::NoShow, during)
                .err(),
            Some(BookingError::InvalidTransition {
                from: BookingStatus::WaitingList,
                to: BookingStatus::NoShow,
            })
        );
    }

    #[test]
    fn attendance_waits_for_the_class_to_start() {
        let mut ledger = ledger(1);
        let seat = ledger.reserve(UserId::random(), now()).unwrap();
        ledger.reserve(UserId::random(), now()).unwrap();
        let starts_at = ledger.session.starts_at;
        assert_eq!(
            ledger
                .record_attendance(seat.id, Attendance::NoShow, starts_at - TimeDelta::minutes(1))
                .err(),
            Some(BookingError::ClassNotStarted { starts_at })
        );
        assert_eq!(ledger.confirmed_count(), 1);
        assert_eq!(ledger.waitlist_len(), 1);
        assert_eq!(
            ledger
                .record_attendance(seat.id, Attendance::NoShow, starts_at)
                .unwrap()
                .status,
            BookingStatus::NoShow
        );
    }

    #[test]
    fn changes_write_status_changes_before_waitlist_moves() {
        let session = ledger(1).session;
        let seat = Booking {
            id: BookingId::random(),
            session: session.id,
            user: UserId::random(),
            status: BookingStatus::Confirmed,
            created_at: now(),
            updated_at: now(),
            waitlist_position: None,
        };
        let waiting: Vec<Booking> = (1..=3)
            .map(|position| Booking {
                id: BookingId::random(),
                status: BookingStatus::WaitingList,
                user: UserId::random(),
                waitlist_position: Some(position),
                ..seat.clone()
            })
            .collect();
        let mut bookings = vec![seat.clone()];
        bookings.extend(waiting.iter().rev().cloned());
        let mut ledger = SessionLedger::new(session, bookings);

        ledger.release(seat.id, now()).unwrap();
        ledger.promote_next(now()).unwrap();
        let changes = ledger.changes();
        let written: Vec<(BookingId, Option<u32>)> = changes
            .iter()
            .map(|change| {
                assert!(matches!(change, BookingChange::Update(_)));
                (change.booking().id, change.booking().waitlist_position)
            })
            .collect();
        // cancelled and promoted rows leave the waitlist before the rest moves up
        assert_eq!(written.len(), 4);
        assert!(written[..2].iter().all(|(_, position)| position.is_none()));
        assert_eq!(
            written[2..].to_vec(),
            vec![(waiting[1].id, Some(1)), (waiting[2].id, Some(2))]
        );
    }
}
