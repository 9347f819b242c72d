pub mod error;
pub mod models;
pub mod schema;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt as _;
use diesel_async::{AsyncConnection as _, AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection as _};
use error::DatabaseError;
use gym_booking_core::catalog::SessionView;
use gym_booking_core::error::{BookingError, StoreError};
use gym_booking_core::membership::Membership;
use gym_booking_core::penalty::PenaltyState;
use gym_booking_core::store::{BookingStore, Scope, SeatAvailable, UnitOfWork};
use gym_booking_core::types::{Booking, BookingId, ClassSession, NotificationId, SessionId, UserId};
use gym_booking_core::waitlist::{BookingChange, SessionLedger};
use schema::{bookings, class_sessions, memberships, penalty_states, seat_notifications};
use tracing::debug;
use uuid::Uuid;

use crate::models::{BookingRow, MembershipRow, NotificationRow, PenaltyRow, SessionRow};

// https://github.com/tokio-rs/axum/tree/main/examples/diesel-async-postgres

const SCHEMA: &str = include_str!("../migrations/2026-05-01-000000_create_bookings/up.sql");

const ACTIVE: [&str; 2] = ["confirmed", "waiting_list"];

pub fn get_database_connection(
    database_url: &str,
) -> Result<Pool<AsyncPgConnection>, DatabaseError> {
    let config = AsyncDieselConnectionManager::<diesel_async::AsyncPgConnection>::new(database_url);
    Ok(Pool::builder(config).build()?)
}

pub fn get_database_connection_from_env() -> Result<Pool<AsyncPgConnection>, DatabaseError> {
    let database_url = std::env::var("DATABASE_URL")?;
    get_database_connection(&database_url)
}

/// Either the policy code refused or the database failed, inside a transaction.
#[derive(thiserror::Error, Debug)]
enum TransactError {
    #[error(transparent)]
    Booking(#[from] BookingError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<diesel::result::Error> for TransactError {
    fn from(error: diesel::result::Error) -> Self {
        Self::Database(error.into())
    }
}

fn queue_order(bookings: &mut [Booking]) {
    bookings.sort_by_key(|booking| {
        (
            booking.is_waitlisted(),
            booking.waitlist_position,
            booking.created_at,
        )
    });
}

fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>, DatabaseError>
where
    T: TryFrom<R, Error = DatabaseError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// [`BookingStore`] on PostgreSQL. A transaction locks the scoped session rows and the user's
/// penalty row with `SELECT ... FOR UPDATE`, which serializes every writer of a session.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgStore {
    #[must_use]
    pub const fn new(pool: Pool<AsyncPgConnection>) -> Self {
        Self { pool }
    }

    pub fn from_url(database_url: &str) -> Result<Self, DatabaseError> {
        Ok(Self::new(get_database_connection(database_url)?))
    }

    async fn connection(&self) -> Result<Object<AsyncPgConnection>, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Creates missing tables and indexes.
    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        let mut connection = self.connection().await?;
        connection.batch_execute(SCHEMA).await?;
        Ok(())
    }

    /// Publishes or replaces a session.
    pub async fn upsert_session(&self, session: &ClassSession) -> Result<(), DatabaseError> {
        let row = SessionRow::try_from(session)?;
        let mut connection = self.connection().await?;
        diesel::insert_into(class_sessions::table)
            .values(&row)
            .on_conflict(class_sessions::id)
            .do_update()
            .set(&row)
            .execute(&mut connection)
            .await?;
        Ok(())
    }

    pub async fn upsert_membership(&self, membership: &Membership) -> Result<(), DatabaseError> {
        let row = MembershipRow::try_from(membership)?;
        let mut connection = self.connection().await?;
        diesel::insert_into(memberships::table)
            .values(&row)
            .on_conflict(memberships::user_id)
            .do_update()
            .set(&row)
            .execute(&mut connection)
            .await?;
        Ok(())
    }

    async fn active_bookings(
        connection: &mut AsyncPgConnection,
        sessions: &[Uuid],
    ) -> Result<Vec<Booking>, DatabaseError> {
        let rows = bookings::table
            .filter(bookings::session_id.eq_any(sessions))
            .filter(bookings::status.eq_any(ACTIVE))
            .select(BookingRow::as_select())
            .load(connection)
            .await?;
        let mut bookings = convert(rows)?;
        queue_order(&mut bookings);
        Ok(bookings)
    }

    async fn write(connection: &mut AsyncPgConnection, unit: UnitOfWork) -> Result<(), DatabaseError> {
        let changes = unit.into_changes();
        debug!(
            bookings = changes.bookings.len(),
            notifications = changes.notifications.len(),
            "committing"
        );
        for change in &changes.bookings {
            let row = BookingRow::try_from(change.booking())?;
            match change {
                BookingChange::Insert(_) => {
                    diesel::insert_into(bookings::table)
                        .values(&row)
                        .execute(connection)
                        .await?;
                }
                BookingChange::Update(_) => {
                    diesel::update(bookings::table.find(row.id))
                        .set(&row)
                        .execute(connection)
                        .await?;
                }
            }
        }
        if let Some(penalty) = &changes.penalty {
            let row = PenaltyRow::try_from(penalty)?;
            diesel::update(penalty_states::table.find(row.user_id))
                .set(&row)
                .execute(connection)
                .await?;
        }
        if let Some(membership) = &changes.membership {
            let row = MembershipRow::try_from(membership)?;
            diesel::update(memberships::table.find(row.user_id))
                .set(&row)
                .execute(connection)
                .await?;
        }
        if !changes.notifications.is_empty() {
            let rows: Vec<NotificationRow> =
                changes.notifications.iter().map(NotificationRow::from).collect();
            diesel::insert_into(seat_notifications::table)
                .values(&rows)
                .execute(connection)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BookingStore for PgStore {
    async fn session(&self, id: SessionId) -> Result<Option<ClassSession>, StoreError> {
        let mut connection = self.connection().await?;
        let row = class_sessions::table
            .find(id.0)
            .select(SessionRow::as_select())
            .first(&mut connection)
            .await
            .optional()
            .map_err(DatabaseError::from)?;
        Ok(row.map(ClassSession::try_from).transpose()?)
    }

    async fn sessions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SessionView>, StoreError> {
        let mut connection = self.connection().await?;
        let rows = class_sessions::table
            .filter(class_sessions::starts_at.ge(from))
            .filter(class_sessions::starts_at.lt(to))
            .order(class_sessions::starts_at)
            .select(SessionRow::as_select())
            .load(&mut connection)
            .await
            .map_err(DatabaseError::from)?;
        let sessions: Vec<ClassSession> = convert(rows)?;
        let ids: Vec<Uuid> = sessions.iter().map(|session| session.id.0).collect();
        let mut by_session: BTreeMap<SessionId, Vec<Booking>> = BTreeMap::new();
        for booking in Self::active_bookings(&mut connection, &ids).await? {
            by_session.entry(booking.session).or_default().push(booking);
        }
        Ok(sessions
            .into_iter()
            .map(|session| {
                let bookings = by_session.remove(&session.id).unwrap_or_default();
                SessionView::from_bookings(session, &bookings)
            })
            .collect())
    }

    async fn session_bookings(&self, session: SessionId) -> Result<Vec<Booking>, StoreError> {
        let mut connection = self.connection().await?;
        let rows = bookings::table
            .filter(bookings::session_id.eq(session.0))
            .select(BookingRow::as_select())
            .load(&mut connection)
            .await
            .map_err(DatabaseError::from)?;
        let mut bookings = convert(rows)?;
        queue_order(&mut bookings);
        Ok(bookings)
    }

    async fn booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        let mut connection = self.connection().await?;
        let row = bookings::table
            .find(id.0)
            .select(BookingRow::as_select())
            .first(&mut connection)
            .await
            .optional()
            .map_err(DatabaseError::from)?;
        Ok(row.map(Booking::try_from).transpose()?)
    }

    async fn penalty(&self, user: UserId) -> Result<PenaltyState, StoreError> {
        let mut connection = self.connection().await?;
        let row = penalty_states::table
            .find(user.0)
            .select(PenaltyRow::as_select())
            .first(&mut connection)
            .await
            .optional()
            .map_err(DatabaseError::from)?;
        Ok(row
            .map(PenaltyState::try_from)
            .transpose()?
            .unwrap_or_else(|| PenaltyState::new(user)))
    }

    async fn membership(&self, user: UserId) -> Result<Option<Membership>, StoreError> {
        let mut connection = self.connection().await?;
        let row = memberships::table
            .find(user.0)
            .select(MembershipRow::as_select())
            .first(&mut connection)
            .await
            .optional()
            .map_err(DatabaseError::from)?;
        Ok(row.map(Membership::try_from).transpose()?)
    }

    async fn transact<T, F>(
        &self,
        scope: Scope,
        now: DateTime<Utc>,
        work: F,
    ) -> Result<T, BookingError>
    where
        T: Send + 'static,
        F: FnOnce(&mut UnitOfWork) -> Result<T, BookingError> + Send + 'static,
    {
        let mut connection = self.connection().await.map_err(StoreError::from)?;
        let result = connection
            .transaction::<T, TransactError, _>(|connection| {
                async move {
                    let ids: Vec<Uuid> = scope.session_ids().iter().map(|id| id.0).collect();
                    // ordered by id, like every other transaction, so they never deadlock
                    let rows = class_sessions::table
                        .filter(class_sessions::id.eq_any(&ids))
                        .order(class_sessions::id)
                        .select(SessionRow::as_select())
                        .for_update()
                        .load(connection)
                        .await?;
                    let sessions: Vec<ClassSession> = convert(rows)?;
                    if let Some(missing) = scope
                        .session_ids()
                        .iter()
                        .find(|id| !sessions.iter().any(|session| session.id == **id))
                    {
                        return Err(BookingError::SessionNotFound(*missing).into());
                    }

                    let bookings = Self::active_bookings(connection, &ids).await?;
                    let mut ledgers = Vec::with_capacity(sessions.len());
                    for session in sessions {
                        let own = bookings
                            .iter()
                            .filter(|booking| booking.session == session.id)
                            .cloned()
                            .collect();
                        ledgers.push(SessionLedger::new(session, own));
                    }

                    let (penalty, membership) = match scope.user_id() {
                        Some(user) => {
                            diesel::insert_into(penalty_states::table)
                                .values(PenaltyRow::clean(user))
                                .on_conflict_do_nothing()
                                .execute(connection)
                                .await?;
                            let penalty = penalty_states::table
                                .find(user.0)
                                .select(PenaltyRow::as_select())
                                .for_update()
                                .first(connection)
                                .await?;
                            let membership = memberships::table
                                .find(user.0)
                                .select(MembershipRow::as_select())
                                .for_update()
                                .first(connection)
                                .await
                                .optional()?;
                            (
                                Some(PenaltyState::try_from(penalty)?),
                                membership.map(Membership::try_from).transpose()?,
                            )
                        }
                        None => (None, None),
                    };

                    let mut unit = UnitOfWork::new(now, ledgers, penalty, membership);
                    let value = work(&mut unit)?;
                    Self::write(connection, unit).await?;
                    Ok(value)
                }
                .scope_boxed()
            })
            .await;
        match result {
            Ok(value) => Ok(value),
            Err(TransactError::Booking(error)) => Err(error),
            Err(TransactError::Database(error)) => Err(StoreError::from(error).into()),
        }
    }

    async fn pending_notifications(&self, limit: usize) -> Result<Vec<SeatAvailable>, StoreError> {
        let mut connection = self.connection().await?;
        let rows = seat_notifications::table
            .filter(seat_notifications::delivered_at.is_null())
            .order(seat_notifications::promoted_at)
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .select(NotificationRow::as_select())
            .load(&mut connection)
            .await
            .map_err(DatabaseError::from)?;
        Ok(rows.into_iter().map(SeatAvailable::from).collect())
    }

    async fn mark_notified(&self, id: NotificationId) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        diesel::update(seat_notifications::table.find(id.0))
            .set(seat_notifications::delivered_at.eq(Some(Utc::now())))
            .execute(&mut connection)
            .await
            .map_err(DatabaseError::from)?;
        Ok(())
    }
}
