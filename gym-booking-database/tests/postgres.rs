//! Needs a scratch database, e.g.
//! `podman run --rm -e POSTGRES_HOST_AUTH_METHOD=trust -p 5432:5432 docker.io/postgres`
//! and `DATABASE_URL=postgres://postgres@localhost/postgres`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use gym_booking_core::cancellation::CancellationOutcome;
use gym_booking_core::clock::SystemClock;
use gym_booking_core::membership::{Membership, Plan};
use gym_booking_core::notify::LogNotifier;
use gym_booking_core::policy::Policy;
use gym_booking_core::store::BookingStore;
use gym_booking_core::types::{Actor, ClassSession, SessionId, Tier, UserId};
use gym_booking_core::BookingService;
use gym_booking_database::{get_database_connection_from_env, PgStore};

async fn store() -> Arc<PgStore> {
    let store = PgStore::new(get_database_connection_from_env().unwrap());
    store.migrate().await.unwrap();
    Arc::new(store)
}

async fn member(store: &PgStore) -> UserId {
    let user = UserId::random();
    store
        .upsert_membership(&Membership {
            user,
            plan: Plan::Subscription {
                tier: Tier::Basic,
                classes_per_month: None,
                classes_used: 0,
                expires_at: None,
            },
        })
        .await
        .unwrap();
    user
}

#[tokio::test]
#[ignore = "needs a postgres database in DATABASE_URL"]
async fn concurrent_requests_share_one_seat_and_a_dense_waitlist() {
    let store = store().await;
    let session = ClassSession {
        id: SessionId::random(),
        title: "Kettlebell".to_owned(),
        starts_at: Utc::now() + TimeDelta::days(1),
        capacity: 1,
        eligible_tiers: BTreeSet::from([Tier::Basic]),
        waitlist_enabled: true,
    };
    store.upsert_session(&session).await.unwrap();
    let service = Arc::new(BookingService::new(
        Arc::clone(&store),
        Arc::new(LogNotifier),
        Arc::new(SystemClock),
        Policy::default(),
    ));

    let mut users = Vec::new();
    for _ in 0..8 {
        users.push(member(&store).await);
    }
    let handles: Vec<_> = users
        .iter()
        .map(|&user| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                service
                    .request_booking(Actor::member(user), user, session.id)
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let bookings = store.session_bookings(session.id).await.unwrap();
    assert_eq!(bookings.iter().filter(|b| b.is_confirmed()).count(), 1);
    let positions: Vec<Option<u32>> = bookings
        .iter()
        .filter(|b| b.is_waitlisted())
        .map(|b| b.waitlist_position)
        .collect();
    assert_eq!(positions, (1..=7).map(Some).collect::<Vec<_>>());

    // freeing the seat promotes the head and queues exactly one notification
    let seated = bookings.iter().find(|b| b.is_confirmed()).unwrap().user;
    let outcome = service
        .request_cancellation(Actor::member(seated), seated, session.id)
        .await
        .unwrap();
    let CancellationOutcome::Cancelled(receipt) = outcome else {
        panic!("a day ahead is not late");
    };
    assert_eq!(receipt.promoted.map(|b| b.id), Some(bookings[1].id));
    let waiting = store.session_bookings(session.id).await.unwrap();
    let positions: Vec<Option<u32>> = waiting
        .iter()
        .filter(|b| b.is_waitlisted())
        .map(|b| b.waitlist_position)
        .collect();
    assert_eq!(positions, (1..=6).map(Some).collect::<Vec<_>>());
    assert!(service.flush_notifications().await.unwrap() >= 1);
}
