//! Integration tests for the reservation service.

#![cfg(feature = "test-util")]

use std::{collections::HashSet, sync::Arc, time::Duration};

use eventide::{
    VirtualClock,
    reservation::{ReservationConfig, ReservationService},
};

fn service(clock: &VirtualClock) -> Arc<ReservationService> {
    Arc::new(
        ReservationService::new(Arc::new(clock.clone()))
            .with_config(ReservationConfig::default().with_default_lease(Duration::from_secs(60))),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_tasks_get_one_owner_per_value() {
    let clock = VirtualClock::starting_now();
    let service = service(&clock);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                let value = format!("user-{}", i % 4);
                service
                    .reserve(&value, "usernames", &format!("owner-{i}"), None)
                    .then_some(value)
            })
        })
        .collect();

    let mut winners = Vec::new();
    for task in tasks {
        if let Some(value) = task.await.unwrap() {
            winners.push(value);
        }
    }
    winners.sort();
    assert_eq!(winners, vec!["user-0", "user-1", "user-2", "user-3"]);
}

#[tokio::test]
async fn lease_expiry_transfers_ownership() {
    let clock = VirtualClock::starting_now();
    let service = service(&clock);

    assert!(service.reserve("alice", "usernames", "first", Some(Duration::from_secs(10))));
    clock.advance_by(Duration::from_secs(9)).await.unwrap();
    assert!(!service.reserve("alice", "usernames", "second", None));

    clock.advance_by(Duration::from_secs(1)).await.unwrap();
    assert!(service.reserve("alice", "usernames", "second", None));
    assert!(!service.cancel("alice", "usernames", "first"));
    assert!(!service.confirm("alice", "usernames", "first"));
    assert!(service.confirm("alice", "usernames", "second"));
}

#[tokio::test]
async fn expired_pool_entries_are_reclaimed() {
    let clock = VirtualClock::starting_now();
    let service = service(&clock);
    service.make_available("seats", ["1A", "1B"]);

    let a = service.reserve_any("seats", "alice", None, Some("booking-a")).unwrap();
    let b = service.reserve_any("seats", "bob", None, Some("booking-b")).unwrap();
    assert_ne!(a, b);
    assert!(service.reserve_any("seats", "carol", None, Some("booking-c")).is_none());

    assert!(service.confirm("booking-a", "seats", "alice"));
    clock.advance_by(Duration::from_secs(61)).await.unwrap();

    // Bob never confirmed, so the seat goes back to the pool.
    let c = service.reserve_any("seats", "carol", None, Some("booking-c")).unwrap();
    assert_eq!(c, b);
    let seat = service.get_reserved_value(&c, "seats").unwrap();
    assert_eq!(seat.owner_token, "carol");
    assert_eq!(seat.confirmation_token, "booking-c");
    assert!(!service.confirm("booking-b", "seats", "bob"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reserve_any_tokens_stay_unique_under_contention() {
    let clock = VirtualClock::starting_now();
    let service = service(&clock);
    service.make_available("seats", (0..16).map(|i| format!("seat-{i}")));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let service = Arc::clone(&service);
            tokio::spawn(async move {
                // Pairs of callers share a confirmation token.
                let token = format!("booking-{}", i / 2);
                service
                    .reserve_any("seats", &format!("owner-{i}"), None, Some(&token))
                    .map(|seat| (seat, token))
            })
        })
        .collect();

    let mut claims = Vec::new();
    for task in tasks {
        if let Some(claim) = task.await.unwrap() {
            claims.push(claim);
        }
    }

    let seats: HashSet<_> = claims.iter().map(|(seat, _)| seat.clone()).collect();
    let tokens: HashSet<_> = claims.iter().map(|(_, token)| token.clone()).collect();
    assert_eq!(seats.len(), claims.len());
    assert_eq!(tokens.len(), claims.len());
    assert!(!claims.is_empty());
}
