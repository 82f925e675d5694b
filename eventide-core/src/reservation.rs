//! Leased, ownership-tagged claims on values that must be unique in a scope.
//!
//! A reservation starts with a lease. The owner either confirms it, making
//! it permanent, or lets it lapse, after which anyone may take it over.
//! Every change is a compare-and-swap against a snapshot read earlier, so
//! racing callers never lose each other's updates.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};

use crate::clock::{self, Clock, SystemClock};

/// A reservation as stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedValue {
    pub value: String,
    pub scope: String,
    pub owner_token: String,
    /// Token [`ReservationService::confirm`] looks the reservation up by.
    /// Unique within the scope.
    pub confirmation_token: String,
    /// `None` once confirmed.
    pub expiration: Option<DateTime<Utc>>,
}

impl ReservedValue {
    pub const fn is_confirmed(&self) -> bool {
        self.expiration.is_none()
    }

    /// Whether the lease ran out at or before `now`. Confirmed
    /// reservations never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }
}

/// Reservation service configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservationConfig {
    /// Lease used when a caller does not pass one.
    pub default_lease: Duration,
}

impl Default for ReservationConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(60),
        }
    }
}

impl ReservationConfig {
    #[must_use]
    pub const fn with_default_lease(mut self, default_lease: Duration) -> Self {
        self.default_lease = default_lease;
        self
    }
}

type Key = (String, String);

fn key(scope: &str, value: &str) -> Key {
    (scope.to_string(), value.to_string())
}

/// Concurrent, in-memory reservation service.
pub struct ReservationService {
    entries: DashMap<Key, ReservedValue>,
    clock: Arc<dyn Clock>,
    config: ReservationConfig,
}

impl Default for ReservationService {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl fmt::Debug for ReservationService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationService")
            .field("entries", &self.entries.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReservationService {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            config: ReservationConfig::default(),
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: ReservationConfig) -> Self {
        self.config = config;
        self
    }

    fn expiry(&self, lease: Option<Duration>) -> DateTime<Utc> {
        clock::offset(
            self.clock.now(),
            lease.unwrap_or(self.config.default_lease),
        )
    }

    /// Replace (or remove, for `None`) the entry at `key` only if it still
    /// equals `expected`.
    fn compare_and_swap(
        &self,
        key: Key,
        expected: &ReservedValue,
        replacement: Option<ReservedValue>,
    ) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) if occupied.get() == expected => {
                match replacement {
                    Some(replacement) => {
                        occupied.insert(replacement);
                    }
                    None => {
                        occupied.remove();
                    }
                }
                true
            }
            Entry::Occupied(_) | Entry::Vacant(_) => false,
        }
    }

    fn insert_if_absent(&self, key: Key, value: ReservedValue) -> bool {
        match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(value);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    fn snapshot(&self, scope: &str, value: &str) -> Option<ReservedValue> {
        self.entries
            .get(&key(scope, value))
            .map(|entry| entry.value().clone())
    }

    /// Snapshots of every entry in `scope` matching `predicate`.
    ///
    /// Entries are cloned out so no shard lock is held while the caller
    /// goes on to mutate the map.
    fn scan(
        &self,
        scope: &str,
        predicate: impl Fn(&ReservedValue) -> bool,
    ) -> Vec<ReservedValue> {
        self.entries
            .iter()
            .filter(|entry| entry.key().0 == scope && predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Reserve `value` in `scope` for `owner`.
    ///
    /// Succeeds when the value is free, when `owner` already holds it (an
    /// unconfirmed lease is extended), or when another owner's lease has
    /// expired (ownership transfers). A new or transferred reservation is
    /// confirmed with the value itself as its confirmation token.
    ///
    /// Returns `false` when someone else holds a live or confirmed
    /// reservation, or when another entry in the scope already uses the
    /// value as its confirmation token.
    pub fn reserve(&self, value: &str, scope: &str, owner: &str, lease: Option<Duration>) -> bool {
        loop {
            let Some(current) = self.snapshot(scope, value) else {
                if self.is_token_taken(scope, value, value) {
                    tracing::debug!(scope, value, owner, "value is already a confirmation token");
                    return false;
                }
                let reserved = ReservedValue {
                    value: value.to_string(),
                    scope: scope.to_string(),
                    owner_token: owner.to_string(),
                    confirmation_token: value.to_string(),
                    expiration: Some(self.expiry(lease)),
                };
                if !self.insert_if_absent(key(scope, value), reserved.clone()) {
                    tracing::trace!(scope, value, "lost reservation race, retrying");
                    continue;
                }
                if self.is_token_taken(scope, value, value) {
                    self.compare_and_swap(key(scope, value), &reserved, None);
                    tracing::debug!(scope, value, "confirmation token collision, rolled back");
                    return false;
                }
                tracing::debug!(scope, value, owner, "value reserved");
                return true;
            };

            let same_owner = current.owner_token == owner;
            if same_owner && current.is_confirmed() {
                return true;
            }
            if !same_owner && !current.is_expired(self.clock.now()) {
                tracing::debug!(
                    scope,
                    value,
                    owner,
                    holder = %current.owner_token,
                    "value already reserved"
                );
                return false;
            }
            let takeover = !same_owner;
            if takeover && self.is_token_taken(scope, value, value) {
                tracing::debug!(scope, value, owner, "value is already a confirmation token");
                return false;
            }

            let mut next = current.clone();
            next.expiration = Some(self.expiry(lease));
            if takeover {
                next.owner_token = owner.to_string();
                next.confirmation_token = value.to_string();
            }
            if !self.compare_and_swap(key(scope, value), &current, Some(next.clone())) {
                tracing::trace!(scope, value, "reservation changed underneath, retrying");
                continue;
            }
            if takeover && self.is_token_taken(scope, value, value) {
                self.compare_and_swap(key(scope, value), &next, Some(current));
                tracing::debug!(scope, value, "confirmation token collision, takeover rolled back");
                return false;
            }
            tracing::debug!(scope, value, owner, takeover, "reservation renewed");
            return true;
        }
    }

    /// Make the reservation whose confirmation token is `confirmation_token`
    /// permanent, if `owner` holds it.
    pub fn confirm(&self, confirmation_token: &str, scope: &str, owner: &str) -> bool {
        loop {
            let Some(current) = self
                .scan(scope, |entry| entry.confirmation_token == confirmation_token)
                .into_iter()
                .next()
            else {
                return false;
            };
            if current.owner_token != owner {
                return false;
            }
            if current.is_confirmed() {
                return true;
            }

            let mut confirmed = current.clone();
            confirmed.expiration = None;
            if self.compare_and_swap(key(scope, &current.value), &current, Some(confirmed)) {
                tracing::debug!(scope, value = %current.value, owner, "reservation confirmed");
                return true;
            }
        }
    }

    /// Release `value` in `scope` if `owner` holds it.
    pub fn cancel(&self, value: &str, scope: &str, owner: &str) -> bool {
        loop {
            let Some(current) = self.snapshot(scope, value) else {
                return false;
            };
            if current.owner_token != owner {
                return false;
            }
            if self.compare_and_swap(key(scope, value), &current, None) {
                tracing::debug!(scope, value, owner, "reservation canceled");
                return true;
            }
        }
    }

    /// Offer `values` for [`reserve_any`](Self::reserve_any) by recording
    /// them with an already expired lease. Values already present are left
    /// alone. Returns how many were added.
    pub fn make_available<I, V>(&self, scope: &str, values: I) -> usize
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let now = self.clock.now();
        let added = values
            .into_iter()
            .map(Into::into)
            .filter(|value: &String| {
                self.insert_if_absent(key(scope, value), ReservedValue {
                    value: value.clone(),
                    scope: scope.to_string(),
                    owner_token: String::new(),
                    confirmation_token: value.clone(),
                    expiration: Some(now),
                })
            })
            .count();
        tracing::debug!(scope, added, "values made available");
        added
    }

    /// Reserve some value in `scope` without naming it.
    ///
    /// An unconfirmed reservation `owner` already holds under
    /// `confirmation_token` is renewed and returned. Otherwise the first
    /// expired entry that can be claimed is taken, tagged with
    /// `confirmation_token` (or its own value when none is given). A claim
    /// whose confirmation token turns out to collide with another entry in
    /// the scope is rolled back.
    ///
    /// Returns `None` when nothing is free.
    pub fn reserve_any(
        &self,
        scope: &str,
        owner: &str,
        lease: Option<Duration>,
        confirmation_token: Option<&str>,
    ) -> Option<String> {
        if let Some(token) = confirmation_token
            && let Some(value) = self.renew_own(scope, owner, lease, token)
        {
            return Some(value);
        }

        let now = self.clock.now();
        for candidate in self.scan(scope, |entry| entry.is_expired(now)) {
            let token = confirmation_token.unwrap_or(&candidate.value).to_string();
            if self.is_token_taken(scope, &token, &candidate.value) {
                continue;
            }

            let claimed = ReservedValue {
                owner_token: owner.to_string(),
                confirmation_token: token.clone(),
                expiration: Some(self.expiry(lease)),
                ..candidate.clone()
            };
            let slot = key(scope, &candidate.value);
            if !self.compare_and_swap(slot.clone(), &candidate, Some(claimed.clone())) {
                continue;
            }

            if self.is_token_taken(scope, &token, &candidate.value) {
                // Someone claimed the same token concurrently.
                self.compare_and_swap(slot, &claimed, Some(candidate));
                tracing::debug!(scope, %token, "confirmation token collision, claim rolled back");
                continue;
            }

            tracing::debug!(scope, value = %claimed.value, owner, "value claimed from pool");
            return Some(claimed.value);
        }
        None
    }

    fn renew_own(
        &self,
        scope: &str,
        owner: &str,
        lease: Option<Duration>,
        token: &str,
    ) -> Option<String> {
        loop {
            let current = self
                .scan(scope, |entry| {
                    entry.owner_token == owner
                        && entry.confirmation_token == token
                        && !entry.is_confirmed()
                })
                .into_iter()
                .next()?;
            let mut renewed = current.clone();
            renewed.expiration = Some(self.expiry(lease));
            if self.compare_and_swap(key(scope, &current.value), &current, Some(renewed)) {
                tracing::trace!(scope, value = %current.value, owner, "own reservation reused");
                return Some(current.value);
            }
        }
    }

    fn is_token_taken(&self, scope: &str, token: &str, except_value: &str) -> bool {
        !self
            .scan(scope, |entry| {
                entry.confirmation_token == token && entry.value != except_value
            })
            .is_empty()
    }

    pub fn get_reserved_value(&self, value: &str, scope: &str) -> Option<ReservedValue> {
        self.snapshot(scope, value)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use super::*;
    use crate::clock::VirtualClock;

    fn service() -> (ReservationService, VirtualClock) {
        let clock = VirtualClock::starting_now();
        let service = ReservationService::new(Arc::new(clock.clone()))
            .with_config(ReservationConfig::default().with_default_lease(Duration::from_secs(30)));
        (service, clock)
    }

    #[tokio::test]
    async fn second_owner_is_refused_until_the_lease_expires() {
        let (service, clock) = service();
        assert!(service.reserve("alice", "usernames", "owner-1", None));
        assert!(!service.reserve("alice", "usernames", "owner-2", None));

        clock.advance_by(Duration::from_secs(30)).await.unwrap();

        assert!(service.reserve("alice", "usernames", "owner-2", None));
        let reserved = service.get_reserved_value("alice", "usernames").unwrap();
        assert_eq!(reserved.owner_token, "owner-2");
        assert!(!service.reserve("alice", "usernames", "owner-1", None));
    }

    #[tokio::test]
    async fn same_owner_extends_the_lease() {
        let (service, clock) = service();
        assert!(service.reserve("alice", "usernames", "owner-1", None));
        let first = service.get_reserved_value("alice", "usernames").unwrap();

        clock.advance_by(Duration::from_secs(10)).await.unwrap();
        assert!(service.reserve("alice", "usernames", "owner-1", Some(Duration::from_secs(60))));

        let extended = service.get_reserved_value("alice", "usernames").unwrap();
        assert!(extended.expiration > first.expiration);
    }

    #[tokio::test]
    async fn confirmed_reservation_never_expires() {
        let (service, clock) = service();
        service.reserve("alice", "usernames", "owner-1", None);
        assert!(!service.confirm("alice", "usernames", "owner-2"));
        assert!(service.confirm("alice", "usernames", "owner-1"));

        clock.advance_by(Duration::from_secs(3600)).await.unwrap();

        assert!(!service.reserve("alice", "usernames", "owner-2", None));
        assert!(
            service
                .get_reserved_value("alice", "usernames")
                .unwrap()
                .is_confirmed()
        );
    }

    #[test]
    fn cancel_requires_the_owner() {
        let (service, _) = service();
        service.reserve("alice", "usernames", "owner-1", None);

        assert!(!service.cancel("alice", "usernames", "owner-2"));
        assert!(service.cancel("alice", "usernames", "owner-1"));
        assert!(service.get_reserved_value("alice", "usernames").is_none());
        assert!(!service.cancel("alice", "usernames", "owner-1"));
    }

    #[test]
    fn scopes_are_independent() {
        let (service, _) = service();
        assert!(service.reserve("alice", "usernames", "owner-1", None));
        assert!(service.reserve("alice", "nicknames", "owner-2", None));
    }

    #[test]
    fn reserve_any_claims_from_the_pool_and_reuses_own_claim() {
        let (service, _) = service();
        assert_eq!(service.make_available("tickets", ["t-1", "t-2"]), 2);

        let first = service
            .reserve_any("tickets", "owner-1", None, Some("order-1"))
            .unwrap();
        let again = service
            .reserve_any("tickets", "owner-1", None, Some("order-1"))
            .unwrap();
        assert_eq!(first, again);

        let second = service
            .reserve_any("tickets", "owner-2", None, Some("order-2"))
            .unwrap();
        assert_ne!(first, second);
        assert!(service.reserve_any("tickets", "owner-3", None, None).is_none());

        assert!(service.confirm("order-1", "tickets", "owner-1"));
        assert!(service.get_reserved_value(&first, "tickets").unwrap().is_confirmed());
    }

    #[test]
    fn reserve_any_refuses_a_confirmation_token_in_use() {
        let (service, _) = service();
        service.make_available("tickets", ["t-1", "t-2"]);
        assert!(service.reserve_any("tickets", "owner-1", None, Some("order-1")).is_some());
        assert!(service.reserve_any("tickets", "owner-2", None, Some("order-1")).is_none());
    }

    #[test]
    fn reserve_refuses_a_value_already_used_as_a_confirmation_token() {
        let (service, _) = service();
        service.make_available("tickets", ["t-1", "t-2", "t-3"]);
        let seat = service.reserve_any("tickets", "bob", None, Some("alice")).unwrap();

        assert!(!service.reserve("alice", "tickets", "carol", None));
        assert!(service.get_reserved_value("alice", "tickets").is_none());
        assert!(!service.confirm("alice", "tickets", "carol"));
        assert!(service.confirm("alice", "tickets", "bob"));
        assert!(service.get_reserved_value(&seat, "tickets").unwrap().is_confirmed());
    }

    #[test]
    fn confirmation_tokens_stay_unique_when_reserve_races_reserve_any() {
        let (service, _) = service();
        for round in 0..50 {
            let scope = format!("tickets-{round}");
            service.make_available(&scope, ["t-1", "t-2", "t-3"]);
            let (reserved, claimed) = thread::scope(|s| {
                let plain = s.spawn(|| service.reserve("alice", &scope, "carol", None));
                let pooled = s.spawn(|| service.reserve_any(&scope, "bob", None, Some("alice")));
                (plain.join().unwrap(), pooled.join().unwrap())
            });

            let holders = service.scan(&scope, |entry| entry.confirmation_token == "alice");
            assert!(holders.len() <= 1, "{scope}: {holders:?}");
            assert!(!(reserved && claimed.is_some()), "{scope}: both claims kept");
            if reserved {
                assert!(service.confirm("alice", &scope, "carol"));
            }
            if claimed.is_some() {
                assert!(service.confirm("alice", &scope, "bob"));
            }
        }
    }

    #[test]
    fn racing_reservations_have_one_winner() {
        let (service, _) = service();
        let winners = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let service = &service;
                    let owner = format!("owner-{i}");
                    s.spawn(move || service.reserve("alice", "usernames", &owner, None))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn racing_reserve_any_hands_out_distinct_values() {
        let (service, _) = service();
        service.make_available("tickets", (0..4).map(|i| format!("t-{i}")));

        let claimed: Vec<Option<String>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let service = &service;
                    s.spawn(move || {
                        service.reserve_any("tickets", &format!("owner-{i}"), None, None)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let values: Vec<String> = claimed.into_iter().flatten().collect();
        let distinct: HashSet<&String> = values.iter().collect();
        assert_eq!(values.len(), 4);
        assert_eq!(distinct.len(), 4);
    }
}
