//! Behavior every [`DedupStore`] backend must exhibit.
//!
//! Backend crates enable the `contract-suite` feature in their dev-dependencies
//! and call [`run_all`] with a factory that yields an empty store. Each check
//! panics with a descriptive message on violation.

#![allow(clippy::missing_panics_doc)]

use std::sync::Barrier;

use time::{Duration, OffsetDateTime};

use crate::fingerprint::{Fingerprint, HttpMethod, META_BODY_HASH};
use crate::store::{DedupStore, PutOutcome, Record, StoredResponse};
use crate::StoreError;

const RACERS: usize = 8;

fn must<T>(result: Result<T, StoreError>, action: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("{action} failed: {err}"),
    }
}

fn created_at() -> OffsetDateTime {
    OffsetDateTime::UNIX_EPOCH + Duration::days(20_491) + Duration::nanoseconds(123_456_789)
}

#[must_use]
pub fn fingerprint(key: &str, body_hash: &str) -> Fingerprint {
    Fingerprint {
        idempotency_key: key.to_string(),
        caller: "user-1".to_string(),
        method: HttpMethod::Patch,
        route: "/members/me".to_string(),
        body_hash: body_hash.to_string(),
    }
}

fn response_record(body: &[u8]) -> Record {
    Record::response(
        &StoredResponse {
            status_code: 200,
            content_type: "application/json".to_string(),
            body: body.to_vec(),
        },
        created_at(),
    )
}

pub fn get_unseen_returns_none<S: DedupStore>(store: &S) {
    let found = must(store.get(&fingerprint("never-seen", META_BODY_HASH)), "get");
    assert_eq!(found, None, "unseen fingerprint must be absent");
}

pub fn put_then_get_round_trips_exactly<S: DedupStore>(store: &S) {
    let meta_fp = fingerprint("round-trip", META_BODY_HASH);
    let meta = Record::meta("a1b2c3", created_at());
    let outcome = must(store.put(&meta_fp, &meta), "put meta");
    assert_eq!(outcome, PutOutcome::Inserted, "first put must insert");
    assert_eq!(must(store.get(&meta_fp), "get meta"), Some(meta));

    let response_fp = fingerprint("round-trip", "a1b2c3");
    let binary = response_record(&[0, 159, 146, 150, 255, b'{', b'}']);
    must(store.put(&response_fp, &binary), "put response");
    let stored = must(store.get(&response_fp), "get response");
    assert_eq!(stored.as_ref(), Some(&binary), "body bytes must round-trip");
    assert_eq!(
        stored.map(|record| record.created_at),
        Some(created_at()),
        "created_at must round-trip at full precision"
    );
}

pub fn distinct_fingerprints_do_not_collide<S: DedupStore>(store: &S) {
    let base = fingerprint("k", "h1");
    let variants = [
        base.clone(),
        Fingerprint {
            body_hash: "h2".to_string(),
            ..base.clone()
        },
        Fingerprint {
            body_hash: META_BODY_HASH.to_string(),
            ..base.clone()
        },
        Fingerprint {
            caller: "user-2".to_string(),
            ..base.clone()
        },
        Fingerprint {
            method: HttpMethod::Put,
            ..base.clone()
        },
        Fingerprint {
            route: "/trips/{tripId}".to_string(),
            ..base.clone()
        },
        Fingerprint {
            idempotency_key: "k2".to_string(),
            ..base
        },
    ];

    for (index, fp) in variants.iter().enumerate() {
        let record = response_record(format!("{{\"variant\":{index}}}").as_bytes());
        let outcome = must(store.put(fp, &record), "put variant");
        assert_eq!(outcome, PutOutcome::Inserted, "variant {index} collided: {fp}");
    }

    for (index, fp) in variants.iter().enumerate() {
        let stored = must(store.get(fp), "get variant");
        let expected = format!("{{\"variant\":{index}}}").into_bytes();
        assert_eq!(
            stored.map(|record| record.body),
            Some(expected),
            "variant {index} returned another fingerprint's record"
        );
    }
}

pub fn second_put_keeps_first_record<S: DedupStore>(store: &S) {
    let fp = fingerprint("write-once", META_BODY_HASH);
    let first = Record::meta("first-hash", created_at());
    let second = Record::meta("second-hash", created_at() + Duration::SECOND);

    must(store.put(&fp, &first), "first put");
    let outcome = must(store.put(&fp, &second), "second put");
    assert_eq!(
        outcome,
        PutOutcome::AlreadyPresent(first.clone()),
        "second put must report the resident record"
    );
    assert_eq!(must(store.get(&fp), "get"), Some(first), "record must be immutable");
}

/// Concurrent claims on one fingerprint: exactly one insert wins and every
/// loser observes the winner's record.
pub fn concurrent_puts_converge<S: DedupStore>(store: &S) {
    let fp = fingerprint("racing", META_BODY_HASH);
    let barrier = Barrier::new(RACERS);

    let outcomes: Vec<(Record, PutOutcome)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..RACERS)
            .map(|index| {
                let fp = &fp;
                let barrier = &barrier;
                scope.spawn(move || {
                    let record = Record::meta(&format!("hash-{index}"), created_at());
                    barrier.wait();
                    let outcome = must(store.put(fp, &record), "racing put");
                    (record, outcome)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(value) => value,
                Err(err) => panic!("racing writer panicked: {err:?}"),
            })
            .collect()
    });

    let winners: Vec<&Record> = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == PutOutcome::Inserted)
        .map(|(record, _)| record)
        .collect();
    assert_eq!(winners.len(), 1, "exactly one racing put must insert");
    let winner = winners[0].clone();

    for (_, outcome) in &outcomes {
        if let PutOutcome::AlreadyPresent(existing) = outcome {
            assert_eq!(existing, &winner, "losers must observe the winning record");
        }
    }
    assert_eq!(must(store.get(&fp), "get"), Some(winner));
}

/// Runs every check, each against a fresh store from `factory`.
pub fn run_all<S, F>(factory: F)
where
    S: DedupStore,
    F: Fn() -> S,
{
    get_unseen_returns_none(&factory());
    put_then_get_round_trips_exactly(&factory());
    distinct_fingerprints_do_not_collide(&factory());
    second_put_keeps_first_record(&factory());
    concurrent_puts_converge(&factory());
}
