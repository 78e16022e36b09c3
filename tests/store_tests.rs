//! SQLite store semantics: lookup ordering, predicate updates, transaction
//! rollback, and concurrent submits over separate handles on one database.

use std::path::PathBuf;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use coalesce::consolidate::{Consolidator, Submission};
use coalesce::store::{ContactStore, NewContact, Precedence, SqliteStore, StoreError};

/// Per-invocation temp database path so parallel tests don't collide.
fn temp_db_path() -> PathBuf {
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("coalesce-test-{pid}-{ts}.db"))
}

#[test]
fn find_by_email_prefers_earliest_created_then_lowest_id() {
    let store = SqliteStore::open_in_memory().unwrap();
    let first = store
        .insert(NewContact::primary(Some("dup@x.com".into()), Some("111".into())))
        .unwrap();
    store
        .insert(NewContact::secondary(
            Some("dup@x.com".into()),
            Some("222".into()),
            first.id,
        ))
        .unwrap();

    let found = store.find_by_email("dup@x.com").unwrap().unwrap();
    assert_eq!(found.id, first.id);
    let by_phone = store.find_by_phone("222").unwrap().unwrap();
    assert_ne!(by_phone.id, first.id);
}

#[test]
fn relink_group_only_touches_the_target_group() {
    let store = SqliteStore::open_in_memory().unwrap();
    let a = store
        .insert(NewContact::primary(Some("a@x.com".into()), None))
        .unwrap();
    let a_sec = store
        .insert(NewContact::secondary(None, Some("111".into()), a.id))
        .unwrap();
    let b = store
        .insert(NewContact::primary(Some("b@x.com".into()), None))
        .unwrap();
    let bystander = store
        .insert(NewContact::primary(Some("c@x.com".into()), None))
        .unwrap();

    let affected = store.relink_group(a.id, b.id).unwrap();
    assert_eq!(affected, 2);

    let untouched = store.find_by_id(bystander.id).unwrap();
    assert_eq!(untouched.precedence, Precedence::Primary);
    assert_eq!(untouched.linked_id, None);
    assert_eq!(store.secondaries_of(b.id).unwrap(), vec![a.id, a_sec.id]);
}

#[test]
fn run_atomic_rolls_back_partial_merges() {
    let store = SqliteStore::open_in_memory().unwrap();
    let a = store
        .insert(NewContact::primary(Some("a@x.com".into()), None))
        .unwrap();
    let b = store
        .insert(NewContact::primary(Some("b@x.com".into()), None))
        .unwrap();

    let result: Result<(), StoreError> = store.run_atomic(|s| {
        s.relink_group(b.id, a.id)?;
        Err(StoreError::NotFound("simulated mid-merge failure".into()))
    });
    assert!(result.is_err());

    // The demotion did not stick.
    let b_after = store.find_by_id(b.id).unwrap();
    assert_eq!(b_after.precedence, Precedence::Primary);
    assert_eq!(b_after.linked_id, None);
}

#[test]
fn file_backed_store_persists_across_handles() {
    let path = temp_db_path();
    {
        let store = SqliteStore::open(&path).unwrap();
        store
            .insert(NewContact::primary(Some("a@x.com".into()), Some("111".into())))
            .unwrap();
    }
    let reopened = SqliteStore::open(&path).unwrap();
    let found = reopened.find_by_email("a@x.com").unwrap().unwrap();
    assert_eq!(found.phone_number.as_deref(), Some("111"));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn concurrent_submits_over_separate_handles_stay_consistent() {
    let path = temp_db_path();
    // Seed one identity so every worker's submissions overlap it.
    {
        let store = SqliteStore::open(&path).unwrap();
        Consolidator::new(store)
            .submit(&Submission::new(
                Some("a@x.com".into()),
                Some("111".into()),
            ))
            .unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..4 {
        let path = path.clone();
        handles.push(thread::spawn(move || {
            let engine = Consolidator::new(SqliteStore::open(&path).unwrap());
            for i in 0..5 {
                // Each submission shares the seeded email with a worker-unique
                // phone, forcing every transaction into the same group.
                engine
                    .submit(&Submission::new(
                        Some("a@x.com".into()),
                        Some(format!("555-{worker}-{i}")),
                    ))
                    .expect("concurrent submit");
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    // One group: a single primary, everything else linked directly to it.
    let store = SqliteStore::open(&path).unwrap();
    let primary = store.find_by_email("a@x.com").unwrap().unwrap();
    assert_eq!(primary.precedence, Precedence::Primary);
    let secondaries = store.secondaries_of(primary.id).unwrap();
    assert_eq!(secondaries.len(), 4 * 5);
    for id in secondaries {
        let member = store.find_by_id(id).unwrap();
        assert_eq!(member.precedence, Precedence::Secondary);
        assert_eq!(member.linked_id, Some(primary.id));
    }
    let _ = std::fs::remove_file(&path);
}

#[test]
fn duplicate_pair_raced_by_two_handles_creates_one_record() {
    let path = temp_db_path();
    let submission = Submission::new(Some("race@x.com".into()), Some("999".into()));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let path = path.clone();
        let submission = submission.clone();
        handles.push(thread::spawn(move || {
            let engine = Consolidator::new(SqliteStore::open(&path).unwrap());
            engine.submit(&submission).expect("racing submit")
        }));
    }
    let views: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Both callers resolve to the same primary and no duplicate was made.
    assert_eq!(views[0].primary_contact_id, views[1].primary_contact_id);
    let store = SqliteStore::open(&path).unwrap();
    let primary = store.find_by_email("race@x.com").unwrap().unwrap();
    assert!(store.secondaries_of(primary.id).unwrap().is_empty());
    let _ = std::fs::remove_file(&path);
}
