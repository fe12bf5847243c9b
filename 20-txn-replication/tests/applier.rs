//! Applier behaviour driven entry by entry, without Raft.
//!
//! Entries go through [`Applier::apply`] as encoded bytes, the same path a
//! committed log entry takes. A [`ManualClock`] controls lock expiry.

use std::sync::Arc;

use anyhow::Result;
use txn_replication::applier::Applier;
use txn_replication::command::{Mutation, Request};
use txn_replication::error::{ApplyError, ErrorKind};
use txn_replication::lock_store::{ManualClock, MemoryLockStore};
use txn_replication::store::{MemoryStore, Store};

type TestApplier = Applier<MemoryStore, MemoryLockStore>;

fn applier_at(start: u64) -> (Arc<ManualClock>, TestApplier) {
    let clock = Arc::new(ManualClock::new(start));
    let locks = Arc::new(MemoryLockStore::with_clock(clock.clone()));
    let applier = Applier::new(Arc::new(MemoryStore::new()), locks).with_clock(clock.clone());
    (clock, applier)
}

fn apply(applier: &mut TestApplier, request: &Request) -> Result<(), ApplyError> {
    applier.apply(&request.encode())
}

fn value(applier: &TestApplier, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(applier.store().get(key.as_bytes())?)
}

fn mixed_log() -> Vec<Request> {
    vec![
        Request::put("a", "1"),
        Request::raw(vec![Mutation::put("b", "2"), Mutation::put("c", "3")]),
        Request::prepare(vec![Mutation::put("a", "10"), Mutation::delete("b")], 30),
        Request::prepare(vec![Mutation::put("b", "x")], 30),
        Request::commit(vec![Mutation::put("a", "10"), Mutation::delete("b")]),
        Request::commit(vec![Mutation::put("c", "never")]),
        Request::delete("c"),
        Request::prepare(vec![Mutation::put("d", "4")], 5),
    ]
}

#[test]
fn same_log_yields_same_state() -> Result<()> {
    let (_, mut first) = applier_at(1_000);
    let (_, mut second) = applier_at(1_000);

    for request in mixed_log() {
        let left = apply(&mut first, &request).map_err(|e| e.kind());
        let right = apply(&mut second, &request).map_err(|e| e.kind());
        assert_eq!(left, right, "outcome diverged for {}", request.label());
    }

    assert_eq!(first.store().entries(), second.store().entries());
    assert_eq!(first.locks().locked_keys(), second.locks().locked_keys());
    assert_eq!(first.snapshot()?.as_bytes(), second.snapshot()?.as_bytes());
    Ok(())
}

#[test]
fn repeated_put_is_idempotent() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    apply(&mut applier, &Request::put("k", "v"))?;
    let once = applier.store().entries();

    apply(&mut applier, &Request::put("k", "v"))?;
    assert_eq!(applier.store().entries(), once);
    assert_eq!(value(&applier, "k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn delete_removes_key() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    apply(&mut applier, &Request::put("k", "v"))?;
    apply(&mut applier, &Request::delete("k"))?;
    assert_eq!(value(&applier, "k")?, None);

    // Deleting a missing key is not an error.
    apply(&mut applier, &Request::delete("k"))?;
    Ok(())
}

#[test]
fn prepare_then_commit_applies_atomically() -> Result<()> {
    let (_, mut applier) = applier_at(100);
    apply(&mut applier, &Request::put("k2", "old"))?;

    let mutations = vec![Mutation::put("k1", "v1"), Mutation::delete("k2")];
    apply(&mut applier, &Request::prepare(mutations.clone(), 30))?;
    assert_eq!(
        applier.locks().locked_keys(),
        vec![b"k1".to_vec(), b"k2".to_vec()]
    );
    // Locks alone do not touch the store.
    assert_eq!(value(&applier, "k1")?, None);
    assert_eq!(value(&applier, "k2")?, Some(b"old".to_vec()));

    apply(&mut applier, &Request::commit(mutations))?;
    assert_eq!(value(&applier, "k1")?, Some(b"v1".to_vec()));
    assert_eq!(value(&applier, "k2")?, None);
    assert!(applier.locks().locked_keys().is_empty());
    Ok(())
}

#[test]
fn overlapping_prepare_is_rejected_without_side_effects() -> Result<()> {
    let (_, mut applier) = applier_at(100);
    apply(&mut applier, &Request::prepare(vec![Mutation::put("k", "1")], 30))?;

    let err = apply(
        &mut applier,
        &Request::prepare(vec![Mutation::put("fresh", "2"), Mutation::put("k", "2")], 30),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyAlreadyLocked);
    assert_eq!(err.to_string(), "key already locked: k");

    // "fresh" was staged before the conflict and must not survive it.
    assert_eq!(applier.locks().locked_keys(), vec![b"k".to_vec()]);
    assert!(applier.store().is_empty());
    Ok(())
}

#[test]
fn commit_without_prepare_is_rejected() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    apply(&mut applier, &Request::put("k", "original"))?;

    let err = apply(&mut applier, &Request::commit(vec![Mutation::put("k", "new")])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotLocked);
    assert_eq!(value(&applier, "k")?, Some(b"original".to_vec()));
    Ok(())
}

#[test]
fn commit_with_one_unlocked_key_changes_nothing() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    apply(&mut applier, &Request::prepare(vec![Mutation::put("a", "1")], 30))?;

    let err = apply(
        &mut applier,
        &Request::commit(vec![Mutation::put("a", "1"), Mutation::put("b", "2")]),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotLocked);
    assert!(applier.store().is_empty());
    // The failed commit releases nothing; the coordinator is expected to ABORT.
    assert_eq!(applier.locks().locked_keys(), vec![b"a".to_vec()]);
    Ok(())
}

#[test]
fn commit_after_lock_expiry_is_rejected() -> Result<()> {
    let (clock, mut applier) = applier_at(1_000);
    let mutations = vec![Mutation::put("k", "v")];
    apply(&mut applier, &Request::prepare(mutations.clone(), 10))?;

    clock.set(1_010);
    assert_eq!(applier.locks().locked_keys(), vec![b"k".to_vec()]);

    clock.advance(1);
    let err = apply(&mut applier, &Request::commit(mutations)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotLocked);
    assert_eq!(value(&applier, "k")?, None);
    Ok(())
}

#[test]
fn expired_lock_can_be_prepared_again() -> Result<()> {
    let (clock, mut applier) = applier_at(0);
    apply(&mut applier, &Request::prepare(vec![Mutation::put("k", "1")], 5))?;
    clock.advance(6);
    apply(&mut applier, &Request::prepare(vec![Mutation::put("k", "2")], 5))?;
    apply(&mut applier, &Request::commit(vec![Mutation::put("k", "2")]))?;
    assert_eq!(value(&applier, "k")?, Some(b"2".to_vec()));
    Ok(())
}

#[test]
fn abort_releases_without_mutating() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    apply(&mut applier, &Request::put("k", "kept"))?;
    apply(&mut applier, &Request::prepare(vec![Mutation::delete("k")], 30))?;

    apply(&mut applier, &Request::abort(["k"]))?;
    assert_eq!(value(&applier, "k")?, Some(b"kept".to_vec()));
    assert!(applier.locks().locked_keys().is_empty());

    // Aborting keys that hold no lock is fine.
    apply(&mut applier, &Request::abort(["k", "never-locked"]))?;
    Ok(())
}

#[test]
fn abort_releases_a_lock_prepared_by_someone_else() -> Result<()> {
    let (clock, mut applier) = applier_at(0);
    apply(&mut applier, &Request::prepare(vec![Mutation::put("k", "first")], 5))?;

    // The first lock expires and a second client takes the key.
    clock.advance(6);
    let second = vec![Mutation::put("k", "second")];
    apply(&mut applier, &Request::prepare(second.clone(), 30))?;

    // The first client's cleanup ABORT cannot tell the locks apart.
    apply(&mut applier, &Request::abort(["k"]))?;
    assert!(applier.locks().locked_keys().is_empty());

    let err = apply(&mut applier, &Request::commit(second)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyNotLocked);
    assert_eq!(value(&applier, "k")?, None);
    Ok(())
}

#[test]
fn snapshot_restores_exact_state() -> Result<()> {
    let (_, mut applier) = applier_at(1_000);
    for request in mixed_log() {
        let _ = apply(&mut applier, &request);
    }
    let state = applier.store().entries();
    let snapshot = applier.snapshot()?;

    let (_, mut fresh) = applier_at(1_000);
    apply(&mut fresh, &Request::put("stale", "gone"))?;
    fresh.restore(snapshot.as_bytes())?;

    assert_eq!(fresh.store().entries(), state);
    assert_eq!(value(&fresh, "stale")?, None);
    // Locks are not carried by the snapshot.
    assert!(fresh.locks().locked_keys().is_empty());
    Ok(())
}

#[test]
fn corrupt_snapshot_leaves_store_untouched() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    apply(&mut applier, &Request::put("k", "v"))?;

    let err = applier.restore(&b"not a snapshot"[..]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);
    assert_eq!(value(&applier, "k")?, Some(b"v".to_vec()));
    Ok(())
}

#[test]
fn last_applied_write_wins() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    for n in 0..10 {
        apply(&mut applier, &Request::put("k", format!("v{n}")))?;
    }
    assert_eq!(value(&applier, "k")?, Some(b"v9".to_vec()));
    Ok(())
}

#[test]
fn raw_batch_keeps_mutations_before_a_failure() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    let mut bad = Mutation::put("c", "3");
    bad.op = 42;
    let request = Request::raw(vec![Mutation::put("a", "1"), bad, Mutation::put("d", "4")]);

    let err = apply(&mut applier, &request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownRequestType);
    assert_eq!(value(&applier, "a")?, Some(b"1".to_vec()));
    assert_eq!(value(&applier, "c")?, None);
    assert_eq!(value(&applier, "d")?, None);
    Ok(())
}

#[test]
fn commit_with_unknown_op_rolls_back() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    let mut bad = Mutation::put("b", "2");
    bad.op = 9;
    let mutations = vec![Mutation::put("a", "1"), bad];
    apply(&mut applier, &Request::prepare(mutations.clone(), 30))?;

    let err = apply(&mut applier, &Request::commit(mutations)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownRequestType);
    assert!(applier.store().is_empty());
    Ok(())
}

#[test]
fn unknown_phase_is_rejected() {
    let (_, mut applier) = applier_at(0);
    let mut request = Request::commit(vec![Mutation::put("k", "v")]);
    request.phase = 17;

    let err = apply(&mut applier, &request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnknownRequestType);
}

#[test]
fn garbage_entry_is_a_decode_error() -> Result<()> {
    let (_, mut applier) = applier_at(0);
    let err = applier.apply(&[0x22, 0x7f, 0x01]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(applier.store().is_empty());
    Ok(())
}
