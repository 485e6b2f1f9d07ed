//! Borrow and Revoke Exchanges
//!
//! The `s1 -> s2 -> s3` chain with every ring seeded at `s3`. Each test
//! moves rings up or down the chain and checks where they end up on every
//! owner's lists.

#![allow(clippy::unwrap_used)]

use rm_core::{errno, IncomingFlags};
use rm_engine::{IncomingHandle, IncomingOps, IncomingState, RequestOptions};
use rm_testkit::{
    init_tracing, RecordingOps, Rings, RingsType, Server, ThreeServers, ALL_RINGS, ANGMAR, DURIN,
    NARYA, NENYA, SHARED_RING, VILYA,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

async fn chain() -> ThreeServers {
    init_tracing();
    ThreeServers::new(ALL_RINGS).await
}

fn all_but(rings: Rings) -> Rings {
    Rings(ALL_RINGS.0 & !rings.0)
}

async fn borrow_and_cache(server: &Server, want: Rings) {
    let (request, status) = server.get_and_wait(want, IncomingFlags::MAY_BORROW).await;
    assert_eq!(status.state, IncomingState::Success, "{}: {status:?}", server.name);
    request.release().unwrap();
}

/// Hold `want` on `server`, reporting conflicts to the returned ops
async fn borrow_and_hold(
    server: &Server,
    want: Rings,
) -> (IncomingHandle<RingsType>, Arc<RecordingOps>) {
    let ops = RecordingOps::new();
    let request = server
        .owner
        .request(
            want,
            RequestOptions::new(IncomingFlags::MAY_BORROW),
            Some(ops.clone() as Arc<dyn IncomingOps>),
        )
        .unwrap();
    assert_eq!(request.wait().await.state, IncomingState::Success);
    assert_eq!(server.snapshot().held_join(), want);
    (request, ops)
}

#[tokio::test]
async fn test_simple_borrow() {
    let chain = chain().await;

    borrow_and_cache(&chain.s2, NENYA).await;

    let s3 = chain.s3.snapshot();
    assert_eq!(s3.sublet_join(), NENYA);
    assert_eq!(s3.cached_join(), all_but(NENYA));
    let s2 = chain.s2.snapshot();
    assert_eq!(s2.borrowed_join(), NENYA);
    assert_eq!(s2.cached_join(), NENYA);
    chain.check_invariants().unwrap();
}

/// Test: one request is served partly from the middle and partly from the top
#[tokio::test]
async fn test_two_borrows_single_request() {
    let chain = chain().await;

    borrow_and_cache(&chain.s2, NENYA).await;
    borrow_and_cache(&chain.s1, NENYA | DURIN).await;

    let s2 = chain.s2.snapshot();
    assert_eq!(s2.sublet_join(), NENYA | DURIN);
    assert_eq!(s2.borrowed_join(), NENYA | DURIN);
    assert!(s2.cached.is_empty());
    let s1 = chain.s1.snapshot();
    assert_eq!(s1.borrowed_join(), NENYA | DURIN);
    assert_eq!(s1.cached_join(), NENYA | DURIN);
    assert_eq!(chain.s3.snapshot().cached_join(), all_but(NENYA | DURIN));
    chain.check_invariants().unwrap();
}

/// Test: one request both revokes from below and borrows from above
#[tokio::test]
async fn test_borrow_and_revoke_single_request() {
    let chain = chain().await;
    borrow_and_cache(&chain.s1, NENYA).await;

    let (request, status) = chain
        .s2
        .get_and_wait(NENYA | VILYA, IncomingFlags::MAY_REVOKE | IncomingFlags::MAY_BORROW)
        .await;
    assert_eq!(status.state, IncomingState::Success);
    request.release().unwrap();

    assert_eq!(chain.s3.snapshot().sublet_join(), NENYA | VILYA);
    let s2 = chain.s2.snapshot();
    assert_eq!(s2.borrowed_join(), NENYA | VILYA);
    assert_eq!(s2.cached_join(), NENYA | VILYA);
    assert!(s2.sublet.is_empty());
    let s1 = chain.s1.snapshot();
    assert!(s1.borrowed.is_empty());
    assert!(s1.cached.is_empty());
    chain.check_invariants().unwrap();
}

/// Test: a revoke travels through the middle owner down to the holder
#[tokio::test]
async fn test_revoke_with_hop() {
    let chain = chain().await;
    borrow_and_cache(&chain.s1, ANGMAR).await;

    let (request, status) = chain
        .s3
        .get_and_wait(ANGMAR, IncomingFlags::MAY_REVOKE)
        .await;
    assert_eq!(status.state, IncomingState::Success);
    request.release().unwrap();

    let s1 = chain.s1.snapshot();
    assert!(s1.borrowed.is_empty());
    assert!(s1.cached.is_empty());
    let s2 = chain.s2.snapshot();
    assert!(s2.borrowed.is_empty());
    assert!(s2.sublet.is_empty());
    let s3 = chain.s3.snapshot();
    assert!(s3.sublet.is_empty());
    assert_eq!(s3.cached_join(), ALL_RINGS);
    chain.check_invariants().unwrap();
}

/// Test: a sublet right cannot be taken back without MAY_REVOKE
#[tokio::test]
async fn test_sublet_right_needs_revoke_flag() {
    let chain = chain().await;
    borrow_and_cache(&chain.s2, VILYA).await;

    let (_, status) = chain.s3.get_and_wait(VILYA, IncomingFlags::LOCAL_WAIT).await;
    assert_eq!(status.state, IncomingState::Failure);
    assert_eq!(status.errno(), -errno::EREMOTE);
    assert_eq!(chain.s2.snapshot().cached_join(), VILYA);
}

#[tokio::test]
async fn test_borrow_non_conflicting() {
    let chain = chain().await;

    borrow_and_cache(&chain.s2, SHARED_RING).await;

    let s2 = chain.s2.snapshot();
    assert_eq!(s2.cached_join(), SHARED_RING);
    assert_eq!(s2.borrowed_join(), SHARED_RING);
    assert_eq!(chain.s3.snapshot().sublet_join(), SHARED_RING);
}

/// Test: a waiting revoke tells the holder and completes once released
#[tokio::test]
async fn test_revoke_conflicting_wait() {
    let chain = chain().await;
    let (held, ops) = borrow_and_hold(&chain.s2, NENYA).await;

    let revoke = chain
        .s3
        .get(NENYA, IncomingFlags::MAY_REVOKE | IncomingFlags::LOCAL_WAIT);
    let conflicted = tokio::time::timeout(WAIT, ops.wait_conflict()).await.unwrap();
    assert_eq!(conflicted, held.id());
    assert_eq!(revoke.state(), IncomingState::Wait);

    held.release().unwrap();
    let status = tokio::time::timeout(WAIT, revoke.wait()).await.unwrap();
    assert_eq!(status.state, IncomingState::Success);
    revoke.release().unwrap();

    let s2 = chain.s2.snapshot();
    assert!(s2.held.is_empty());
    assert!(s2.borrowed.is_empty());
    assert_eq!(chain.s3.snapshot().cached_join(), ALL_RINGS);
    assert_eq!(ops.completions().len(), 1);
    chain.check_invariants().unwrap();
}

/// Test: LOCAL_TRY turns a conflict at the debtor into EBUSY
#[tokio::test]
async fn test_revoke_conflicting_try() {
    let chain = chain().await;
    let (held, ops) = borrow_and_hold(&chain.s2, NENYA).await;

    let (_, status) = chain
        .s3
        .get_and_wait(NENYA, IncomingFlags::MAY_REVOKE | IncomingFlags::LOCAL_TRY)
        .await;
    assert_eq!(status.state, IncomingState::Failure);
    assert_eq!(status.errno(), -errno::EBUSY);

    assert_eq!(chain.s2.snapshot().held_join(), NENYA);
    assert_eq!(chain.s3.snapshot().cached_join(), all_but(NENYA));
    assert!(ops.conflicts().is_empty());
    held.release().unwrap();
}

/// Test: a shared ring in use still has to be released before it is revoked
#[tokio::test]
async fn test_revoke_no_conflict_wait() {
    let chain = chain().await;
    let (held, ops) = borrow_and_hold(&chain.s2, SHARED_RING).await;

    let revoke = chain.s3.get(SHARED_RING, IncomingFlags::MAY_REVOKE);
    tokio::time::timeout(WAIT, ops.wait_conflict()).await.unwrap();
    held.release().unwrap();
    let status = tokio::time::timeout(WAIT, revoke.wait()).await.unwrap();
    assert_eq!(status.state, IncomingState::Success);

    let s2 = chain.s2.snapshot();
    assert!(s2.cached.is_empty());
    assert!(s2.borrowed.is_empty());
    let s3 = chain.s3.snapshot();
    assert_eq!(s3.held_join(), SHARED_RING);
    assert_eq!(s3.cached_join(), all_but(SHARED_RING));
    revoke.release().unwrap();
}

#[tokio::test]
async fn test_revoke_no_conflict_try() {
    let chain = chain().await;
    let (held, _ops) = borrow_and_hold(&chain.s2, SHARED_RING).await;

    let (_, status) = chain
        .s3
        .get_and_wait(SHARED_RING, IncomingFlags::MAY_REVOKE | IncomingFlags::LOCAL_TRY)
        .await;
    assert_eq!(status.errno(), -errno::EBUSY);

    assert_eq!(chain.s2.snapshot().held_join(), SHARED_RING);
    assert_eq!(chain.s3.snapshot().cached_join(), all_but(SHARED_RING));
    held.release().unwrap();
}

/// Test: a borrow from below waits for the creditor's holder to release
#[tokio::test]
async fn test_borrow_held_conflicting() {
    let chain = chain().await;
    let (held, ops) = borrow_and_hold(&chain.s2, NENYA).await;

    let borrow = chain.s1.get(NENYA, IncomingFlags::MAY_BORROW);
    tokio::time::timeout(WAIT, ops.wait_conflict()).await.unwrap();
    held.release().unwrap();
    let status = tokio::time::timeout(WAIT, borrow.wait()).await.unwrap();
    assert_eq!(status.state, IncomingState::Success);

    let s2 = chain.s2.snapshot();
    assert!(s2.held.is_empty());
    assert_eq!(s2.borrowed_join(), NENYA);
    let s1 = chain.s1.snapshot();
    assert_eq!(s1.held_join(), NENYA);
    assert_eq!(s1.borrowed_join(), NENYA);
    assert_eq!(chain.s3.snapshot().cached_join(), all_but(NENYA));

    borrow.release().unwrap();
    chain.check_invariants().unwrap();
}

/// Test: a right held in the middle is not lent while its neighbour is
#[tokio::test]
async fn test_borrow_around_held_right() {
    let chain = chain().await;
    let (held, ops) = borrow_and_hold(&chain.s2, NENYA).await;

    borrow_and_cache(&chain.s1, NARYA).await;

    let s2 = chain.s2.snapshot();
    assert_eq!(s2.held_join(), NENYA);
    assert_eq!(s2.borrowed_join(), NENYA | NARYA);
    let s1 = chain.s1.snapshot();
    assert_eq!(s1.borrowed_join(), NARYA);
    assert_eq!(s1.cached_join(), NARYA);
    assert_eq!(chain.s3.snapshot().cached_join(), all_but(NENYA | NARYA));
    assert!(ops.conflicts().is_empty());

    held.release().unwrap();
    chain.check_invariants().unwrap();
}
