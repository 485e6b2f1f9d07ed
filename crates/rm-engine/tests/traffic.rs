//! Random Traffic Over the Creditor Chain
//!
//! Requests from random owners for random rings. Sequential traffic
//! releases every request before the next one; concurrent traffic submits
//! a batch of overlapping requests at once, holds whatever is granted and
//! releases in a random order. Every request must succeed, and the books of
//! the three owners must balance with no ring owned twice after every step.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use proptest::prelude::*;
use rm_core::{IncomingFlags, Right, RmConfig};
use rm_engine::{IncomingHandle, IncomingState, IncomingStatus};
use rm_testkit::strategies::arb_rings;
use rm_testkit::{Rings, RingsType, ThreeServers, ALL_RINGS};
use std::time::Duration;

/// Quiet period after which every pending request is taken to be blocked
const IDLE: Duration = Duration::from_millis(50);

fn arb_step() -> impl Strategy<Value = (usize, Rings)> {
    (0usize..3, arb_rings().prop_filter("empty want", |rings| rings.0 != 0))
}

fn run_traffic(steps: Vec<(usize, Rings)>) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        let chain = ThreeServers::new(ALL_RINGS).await;
        let flags = IncomingFlags::MAY_BORROW | IncomingFlags::MAY_REVOKE;
        for (index, want) in steps {
            let server = chain.servers()[index];
            let (request, status) = tokio::time::timeout(
                Duration::from_secs(10),
                server.get_and_wait(want, flags),
            )
            .await
            .map_err(|_| format!("{} stuck on {want:?}", server.name))?;
            if status.state != IncomingState::Success {
                return Err(format!("{} failed {want:?}: {status:?}", server.name));
            }
            if !want.is_subset(&server.snapshot().held_join()) {
                return Err(format!("{} granted less than {want:?}", server.name));
            }
            request.release().map_err(|err| err.to_string())?;
            chain.check_invariants()?;
        }
        Ok(())
    })
}

type Pending = (&'static str, Rings, IncomingHandle<RingsType>);

async fn settle_next(pending: &[Pending]) -> (usize, IncomingStatus) {
    let waits = pending.iter().map(|(_, _, request)| Box::pin(request.wait()));
    let (status, index, _) = futures::future::select_all(waits).await;
    (index, status)
}

/// Submit every request at once; grant, hold and release until all are done
async fn drive_concurrent(
    chain: &ThreeServers,
    requests: Vec<(usize, Rings)>,
    seed: usize,
) -> Result<(), String> {
    let flags = IncomingFlags::MAY_BORROW | IncomingFlags::MAY_REVOKE | IncomingFlags::LOCAL_WAIT;
    let mut pending: Vec<Pending> = requests
        .into_iter()
        .map(|(index, want)| {
            let server = chain.servers()[index];
            (server.name, want, server.get(want, flags))
        })
        .collect();
    let mut held: Vec<Pending> = Vec::new();
    let mut turn = seed;

    while !pending.is_empty() || !held.is_empty() {
        let settled = if pending.is_empty() {
            None
        } else {
            tokio::time::timeout(IDLE, settle_next(&pending)).await.ok()
        };
        match settled {
            Some((index, status)) => {
                let (name, want, request) = pending.swap_remove(index);
                if status.state != IncomingState::Success {
                    return Err(format!("{name} failed {want:?}: {status:?}"));
                }
                held.push((name, want, request));
                chain.check_invariants()?;
            }
            None => {
                if held.is_empty() {
                    return Err(format!("{} requests stuck with nothing held", pending.len()));
                }
                turn = turn.wrapping_mul(31).wrapping_add(7);
                let (name, want, request) = held.remove(turn % held.len());
                request
                    .release()
                    .map_err(|err| format!("{name} could not release {want:?}: {err}"))?;
                chain.check_invariants()?;
            }
        }
    }
    Ok(())
}

fn run_concurrent(requests: Vec<(usize, Rings)>, seed: usize) -> Result<(), String> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(async move {
        // Remote requests may wait behind several holders in turn.
        let config = RmConfig {
            outgoing_timeout_ms: 5_000,
            ..RmConfig::testing()
        };
        let chain = ThreeServers::with_config(ALL_RINGS, config).await;
        tokio::time::timeout(
            Duration::from_secs(10),
            drive_concurrent(&chain, requests, seed),
        )
        .await
        .map_err(|_| "concurrent traffic did not finish".to_string())??;
        chain.check_invariants()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_sequential_traffic_keeps_books_consistent(
        steps in prop::collection::vec(arb_step(), 1..12)
    ) {
        prop_assert_eq!(run_traffic(steps), Ok(()));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_concurrent_traffic_keeps_books_consistent(
        requests in prop::collection::vec(arb_step(), 1..7),
        seed in any::<usize>(),
    ) {
        prop_assert_eq!(run_concurrent(requests, seed), Ok(()));
    }
}

#[test]
fn test_rings_bounce_between_ends() {
    let steps = vec![
        (0, ALL_RINGS),
        (2, ALL_RINGS),
        (1, ALL_RINGS),
        (0, Rings(ALL_RINGS.0 >> 1)),
        (2, Rings(1)),
    ];
    assert_eq!(run_traffic(steps), Ok(()));
}

#[test]
fn test_overlapping_requests_on_every_server() {
    let requests = vec![
        (0, ALL_RINGS),
        (1, Rings(0b0110)),
        (2, Rings(0b0011)),
        (0, Rings(0b1000)),
        (2, ALL_RINGS),
    ];
    assert_eq!(run_concurrent(requests, 3), Ok(()));
}
