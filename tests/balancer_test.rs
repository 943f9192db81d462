//! Integration tests for the resource balancer.
//!
//! These tests validate:
//! - Even spreading of concurrent leases
//! - Usage accounting under concurrent acquire/release
//! - Ghost draining while the identity set changes underneath holders

use std::collections::HashMap;
use std::time::Duration;

use futures::future::join_all;
use prometheus_tunnel::core::{ResourceBalancer, TunnelError};
use rand::seq::SliceRandom;

// ============================================================================
// FAIRNESS
// ============================================================================

#[tokio::test]
async fn test_held_leases_spread_evenly() {
    let balancer = ResourceBalancer::new();
    balancer.provision(["a", "b", "c", "d"]).unwrap();

    let leases: Vec<_> = (0..12).map(|_| balancer.try_acquire().unwrap()).collect();

    let snapshot = balancer.snapshot();
    assert!(snapshot.live.iter().all(|i| i.usage == 3));
    assert_eq!(snapshot.total_usage(), 12);

    drop(leases);
    assert_eq!(balancer.snapshot().total_usage(), 0);
}

#[tokio::test]
async fn test_sequential_leases_rotate() {
    let balancer = ResourceBalancer::new();
    balancer.provision(["a", "b", "c"]).unwrap();

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for _ in 0..30 {
        let lease = balancer.acquire().await;
        *counts.entry(*lease).or_default() += 1;
    }
    assert_eq!(counts.len(), 3);
    assert!(counts.values().all(|&n| n == 10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_usage_returns_to_zero() {
    let balancer = ResourceBalancer::new();
    balancer.provision(0..4u16).unwrap();

    let tasks = (0..64).map(|_| {
        let balancer = balancer.clone();
        tokio::spawn(async move {
            let lease = balancer.acquire().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
            *lease
        })
    });

    for result in join_all(tasks).await {
        assert!(result.unwrap() < 4);
    }
    let snapshot = balancer.snapshot();
    assert_eq!(snapshot.live.len(), 4);
    assert_eq!(snapshot.total_usage(), 0);
}

// ============================================================================
// PROVISIONING
// ============================================================================

#[tokio::test]
async fn test_reprovision_with_held_leases_drains_ghosts() {
    let balancer = ResourceBalancer::new();
    balancer.provision(1..=6u32).unwrap();
    let mut leases: Vec<_> = (0..6).map(|_| balancer.try_acquire().unwrap()).collect();

    let report = balancer.provision([5, 6, 7]).unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.ghosted, 4);
    assert_eq!(report.removed, 0);

    let snapshot = balancer.snapshot();
    assert_eq!(snapshot.live.len(), 3);
    assert_eq!(snapshot.ghosts.len(), 4);
    assert_eq!(snapshot.total_usage(), 6);

    // New leases only ever come from the live set.
    for _ in 0..9 {
        let lease = balancer.try_acquire().unwrap();
        assert!([5, 6, 7].contains(lease.identity()));
    }

    leases.shuffle(&mut rand::rng());
    drop(leases);

    let snapshot = balancer.snapshot();
    assert!(snapshot.ghosts.is_empty());
    assert_eq!(snapshot.total_usage(), 0);
}

#[tokio::test]
async fn test_shuffled_reprovisioning_keeps_live_set_exact() {
    let balancer = ResourceBalancer::new();
    let mut rng = rand::rng();
    let mut held = Vec::new();

    for round in 0..20u32 {
        let mut ids: Vec<u32> = (0..8).collect();
        ids.shuffle(&mut rng);
        ids.truncate(3 + (round % 4) as usize);

        balancer.provision(ids.clone()).unwrap();
        held.push(balancer.try_acquire().unwrap());

        let mut live: Vec<u32> = balancer.snapshot().live.into_iter().map(|i| i.identity).collect();
        live.sort_unstable();
        ids.sort_unstable();
        assert_eq!(live, ids);
    }

    drop(held);
    let snapshot = balancer.snapshot();
    assert!(snapshot.ghosts.is_empty());
    assert_eq!(snapshot.total_usage(), 0);
}

#[tokio::test]
async fn test_acquire_waits_for_first_provision() {
    let balancer = ResourceBalancer::<&str>::new();

    let err = balancer
        .acquire_timeout(Duration::from_millis(20))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::Timeout(_)));

    let waiter = {
        let balancer = balancer.clone();
        tokio::spawn(async move { *balancer.acquire().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    balancer.provision(["late"]).unwrap();

    let got = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, "late");
}
