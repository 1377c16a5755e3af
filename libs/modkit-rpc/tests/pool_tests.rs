mod common;

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::StubDialer;
use modkit_rpc::{EndpointPool, Module, RpcError, DEFAULT_SLOT};

fn pool() -> Arc<EndpointPool<StubDialer>> {
    Arc::new(EndpointPool::new(StubDialer::default()))
}

#[test]
fn unknown_and_empty_modules_differ() {
    let pool = pool();
    let auth = Module::from("auth");

    assert_eq!(pool.list_addresses(&auth), None);
    assert_eq!(pool.pick_random(&auth), None);

    pool.add(&auth, "h1:1");
    pool.remove(&auth, "h1:1");
    assert_eq!(
        pool.list_addresses(&auth),
        Some(BTreeSet::new()),
        "module stays known with no addresses"
    );
    assert_eq!(pool.pick_random(&auth), None);
}

#[test]
fn add_is_idempotent_and_random_pick_stays_in_set() {
    let pool = pool();
    let auth = Module::from("auth");
    pool.add(&auth, "h1:1");
    pool.add(&auth, "h1:1");
    pool.add(&auth, "h2:1");

    let known = pool.list_addresses(&auth).expect("known module");
    assert_eq!(known.len(), 2);

    let mut seen = BTreeSet::new();
    for _ in 0..200 {
        let picked = pool.pick_random(&auth).expect("non-empty");
        assert!(known.contains(&picked));
        seen.insert(picked);
    }
    assert_eq!(seen, known, "both addresses should be picked over 200 draws");
}

#[test]
fn remove_unknown_is_noop() {
    let pool = pool();
    pool.remove(&Module::from("ghost"), "nowhere:1");
    assert_eq!(pool.list_addresses(&Module::from("ghost")), None);
}

#[tokio::test]
async fn connection_is_pooled_per_slot() {
    let pool = pool();
    let auth = Module::from("auth");
    pool.add(&auth, "h1:1");

    let a = pool.get_connection(&auth, "h1:1", DEFAULT_SLOT).await.expect("dial");
    let b = pool.get_connection(&auth, "h1:1", DEFAULT_SLOT).await.expect("pooled");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(pool.dialer().dial_count(), 1);

    let c = pool.get_connection(&auth, "h1:1", 2).await.expect("second slot");
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(pool.dialer().dial_count(), 2);
}

#[tokio::test]
async fn concurrent_first_use_dials_once() {
    let pool = pool();
    *pool.dialer().delay.lock() = Some(Duration::from_millis(30));
    let auth = Module::from("auth");
    pool.add(&auth, "h1:1");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = Arc::clone(&pool);
        let auth = auth.clone();
        tasks.push(tokio::spawn(async move {
            pool.get_connection(&auth, "h1:1", DEFAULT_SLOT).await
        }));
    }

    let mut conns = Vec::new();
    for task in tasks {
        conns.push(task.await.expect("join").expect("connection"));
    }
    assert_eq!(pool.dialer().dial_count(), 1, "exactly one dial");
    assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
}

#[tokio::test]
async fn failed_dial_leaves_no_stale_entry() {
    let pool = pool();
    pool.dialer().fail_next.store(1, Ordering::SeqCst);
    let auth = Module::from("auth");
    pool.add(&auth, "h1:1");

    let err = pool
        .get_connection(&auth, "h1:1", DEFAULT_SLOT)
        .await
        .expect_err("first dial fails");
    match err {
        RpcError::ConnectFailure {
            module,
            address,
            reason,
        } => {
            assert_eq!(module, auth);
            assert_eq!(address, "h1:1");
            assert!(reason.contains("connection refused"), "reason: {reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    pool.get_connection(&auth, "h1:1", DEFAULT_SLOT)
        .await
        .expect("retry dials again");
    assert_eq!(pool.dialer().dial_count(), 2);
}

#[tokio::test]
async fn unregistered_address_is_connect_failure() {
    let pool = pool();
    let err = pool
        .get_connection(&Module::from("auth"), "h1:1", DEFAULT_SLOT)
        .await
        .expect_err("not registered");
    assert!(err.is_connect_failure());
    assert_eq!(pool.dialer().dial_count(), 0);
}

#[tokio::test]
async fn remove_closes_pooled_connections() {
    let pool = pool();
    let auth = Module::from("auth");
    pool.add(&auth, "h1:1");
    pool.get_connection(&auth, "h1:1", 1).await.expect("slot 1");
    pool.get_connection(&auth, "h1:1", 2).await.expect("slot 2");

    pool.remove(&auth, "h1:1");
    assert_eq!(pool.dialer().closed_count(), 2);
    assert!(pool
        .get_connection(&auth, "h1:1", 1)
        .await
        .expect_err("removed")
        .is_connect_failure());
}

#[tokio::test]
async fn remove_during_dial_closes_fresh_connection() {
    let pool = pool();
    *pool.dialer().delay.lock() = Some(Duration::from_millis(100));
    let auth = Module::from("auth");
    pool.add(&auth, "h1:1");

    let dialing = {
        let pool = Arc::clone(&pool);
        let auth = auth.clone();
        tokio::spawn(async move { pool.get_connection(&auth, "h1:1", DEFAULT_SLOT).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.remove(&auth, "h1:1");

    let err = dialing.await.expect("join").expect_err("removed mid-dial");
    assert!(err.is_connect_failure());
    assert_eq!(pool.dialer().dial_count(), 1);
    assert_eq!(
        pool.dialer().closed_count(),
        1,
        "the connection dialed for a removed address must be closed"
    );
}

#[tokio::test]
async fn release_all_keeps_addresses_and_redials() {
    let pool = pool();
    let auth = Module::from("auth");
    let users = Module::from("users");
    pool.add(&auth, "h1:1");
    pool.add(&users, "h2:1");
    pool.get_connection(&auth, "h1:1", DEFAULT_SLOT).await.expect("auth");
    pool.get_connection(&users, "h2:1", DEFAULT_SLOT).await.expect("users");

    assert_eq!(pool.release_all(), 2);
    assert_eq!(pool.dialer().closed_count(), 2);
    assert_eq!(
        pool.list_addresses(&auth),
        Some(BTreeSet::from(["h1:1".to_owned()]))
    );

    pool.get_connection(&auth, "h1:1", DEFAULT_SLOT)
        .await
        .expect("fresh dial");
    assert_eq!(pool.dialer().dial_count(), 3);
}
