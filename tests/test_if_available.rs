//! `if_available` requests never queue: a miss runs the callback once with
//! no lock and the future settles with the callback's own result.

#[path = "test_support/mod.rs"]
mod test_support;

use serial_test::serial;
use test_support::{downcast, event_log, next_events, request_on, settle, settle_err};
use tokio::sync::oneshot;
use weblocks::{CallbackOutcome, Environment, LockError, LockOptions, Mode, payload};

fn if_available() -> LockOptions {
    LockOptions {
        if_available: true,
        ..LockOptions::default()
    }
}

#[test]
#[serial]
fn miss_runs_callback_with_no_lock_without_queuing() {
    let env = Environment::spawn("ifa-miss").unwrap();
    let (log, events) = event_log();
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let holder_log = log.clone();
    let holder = request_on(&env, "ifa-r", LockOptions::default(), move |_lock| {
        holder_log.record("holder:begin");
        CallbackOutcome::pending(async move {
            let _ = gate_rx.await;
            Ok(payload(()))
        })
    })
    .unwrap();
    assert_eq!(next_events(&events, 1), vec!["holder:begin"]);

    let miss_log = log.clone();
    let miss = request_on(&env, "ifa-r", if_available(), move |lock| {
        miss_log.record(format!("miss:none={}", lock.is_none()));
        CallbackOutcome::ready("missed")
    })
    .unwrap();
    assert_eq!(next_events(&events, 1), vec!["miss:none=true"]);

    // The miss settles while the holder is still in place.
    let value = settle(miss).unwrap();
    assert_eq!(downcast::<&str>(&value), "missed");

    gate_tx.send(()).unwrap();
    settle(holder).unwrap();
    env.shutdown();
}

#[test]
#[serial]
fn grants_immediately_when_the_resource_is_free() {
    let env = Environment::spawn("ifa-free").unwrap();
    let (log, events) = event_log();

    let grant_log = log.clone();
    let options = LockOptions {
        mode: Mode::Shared,
        if_available: true,
        ..LockOptions::default()
    };
    let granted = request_on(&env, "ifa-free-r", options, move |lock| {
        let lock = lock.expect("granted immediately");
        grant_log.record(format!("granted:{}:{}", lock.name(), lock.mode()));
        CallbackOutcome::ready(1_u32)
    })
    .unwrap();

    assert_eq!(next_events(&events, 1), vec!["granted:ifa-free-r:shared"]);
    let value = settle(granted).unwrap();
    assert_eq!(downcast::<u32>(&value), 1);
    env.shutdown();
}

#[test]
#[serial]
fn miss_with_async_callback_settles_with_its_value() {
    let env = Environment::spawn("ifa-async").unwrap();
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let holder = request_on(&env, "ifa-async-r", LockOptions::default(), move |_lock| {
        CallbackOutcome::pending(async move {
            let _ = gate_rx.await;
            Ok(payload(()))
        })
    })
    .unwrap();

    let miss = request_on(&env, "ifa-async-r", if_available(), move |lock| {
        assert!(lock.is_none());
        CallbackOutcome::pending(async move { Ok(payload("later")) })
    })
    .unwrap();

    let value = settle(miss).unwrap();
    assert_eq!(downcast::<&str>(&value), "later");

    gate_tx.send(()).unwrap();
    settle(holder).unwrap();
    env.shutdown();
}

#[test]
#[serial]
fn miss_callback_failure_rejects_the_future() {
    let env = Environment::spawn("ifa-failure").unwrap();
    let (gate_tx, gate_rx) = oneshot::channel::<()>();

    let holder = request_on(&env, "ifa-fail-r", LockOptions::default(), move |_lock| {
        CallbackOutcome::pending(async move {
            let _ = gate_rx.await;
            Ok(payload(()))
        })
    })
    .unwrap();

    let miss = request_on(&env, "ifa-fail-r", if_available(), move |lock| {
        assert!(lock.is_none());
        CallbackOutcome::failed("nope")
    })
    .unwrap();

    match settle_err(miss) {
        LockError::Callback(value) => assert_eq!(downcast::<&str>(&value), "nope"),
        other => panic!("expected a callback failure, got {other:?}"),
    }

    gate_tx.send(()).unwrap();
    settle(holder).unwrap();
    env.shutdown();
}
