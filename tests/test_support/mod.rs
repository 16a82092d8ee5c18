//! Shared helpers for lock manager integration tests.
//!
//! Included via `#[path = "test_support/mod.rs"]` in multiple test files.
//! Not every helper is used in every test file, so dead_code is allowed
//! globally.
#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use weblocks::{CallbackOutcome, Environment, Lock, LockError, LockFuture, LockOptions, Payload};

/// Generous upper bound for cross-thread waits.
pub const WAIT: Duration = Duration::from_secs(5);

/// Window used to assert that an event does NOT happen.
pub const QUIET: Duration = Duration::from_millis(300);

/// Opt-in tracing for debugging test runs (`RUST_LOG=weblocks=trace`).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Ordered, cross-thread observation log.
#[derive(Clone)]
pub struct EventLog {
    sender: Sender<String>,
}

pub fn event_log() -> (EventLog, Receiver<String>) {
    let (sender, receiver) = mpsc::channel();
    (EventLog { sender }, receiver)
}

impl EventLog {
    pub fn record(&self, event: impl Into<String>) {
        let _ = self.sender.send(event.into());
    }
}

/// Receive the next `count` events, failing the test on a stall.
pub fn next_events(receiver: &Receiver<String>, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| {
            receiver
                .recv_timeout(WAIT)
                .expect("expected another event before the deadline")
        })
        .collect()
}

/// Assert that no event arrives within the quiet window.
pub fn assert_quiet(receiver: &Receiver<String>) {
    match receiver.recv_timeout(QUIET) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok(event) => panic!("unexpected event: {event}"),
        Err(RecvTimeoutError::Disconnected) => panic!("event log disconnected"),
    }
}

/// Issue a request on `env` and hand the outward future back to the caller.
pub fn request_on(
    env: &Environment,
    name: &str,
    options: LockOptions,
    callback: impl FnOnce(Option<Lock>) -> CallbackOutcome + Send + 'static,
) -> Result<LockFuture, LockError> {
    let (sender, receiver) = mpsc::channel();
    let name = name.to_string();
    env.post(move || {
        let _ = sender.send(weblocks::request(&name, options, callback));
    });
    receiver.recv_timeout(WAIT).expect("request dispatched")
}

/// Run a query on `env` and hand the snapshot back to the caller.
pub fn query_on(env: &Environment) -> weblocks::LockSnapshot {
    let (sender, receiver) = mpsc::channel();
    env.post(move || {
        let _ = sender.send(weblocks::query());
    });
    receiver
        .recv_timeout(WAIT)
        .expect("query dispatched")
        .expect("query ran on an environment")
}

/// Block until the outward future settles.
pub fn settle(future: LockFuture) -> Result<Payload, LockError> {
    futures::executor::block_on(future)
}

/// Block until the outward future settles, expecting a failure.
pub fn settle_err(future: LockFuture) -> LockError {
    match settle(future) {
        Err(err) => err,
        Ok(_) => panic!("expected the request to fail"),
    }
}

/// Downcast a payload produced by `CallbackOutcome::ready`.
pub fn downcast<T: Clone + 'static>(value: &Payload) -> T {
    value
        .downcast_ref::<T>()
        .expect("payload holds the expected type")
        .clone()
}
