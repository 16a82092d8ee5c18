//! Process-wide lock manager: the held-lock table, the pending FIFO, and the
//! machinery that grants, steals, releases, and cleans up across
//! environments.
//!
//! One mutex guards all shared state. It is held only around queue scans and
//! table mutations, never across user callbacks, wake posting, or channel
//! settlement.

mod grant;
mod record;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::environment::EnvironmentHandle;
use crate::error::LockError;
use crate::types::{CallbackResult, LockCallback, LockInfo, LockSnapshot, Mode};

use record::{HeldLock, LockRequest, ReleasedReceiver, WaitingReceiver};

static CURRENT: LazyLock<LockManager> = LazyLock::new(LockManager::new);

/// Shared queue state.
#[derive(Default)]
struct QueueState {
    /// Granted locks per resource name, in grant order. Never holds an
    /// empty list.
    held: HashMap<String, Vec<Arc<HeldLock>>>,
    /// Queued requests across all names and environments.
    pending: VecDeque<LockRequest>,
    /// Environments that have requested at least once; each carries a
    /// cleanup hook that drops its state on teardown.
    registered: HashSet<EnvironmentHandle>,
}

/// The process-wide lock arbiter.
///
/// Not constructible; every environment shares [`LockManager::current`].
pub struct LockManager {
    state: Mutex<QueueState>,
}

impl LockManager {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
        }
    }

    /// The singleton manager shared by every environment in the process.
    #[must_use]
    pub fn current() -> &'static LockManager {
        &CURRENT
    }

    /// Enqueue a request and drive the grant loop for its environment.
    ///
    /// Must run on `env`'s thread.
    pub(crate) fn submit(
        &self,
        env: &EnvironmentHandle,
        name: String,
        mode: Mode,
        steal: bool,
        if_available: bool,
        callback: LockCallback,
    ) -> (WaitingReceiver, ReleasedReceiver) {
        let (waiting_tx, waiting_rx) = oneshot::channel();
        let (released_tx, released_rx) = oneshot::channel();
        let request = LockRequest {
            name,
            mode,
            client_id: env.client_id().to_owned(),
            env: env.clone(),
            steal,
            if_available,
            callback,
            waiting: waiting_tx,
            released: released_tx,
        };
        {
            let mut state = self.state.lock();
            if state.registered.insert(env.clone()) {
                let hook_env = env.clone();
                env.add_cleanup_hook(move || {
                    LockManager::current().cleanup_environment(&hook_env);
                });
            }
            // Steal requests jump to the front of the FIFO.
            if request.steal {
                state.pending.push_front(request);
            } else {
                state.pending.push_back(request);
            }
        }
        self.process_queue(env);
        (waiting_rx, released_rx)
    }

    /// Held and pending entries owned by `env`, in grant/FIFO order.
    ///
    /// Ordering across distinct resource names follows table iteration and
    /// is unspecified.
    #[must_use]
    pub fn query(&self, env: &EnvironmentHandle) -> LockSnapshot {
        let state = self.state.lock();
        let held = state
            .held
            .values()
            .flatten()
            .filter(|lock| lock.env() == env)
            .map(|lock| LockInfo {
                name: lock.name().to_owned(),
                mode: lock.mode(),
                client_id: lock.client_id().to_owned(),
            })
            .collect();
        let pending = state
            .pending
            .iter()
            .filter(|request| request.env == *env)
            .map(|request| LockInfo {
                name: request.name.clone(),
                mode: request.mode,
                client_id: request.client_id.clone(),
            })
            .collect();
        LockSnapshot { held, pending }
    }

    /// Drop all holdings and queued requests of a stopped environment.
    ///
    /// Runs from the environment's cleanup hook. Environments still waiting
    /// on a name this teardown vacated are woken so they are not stranded.
    pub(crate) fn cleanup_environment(&self, env: &EnvironmentHandle) {
        let mut to_wake: HashSet<EnvironmentHandle> = HashSet::new();
        {
            let mut state = self.state.lock();
            let mut vacated: HashSet<String> = HashSet::new();
            state.held.retain(|name, locks| {
                let before = locks.len();
                locks.retain(|lock| lock.env() != env);
                if locks.len() != before {
                    vacated.insert(name.clone());
                }
                !locks.is_empty()
            });
            state.pending.retain(|request| {
                if request.env == *env {
                    vacated.insert(request.name.clone());
                    false
                } else {
                    true
                }
            });
            for request in &state.pending {
                if vacated.contains(&request.name) {
                    to_wake.insert(request.env.clone());
                }
            }
            state.registered.remove(env);
        }
        for target in &to_wake {
            Self::wake_environment(target);
        }
        debug!(environment = %env.name(), "environment cleaned up");
    }

    /// Drop holdings that were stolen out from under other environments.
    ///
    /// Their released channels were already rejected at steal time; only the
    /// table entries remain.
    fn cleanup_stolen_locks(&self, env: &EnvironmentHandle) {
        let mut state = self.state.lock();
        state.held.retain(|_, locks| {
            locks.retain(|lock| !(lock.is_stolen() && lock.env() != env));
            !locks.is_empty()
        });
    }

    /// Post a grant pass onto another environment's run loop. Best-effort;
    /// stopping environments are skipped.
    fn wake_environment(target: &EnvironmentHandle) {
        if target.is_stopping() {
            return;
        }
        let env = target.clone();
        let _ = target.post(move || {
            if !env.is_stopping() {
                LockManager::current().process_queue(&env);
            }
        });
    }

    /// Release after the callback's future settles, then drive the grant
    /// loop again.
    pub(crate) fn release_and_process_queue(
        &self,
        env: &EnvironmentHandle,
        lock: &Arc<HeldLock>,
        result: CallbackResult,
    ) {
        self.remove_held(lock);
        // A stolen lock's released channel was already rejected at steal
        // time; the settled result is discarded.
        if let Some(released) = lock.take_released() {
            let _ = released.send(result.map_err(LockError::Callback));
        }
        self.process_queue(env);
    }

    fn remove_held(&self, lock: &Arc<HeldLock>) {
        let mut state = self.state.lock();
        let now_empty = match state.held.get_mut(lock.name()) {
            Some(holders) => {
                holders.retain(|held| !Arc::ptr_eq(held, lock));
                holders.is_empty()
            }
            None => false,
        };
        if now_empty {
            state.held.remove(lock.name());
        }
    }
}
