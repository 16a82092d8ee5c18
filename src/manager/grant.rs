//! The grant loop: scan the pending FIFO, grant what can run on this
//! environment, and wake every other environment that may have become
//! grantable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::environment::EnvironmentHandle;
use crate::error::LockError;
use crate::types::{CallbackOutcome, Lock, Mode};

use super::record::{HeldLock, LockRequest, ReleasedSender};
use super::{LockManager, QueueState};

/// What the scan pass picked for the current environment.
#[derive(Clone, Copy)]
enum Selection {
    /// Compatible with the holders and first in line for its name.
    Grant,
    /// An `if_available` request whose resource is busy.
    Unavailable,
}

impl LockManager {
    /// Drive grants for `env` until no further progress is possible.
    ///
    /// Runs on `env`'s thread: user callbacks are invoked here, with the
    /// queue mutex released.
    pub(crate) fn process_queue(&self, env: &EnvironmentHandle) {
        self.cleanup_stolen_locks(env);
        loop {
            let mut to_wake: HashSet<EnvironmentHandle> = HashSet::new();
            let selected = {
                let mut state = self.state.lock();
                let decision = scan(&state, env, &mut to_wake);
                decision.map(|(index, selection)| {
                    let request = state
                        .pending
                        .remove(index)
                        .expect("scan index stays valid while the lock is held");
                    (request, selection)
                })
            };
            for target in &to_wake {
                Self::wake_environment(target);
            }
            match selected {
                None => return,
                Some((request, Selection::Unavailable)) => {
                    self.grant_unavailable(request);
                    return;
                }
                Some((request, Selection::Grant)) => self.grant(env, request),
            }
        }
    }

    /// Grant `request`, invoke its callback with a lock descriptor, and
    /// arrange release on settlement.
    fn grant(&self, env: &EnvironmentHandle, request: LockRequest) {
        let LockRequest {
            name,
            mode,
            client_id,
            steal,
            callback,
            waiting,
            released,
            ..
        } = request;

        if steal {
            self.steal_existing(env, &name);
        }

        let lock = Arc::new(HeldLock::new(
            name.clone(),
            mode,
            env.clone(),
            client_id,
            released,
        ));
        {
            let mut state = self.state.lock();
            state
                .held
                .entry(name.clone())
                .or_default()
                .push(Arc::clone(&lock));
        }
        debug!(resource = %name, mode = %mode, "lock granted");

        match callback(Some(Lock::new(name, mode))) {
            CallbackOutcome::Ready(Ok(value)) => {
                let _ = waiting.send(Ok(()));
                self.remove_held(&lock);
                if let Some(released) = lock.take_released() {
                    let _ = released.send(Ok(value));
                }
            }
            CallbackOutcome::Ready(Err(error)) => {
                // Synchronous failure: both channels reject with the same
                // payload and the lock is released immediately.
                self.remove_held(&lock);
                let _ = waiting.send(Err(LockError::Callback(Arc::clone(&error))));
                if let Some(released) = lock.take_released() {
                    let _ = released.send(Err(LockError::Callback(error)));
                }
            }
            CallbackOutcome::Pending(future) => {
                let _ = waiting.send(Ok(()));
                let env = env.clone();
                tokio::task::spawn_local(async move {
                    let result = future.await;
                    LockManager::current().release_and_process_queue(&env, &lock, result);
                });
            }
        }
    }

    /// Repudiate every current holder of `name` on behalf of a steal
    /// request: mark stolen, reject the released channels, evict this
    /// environment's holdings right away, and wake the rest to evict theirs.
    fn steal_existing(&self, env: &EnvironmentHandle, name: &str) {
        let mut rejected: Vec<ReleasedSender> = Vec::new();
        let mut to_wake: HashSet<EnvironmentHandle> = HashSet::new();
        let mut preempted = 0_usize;
        {
            let mut state = self.state.lock();
            let now_empty = match state.held.get_mut(name) {
                Some(holders) => {
                    for holder in holders.iter() {
                        holder.mark_stolen();
                        preempted += 1;
                        if holder.env() != env {
                            to_wake.insert(holder.env().clone());
                        }
                        if let Some(released) = holder.take_released() {
                            rejected.push(released);
                        }
                    }
                    holders.retain(|lock| lock.env() != env);
                    holders.is_empty()
                }
                None => false,
            };
            if now_empty {
                state.held.remove(name);
            }
        }
        for released in rejected {
            let _ = released.send(Err(LockError::Stolen));
        }
        for target in &to_wake {
            Self::wake_environment(target);
        }
        if preempted > 0 {
            debug!(resource = name, count = preempted, "holders preempted by steal");
        }
    }

    /// An `if_available` request missed: the callback runs immediately with
    /// no lock and its own result settles both channels. Nothing is added to
    /// the held table.
    fn grant_unavailable(&self, request: LockRequest) {
        let LockRequest {
            name,
            callback,
            waiting,
            released,
            ..
        } = request;
        trace!(resource = %name, "ifAvailable request missed");

        match callback(None) {
            CallbackOutcome::Ready(Ok(value)) => {
                let _ = waiting.send(Ok(()));
                let _ = released.send(Ok(value));
            }
            CallbackOutcome::Ready(Err(error)) => {
                let _ = waiting.send(Err(LockError::Callback(Arc::clone(&error))));
                let _ = released.send(Err(LockError::Callback(error)));
            }
            CallbackOutcome::Pending(future) => {
                let _ = waiting.send(Ok(()));
                tokio::task::spawn_local(async move {
                    let result = future.await;
                    let _ = released.send(result.map_err(LockError::Callback));
                });
            }
        }
    }
}

/// One pass over the pending FIFO.
///
/// Picks at most one request belonging to `env` to act on and records every
/// other environment with queued requests so it can be woken.
fn scan(
    state: &QueueState,
    env: &EnvironmentHandle,
    to_wake: &mut HashSet<EnvironmentHandle>,
) -> Option<(usize, Selection)> {
    let mut seen_names: HashSet<&str> = HashSet::new();
    for (index, request) in state.pending.iter().enumerate() {
        // An earlier pending request for the same name always goes first;
        // later requests queue behind it even when mode-compatible with the
        // current holders. This keeps exclusive requests from starving
        // behind a stream of shared ones.
        let blocked = seen_names.contains(request.name.as_str());
        seen_names.insert(request.name.as_str());

        if request.env != *env {
            to_wake.insert(request.env.clone());
            continue;
        }
        if blocked || !is_grantable(&state.held, request) {
            if request.if_available {
                return Some((index, Selection::Unavailable));
            }
            continue;
        }
        return Some((index, Selection::Grant));
    }
    None
}

fn is_grantable(held: &HashMap<String, Vec<Arc<HeldLock>>>, request: &LockRequest) -> bool {
    // Steal requests preempt instead of waiting.
    if request.steal {
        return true;
    }
    match held.get(&request.name) {
        None => true,
        Some(holders) => match request.mode {
            Mode::Exclusive => false,
            Mode::Shared => holders.iter().all(|lock| lock.mode() == Mode::Shared),
        },
    }
}
