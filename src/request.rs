//! Request front-end: argument validation, option normalization, dispatch to
//! the manager, and the race between grant and an abort signal.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::abort::AbortSignal;
use crate::environment::EnvironmentHandle;
use crate::error::LockError;
use crate::manager::LockManager;
use crate::types::{CallbackOutcome, Lock, LockCallback, LockSnapshot, Mode, Payload, payload};

/// Resource names starting with this character are reserved for the host
/// runtime and always rejected.
pub const RESERVED_PREFIX: char = '-';

/// Options accepted by [`request`].
#[derive(Debug, Clone, Default)]
pub struct LockOptions {
    /// Compatibility class of the request.
    pub mode: Mode,
    /// Never queue: on a miss the callback runs once with `None`.
    pub if_available: bool,
    /// Preempt current holders of the name.
    pub steal: bool,
    /// Cancels the request while it is still queued.
    pub signal: Option<AbortSignal>,
}

impl LockOptions {
    /// Exclusive-mode options (the default).
    #[must_use]
    pub fn exclusive() -> Self {
        Self::default()
    }

    /// Shared-mode options.
    #[must_use]
    pub fn shared() -> Self {
        Self {
            mode: Mode::Shared,
            ..Self::default()
        }
    }
}

fn validate(name: &str, options: &LockOptions) -> Result<(), LockError> {
    if name.starts_with(RESERVED_PREFIX) {
        return Err(LockError::ReservedName(name.to_owned()));
    }
    if options.if_available && options.steal {
        return Err(LockError::StealWithIfAvailable);
    }
    if options.steal && options.mode != Mode::Exclusive {
        return Err(LockError::StealRequiresExclusive);
    }
    if options.signal.is_some() && (options.steal || options.if_available) {
        return Err(LockError::SignalNotAllowed);
    }
    Ok(())
}

/// Future returned by [`request`], resolved with the callback's settled
/// value once the lock has been released.
#[must_use = "the request settles through this future"]
pub struct LockFuture {
    receiver: oneshot::Receiver<Result<Payload, LockError>>,
}

impl fmt::Debug for LockFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFuture").finish_non_exhaustive()
    }
}

impl Future for LockFuture {
    type Output = Result<Payload, LockError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result.map_err(LockError::into_public)),
            // The owning environment was torn down with the request still
            // outstanding.
            Poll::Ready(Err(_)) => Poll::Ready(Err(LockError::Aborted { reason: None })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Request a lock on `name` and run `callback` while it is held.
///
/// The callback runs on this environment's loop once the lock is granted
/// (immediately with `None` if `if_available` is set and the resource is
/// busy). The returned future settles with the callback's own result once
/// the lock is released.
///
/// Must be called on an environment thread. Validation failures surface
/// synchronously; every later outcome arrives through the future.
///
/// # Errors
///
/// * [`LockError::NoEnvironment`] — called outside any environment loop.
/// * [`LockError::ReservedName`] — `name` starts with `-`.
/// * [`LockError::StealWithIfAvailable`], [`LockError::StealRequiresExclusive`],
///   [`LockError::SignalNotAllowed`] — inconsistent option combinations.
/// * [`LockError::Aborted`] — the signal had already fired.
pub fn request<F>(name: &str, options: LockOptions, callback: F) -> Result<LockFuture, LockError>
where
    F: FnOnce(Option<Lock>) -> CallbackOutcome + Send + 'static,
{
    let env = EnvironmentHandle::current().ok_or(LockError::NoEnvironment)?;
    validate(name, &options)?;

    if let Some(signal) = options.signal.clone() {
        if signal.aborted() {
            return Err(LockError::Aborted {
                reason: signal.reason(),
            });
        }
        return Ok(dispatch_with_signal(
            &env,
            name,
            &options,
            signal,
            Box::new(callback),
        ));
    }

    let (_waiting, released) = LockManager::current().submit(
        &env,
        name.to_owned(),
        options.mode,
        options.steal,
        options.if_available,
        Box::new(callback),
    );
    Ok(LockFuture { receiver: released })
}

/// Race state between the abort signal and the grant becoming effective.
///
/// `outward` doubles as the settled flag: taken by whichever side wins.
struct GrantRace {
    outward: Option<oneshot::Sender<Result<Payload, LockError>>>,
    granted: bool,
}

fn dispatch_with_signal(
    env: &EnvironmentHandle,
    name: &str,
    options: &LockOptions,
    signal: AbortSignal,
    callback: LockCallback,
) -> LockFuture {
    let (outward_tx, outward_rx) = oneshot::channel();
    let race = Arc::new(Mutex::new(GrantRace {
        outward: Some(outward_tx),
        granted: false,
    }));

    let abort_race = Arc::clone(&race);
    let registration = signal.on_abort(move |reason| {
        let outward = {
            let mut race = abort_race.lock();
            // Too late once the callback has begun.
            if race.granted {
                return;
            }
            race.outward.take()
        };
        if let Some(outward) = outward {
            let _ = outward.send(Err(LockError::Aborted { reason }));
        }
    });

    // At entry the guard loses to any abort that already settled the race;
    // otherwise it latches the grant so the signal is ignored from here on.
    let guard_race = Arc::clone(&race);
    let guard_signal = signal.clone();
    let guarded: LockCallback = Box::new(move |lock| {
        {
            let mut race = guard_race.lock();
            if race.outward.is_none() {
                // Fail the grant so the lock is released immediately; the
                // outward future has already rejected with the reason.
                let reason = guard_signal
                    .reason()
                    .unwrap_or_else(|| payload("lock request aborted"));
                return CallbackOutcome::Ready(Err(reason));
            }
            race.granted = true;
        }
        callback(lock)
    });

    let (_waiting, released) = LockManager::current().submit(
        env,
        name.to_owned(),
        options.mode,
        options.steal,
        options.if_available,
        guarded,
    );

    // Forward the manager's outcome unless the signal already settled the
    // race, then drop the listener.
    let forward_race = race;
    tokio::task::spawn_local(async move {
        let result = match released.await {
            Ok(result) => result,
            Err(_) => Err(LockError::Aborted { reason: None }),
        };
        let outward = forward_race.lock().outward.take();
        if let Some(outward) = outward {
            let _ = outward.send(result);
        }
        registration.remove();
    });

    LockFuture {
        receiver: outward_rx,
    }
}

/// Snapshot of the calling environment's held locks and pending requests.
///
/// # Errors
///
/// Returns [`LockError::NoEnvironment`] when called outside any environment
/// loop.
pub fn query() -> Result<LockSnapshot, LockError> {
    let env = EnvironmentHandle::current().ok_or(LockError::NoEnvironment)?;
    Ok(LockManager::current().query(&env))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abort::AbortController;

    #[test]
    fn reserved_names_are_rejected() {
        let err = validate("-private", &LockOptions::default()).unwrap_err();
        assert!(matches!(err, LockError::ReservedName(ref name) if name == "-private"));
    }

    #[test]
    fn steal_and_if_available_conflict() {
        let options = LockOptions {
            steal: true,
            if_available: true,
            ..LockOptions::default()
        };
        assert!(matches!(
            validate("r", &options),
            Err(LockError::StealWithIfAvailable)
        ));
    }

    #[test]
    fn steal_requires_exclusive_mode() {
        let options = LockOptions {
            steal: true,
            mode: Mode::Shared,
            ..LockOptions::default()
        };
        assert!(matches!(
            validate("r", &options),
            Err(LockError::StealRequiresExclusive)
        ));
    }

    #[test]
    fn signal_conflicts_with_steal_and_if_available() {
        let controller = AbortController::new();
        let with_steal = LockOptions {
            steal: true,
            signal: Some(controller.signal()),
            ..LockOptions::default()
        };
        assert!(matches!(
            validate("r", &with_steal),
            Err(LockError::SignalNotAllowed)
        ));

        let with_if_available = LockOptions {
            if_available: true,
            signal: Some(controller.signal()),
            ..LockOptions::default()
        };
        assert!(matches!(
            validate("r", &with_if_available),
            Err(LockError::SignalNotAllowed)
        ));
    }

    #[test]
    fn reserved_name_is_reported_before_flag_conflicts() {
        let options = LockOptions {
            steal: true,
            if_available: true,
            ..LockOptions::default()
        };
        assert!(matches!(
            validate("-x", &options),
            Err(LockError::ReservedName(_))
        ));
    }

    #[test]
    fn consistent_options_pass_validation() {
        assert!(validate("r", &LockOptions::default()).is_ok());
        assert!(validate("r", &LockOptions::shared()).is_ok());
        let steal = LockOptions {
            steal: true,
            ..LockOptions::default()
        };
        assert!(validate("r", &steal).is_ok());
        let controller = AbortController::new();
        let with_signal = LockOptions {
            signal: Some(controller.signal()),
            ..LockOptions::default()
        };
        assert!(validate("r", &with_signal).is_ok());
    }

    #[test]
    fn request_off_any_environment_fails() {
        let result = request("r", LockOptions::default(), |_| CallbackOutcome::ready(()));
        assert!(matches!(result, Err(LockError::NoEnvironment)));
    }

    #[test]
    fn query_off_any_environment_fails() {
        assert!(matches!(query(), Err(LockError::NoEnvironment)));
    }
}
