//! Core types shared between the lock manager and the request front-end.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Compatibility class of a lock request.
///
/// Shared locks coexist with other shared locks on the same resource;
/// an exclusive lock excludes every other holder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Shared,
    #[default]
    Exclusive,
}

impl Mode {
    /// Returns the string representation of the mode
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(Self::Shared),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(LockError::UnknownMode(other.to_string())),
        }
    }
}

/// Opaque value produced (or thrown) by a lock callback.
///
/// The manager never inspects payloads; callers downcast on the receiving
/// side, the same way panic payloads are handled.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Wrap a concrete value as an opaque callback payload.
#[must_use]
pub fn payload<T: Any + Send + Sync>(value: T) -> Payload {
    Arc::new(value)
}

/// Result a callback settles with: the value it produced, or the value it
/// failed with.
pub type CallbackResult = Result<Payload, Payload>;

/// A granted lock as observed by its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    name: String,
    mode: Mode,
}

impl Lock {
    pub(crate) fn new(name: String, mode: Mode) -> Self {
        Self { name, mode }
    }

    /// Resource name the lock covers.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compatibility class the lock was granted with.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }
}

/// What a lock callback hands back to the manager.
pub enum CallbackOutcome {
    /// The callback finished synchronously.
    Ready(CallbackResult),
    /// The callback produced a future; the lock stays held until it settles.
    /// The future runs on the owning environment's loop and need not be
    /// `Send`.
    Pending(LocalBoxFuture<'static, CallbackResult>),
}

impl CallbackOutcome {
    /// A synchronously produced value.
    #[must_use]
    pub fn ready<T: Any + Send + Sync>(value: T) -> Self {
        Self::Ready(Ok(payload(value)))
    }

    /// A synchronous failure; the payload reaches the requester verbatim.
    #[must_use]
    pub fn failed<T: Any + Send + Sync>(error: T) -> Self {
        Self::Ready(Err(payload(error)))
    }

    /// Hold the lock until `future` settles.
    #[must_use]
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = CallbackResult> + 'static,
    {
        Self::Pending(Box::pin(future))
    }
}

/// User callback invoked while the lock is held.
///
/// Receives `None` when an `if_available` request missed. The callback must
/// be `Send` (requests are parked on a process-wide queue) but always runs on
/// the thread of the environment that made the request.
pub type LockCallback = Box<dyn FnOnce(Option<Lock>) -> CallbackOutcome + Send + 'static>;

/// One entry of a [`LockSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    /// Resource name.
    pub name: String,
    /// Compatibility class.
    pub mode: Mode,
    /// Opaque identifier of the owning environment.
    pub client_id: String,
}

/// Point-in-time view of one environment's held locks and pending requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSnapshot {
    /// Granted locks, in grant order per resource.
    pub held: Vec<LockInfo>,
    /// Queued requests, in submission order.
    pub pending: Vec<LockInfo>,
}
