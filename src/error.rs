//! Error type surfaced by lock requests.

use std::fmt;

use thiserror::Error;

use crate::types::Payload;

/// Errors produced by the request front-end and the lock manager.
///
/// Validation failures (`ReservedName`, `StealWithIfAvailable`,
/// `StealRequiresExclusive`, `SignalNotAllowed`, `UnknownMode`) are returned
/// synchronously from [`request`](crate::request()); everything else arrives
/// through the returned future.
#[derive(Error)]
pub enum LockError {
    /// Names starting with `-` are reserved for the host runtime.
    #[error("resource names must not start with '-': {0:?}")]
    ReservedName(String),

    /// `if_available` and `steal` cannot be combined on one request.
    #[error("the ifAvailable and steal options cannot be used together")]
    StealWithIfAvailable,

    /// `steal` is only meaningful for exclusive requests.
    #[error("the steal option requires exclusive mode")]
    StealRequiresExclusive,

    /// An abort signal cannot be combined with `steal` or `if_available`.
    #[error("an abort signal cannot be combined with the steal or ifAvailable options")]
    SignalNotAllowed,

    /// A mode string was neither `shared` nor `exclusive`.
    #[error("unknown lock mode: {0:?}")]
    UnknownMode(String),

    /// The caller is not running on an environment's run loop.
    #[error("lock requests must be made from an environment thread")]
    NoEnvironment,

    /// The request was cancelled before its callback began, or the holder
    /// was preempted by a steal.
    #[error("the lock request was aborted")]
    Aborted {
        /// Reason carried by the abort signal, when one was given.
        reason: Option<Payload>,
    },

    /// Internal sentinel: the holder was preempted by a steal request.
    /// Rewritten to [`LockError::Aborted`] before it reaches callers.
    #[doc(hidden)]
    #[error("lock stolen by a competing request")]
    Stolen,

    /// The callback failed; its payload is propagated verbatim.
    #[error("the lock callback failed")]
    Callback(Payload),
}

impl LockError {
    /// True for any cancellation surfaced to the caller.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// The stolen sentinel never crosses the public boundary.
    pub(crate) fn into_public(self) -> Self {
        match self {
            Self::Stolen => Self::Aborted { reason: None },
            other => other,
        }
    }
}

// Hand-written because payloads are opaque to the manager.
impl fmt::Debug for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReservedName(name) => f.debug_tuple("ReservedName").field(name).finish(),
            Self::StealWithIfAvailable => f.write_str("StealWithIfAvailable"),
            Self::StealRequiresExclusive => f.write_str("StealRequiresExclusive"),
            Self::SignalNotAllowed => f.write_str("SignalNotAllowed"),
            Self::UnknownMode(mode) => f.debug_tuple("UnknownMode").field(mode).finish(),
            Self::NoEnvironment => f.write_str("NoEnvironment"),
            Self::Aborted { reason } => f
                .debug_struct("Aborted")
                .field("reason", &reason.as_ref().map(|_| "<payload>"))
                .finish(),
            Self::Stolen => f.write_str("Stolen"),
            Self::Callback(_) => f.debug_tuple("Callback").field(&"<payload>").finish(),
        }
    }
}
