//! One-shot abort signalling for pending lock requests.
//!
//! An [`AbortController`] owns the abort side; the [`AbortSignal`] it hands
//! out is observed by requests. Aborting fires every registered listener
//! exactly once with the optional reason; listeners registered after the
//! fact fire immediately.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{Payload, payload};

type Listener = Box<dyn FnOnce(Option<Payload>) + Send + 'static>;

#[derive(Default)]
struct SignalState {
    aborted: bool,
    reason: Option<Payload>,
    next_listener_id: u64,
    listeners: Vec<(u64, Listener)>,
}

/// Observable side of an [`AbortController`].
#[derive(Clone, Default)]
pub struct AbortSignal {
    state: Arc<Mutex<SignalState>>,
}

impl AbortSignal {
    /// Whether the paired controller has aborted.
    #[must_use]
    pub fn aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Reason passed to the abort, if any.
    #[must_use]
    pub fn reason(&self) -> Option<Payload> {
        self.state.lock().reason.clone()
    }

    /// Register a one-shot listener.
    ///
    /// Fires immediately when the signal has already aborted. The returned
    /// registration detaches the listener if it has not fired yet.
    pub fn on_abort(
        &self,
        listener: impl FnOnce(Option<Payload>) + Send + 'static,
    ) -> AbortRegistration {
        let mut state = self.state.lock();
        if state.aborted {
            let reason = state.reason.clone();
            drop(state);
            listener(reason);
            // Id 0 is never assigned, so removal is a no-op.
            return AbortRegistration {
                signal: self.clone(),
                id: 0,
            };
        }
        state.next_listener_id += 1;
        let id = state.next_listener_id;
        state.listeners.push((id, Box::new(listener)));
        AbortRegistration {
            signal: self.clone(),
            id,
        }
    }

    fn fire(&self, reason: Option<Payload>) {
        let drained = {
            let mut state = self.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.reason = reason.clone();
            std::mem::take(&mut state.listeners)
        };
        for (_, listener) in drained {
            listener(reason.clone());
        }
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.aborted())
            .finish()
    }
}

/// Handle for detaching a listener registered with [`AbortSignal::on_abort`].
pub struct AbortRegistration {
    signal: AbortSignal,
    id: u64,
}

impl AbortRegistration {
    /// Detach the listener if it has not fired.
    pub fn remove(self) {
        self.signal
            .state
            .lock()
            .listeners
            .retain(|(id, _)| *id != self.id);
    }
}

/// Owning side of the pair; aborts the signal at most once.
#[derive(Debug, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The signal observed by requests.
    #[must_use]
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort without a reason.
    pub fn abort(&self) {
        self.signal.fire(None);
    }

    /// Abort with a reason surfaced to cancelled requests.
    pub fn abort_with(&self, reason: impl Any + Send + Sync) {
        self.signal.fire(Some(payload(reason)));
    }
}
