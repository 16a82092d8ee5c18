//! Book-keeping records for granted locks and queued requests.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::environment::EnvironmentHandle;
use crate::error::LockError;
use crate::types::{LockCallback, Mode, Payload};

pub(crate) type WaitingSender = oneshot::Sender<Result<(), LockError>>;
pub(crate) type WaitingReceiver = oneshot::Receiver<Result<(), LockError>>;
pub(crate) type ReleasedSender = oneshot::Sender<Result<Payload, LockError>>;
pub(crate) type ReleasedReceiver = oneshot::Receiver<Result<Payload, LockError>>;

/// A granted lock.
///
/// Removed from the held table on release or steal; the settlement hook
/// keeps the record alive until the callback settles, so the record may
/// outlive its table entry.
pub(crate) struct HeldLock {
    name: String,
    mode: Mode,
    env: EnvironmentHandle,
    client_id: String,
    stolen: AtomicBool,
    released: Mutex<Option<ReleasedSender>>,
}

impl HeldLock {
    pub(crate) fn new(
        name: String,
        mode: Mode,
        env: EnvironmentHandle,
        client_id: String,
        released: ReleasedSender,
    ) -> Self {
        Self {
            name,
            mode,
            env,
            client_id,
            stolen: AtomicBool::new(false),
            released: Mutex::new(Some(released)),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn env(&self) -> &EnvironmentHandle {
        &self.env
    }

    pub(crate) fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn is_stolen(&self) -> bool {
        self.stolen.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stolen(&self) {
        self.stolen.store(true, Ordering::SeqCst);
    }

    /// Settle-once: the first caller gets the sender, later callers get
    /// `None`. Keeps the released channel from settling twice when a steal
    /// races the normal release path.
    pub(crate) fn take_released(&self) -> Option<ReleasedSender> {
        self.released.lock().take()
    }
}

/// A request parked on the pending FIFO.
pub(crate) struct LockRequest {
    pub(crate) name: String,
    pub(crate) mode: Mode,
    pub(crate) client_id: String,
    pub(crate) env: EnvironmentHandle,
    pub(crate) steal: bool,
    pub(crate) if_available: bool,
    pub(crate) callback: LockCallback,
    pub(crate) waiting: WaitingSender,
    pub(crate) released: ReleasedSender,
}
