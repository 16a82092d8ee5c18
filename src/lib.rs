//! weblocks - Web Locks arbitration for multi-environment host runtimes
//!
//! Cooperating worker environments (isolated contexts sharing one process)
//! request named, mode-qualified locks over string-identified resources. A
//! request carries a callback that runs on the requesting environment's run
//! loop while the lock is held; the lock is released when the callback (or
//! the future it returns) settles. The process-wide [`LockManager`]
//! arbitrates requests across environments with FIFO-per-resource ordering
//! and shared/exclusive compatibility, and supports preemption (`steal`),
//! non-blocking tries (`if_available`), abort-signal cancellation, and a
//! snapshot query.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use weblocks::{CallbackOutcome, Environment, LockOptions};
//!
//! let env = Environment::spawn("worker-1")?;
//! let (tx, rx) = std::sync::mpsc::channel();
//! env.post(move || {
//!     let fut = weblocks::request("state", LockOptions::default(), |lock| {
//!         let lock = lock.expect("granted");
//!         assert_eq!(lock.name(), "state");
//!         CallbackOutcome::ready("updated")
//!     });
//!     let _ = tx.send(fut);
//! });
//! let fut = rx.recv().unwrap().unwrap();
//! let value = futures::executor::block_on(fut).unwrap();
//! assert_eq!(value.downcast_ref::<&str>(), Some(&"updated"));
//! env.shutdown();
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod abort;
pub mod environment;
pub mod error;
pub mod manager;
pub mod request;
pub mod types;

pub use abort::{AbortController, AbortRegistration, AbortSignal};
pub use environment::{Environment, EnvironmentHandle};
pub use error::LockError;
pub use manager::LockManager;
pub use request::{LockFuture, LockOptions, RESERVED_PREFIX, query, request};
pub use types::{
    CallbackOutcome, CallbackResult, Lock, LockCallback, LockInfo, LockSnapshot, Mode, Payload,
    payload,
};
