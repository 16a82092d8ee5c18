//! Worker environments: single-threaded run loops that host lock callbacks.
//!
//! Every lock request is made from an environment thread and its callback
//! runs there. The manager coordinates environments from any thread by
//! posting tasks onto their run loops through [`EnvironmentHandle::post`].

use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::LocalSet;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;
type CleanupHook = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ENVIRONMENT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<EnvironmentHandle>> = const { RefCell::new(None) };
}

struct Shared {
    id: u64,
    name: String,
    client_id: String,
    tasks: mpsc::UnboundedSender<Task>,
    stopping: AtomicBool,
    cleanup_hooks: Mutex<Vec<CleanupHook>>,
}

/// Cheap cross-thread handle to a running environment.
///
/// Identity is the environment, not the handle: clones compare equal.
#[derive(Clone)]
pub struct EnvironmentHandle {
    shared: Arc<Shared>,
}

impl EnvironmentHandle {
    /// Handle of the environment whose run loop is executing the caller.
    #[must_use]
    pub fn current() -> Option<EnvironmentHandle> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Unique id of this environment within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Name given at spawn time; also the thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Opaque identifier surfaced in query snapshots.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    /// Whether the environment has begun shutting down.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    /// Post a task onto the environment's run loop from any thread.
    ///
    /// Best-effort: returns `false` once the environment is stopping or its
    /// loop has exited.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if self.is_stopping() {
            return false;
        }
        self.shared.tasks.send(Box::new(task)).is_ok()
    }

    /// Run `hook` after the run loop stops, before the thread exits.
    pub(crate) fn add_cleanup_hook(&self, hook: impl FnOnce() + Send + 'static) {
        self.shared.cleanup_hooks.lock().push(Box::new(hook));
    }
}

impl PartialEq for EnvironmentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for EnvironmentHandle {}

impl Hash for EnvironmentHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.shared.id.hash(state);
    }
}

impl fmt::Debug for EnvironmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

/// An owned environment. Shutting down (or dropping) stops the run loop,
/// cancels callbacks still in flight, runs cleanup hooks, and joins the
/// thread.
pub struct Environment {
    handle: EnvironmentHandle,
    thread: Option<JoinHandle<()>>,
}

impl Environment {
    /// Spawn an environment thread with its own single-threaded run loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or the thread cannot be created.
    pub fn spawn(name: impl Into<String>) -> io::Result<Environment> {
        let name = name.into();
        let id = NEXT_ENVIRONMENT_ID.fetch_add(1, Ordering::Relaxed);
        let (tasks, mut queue) = mpsc::unbounded_channel::<Task>();
        let handle = EnvironmentHandle {
            shared: Arc::new(Shared {
                id,
                name: name.clone(),
                client_id: format!("{}-{}", process::id(), id),
                tasks,
                stopping: AtomicBool::new(false),
                cleanup_hooks: Mutex::new(Vec::new()),
            }),
        };

        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let loop_handle = handle.clone();
        let thread = thread::Builder::new().name(name).spawn(move || {
            debug!(environment = %loop_handle.name(), "environment started");
            CURRENT.with(|current| *current.borrow_mut() = Some(loop_handle.clone()));

            let local = LocalSet::new();
            local.block_on(&runtime, async {
                while let Some(task) = queue.recv().await {
                    task();
                    if loop_handle.is_stopping() {
                        break;
                    }
                }
            });
            // Cancel callbacks still in flight before the cleanup hooks drop
            // this environment's locks and requests.
            drop(local);

            let hooks: Vec<CleanupHook> = {
                let mut hooks = loop_handle.shared.cleanup_hooks.lock();
                hooks.drain(..).collect()
            };
            for hook in hooks {
                hook();
            }

            CURRENT.with(|current| current.borrow_mut().take());
            debug!(environment = %loop_handle.name(), "environment stopped");
        })?;

        Ok(Environment {
            handle,
            thread: Some(thread),
        })
    }

    /// Cross-thread handle to this environment.
    #[must_use]
    pub fn handle(&self) -> EnvironmentHandle {
        self.handle.clone()
    }

    /// Post a task onto this environment's run loop.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.handle.post(task)
    }

    /// Stop the run loop, run cleanup hooks, and join the thread.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.shared.stopping.store(true, Ordering::SeqCst);
        // Nudge the loop so it observes the stop flag even when idle.
        let _ = self.handle.shared.tasks.send(Box::new(|| {}));
        let _ = thread.join();
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("handle", &self.handle)
            .finish()
    }
}
