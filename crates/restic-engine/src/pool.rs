use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use tracing::error;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

// Tokens cannot wake a condvar, so blocked callers re-check them this often.
const WAKE_INTERVAL: Duration = Duration::from_millis(20);

/// A task panic turned into a value for the pool's panic handler.
#[derive(Debug, Clone)]
pub struct RecoveredPanic {
    pub message: String,
}

impl RecoveredPanic {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self { message }
    }
}

pub type PanicHandler = Arc<dyn Fn(&RecoveredPanic, &CancelToken) + Send + Sync>;

#[derive(Clone)]
pub struct PoolOptions {
    pub concurrency: usize,
    pub timeout: Option<Duration>,
    pub panic_handler: Option<PanicHandler>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            timeout: None,
            panic_handler: None,
        }
    }
}

impl PoolOptions {
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    pub fn timeout(mut self, t: Duration) -> Self {
        self.timeout = Some(t);
        self
    }

    pub fn panic_handler(
        mut self,
        f: impl Fn(&RecoveredPanic, &CancelToken) + Send + Sync + 'static,
    ) -> Self {
        self.panic_handler = Some(Arc::new(f));
        self
    }
}

fn log_panic(p: &RecoveredPanic, _cancel: &CancelToken) {
    error!(panic = %p.message, "recovered panic in pool task");
}

#[derive(Default)]
struct Shared {
    active: Mutex<usize>,
    changed: Condvar,
    first_error: Mutex<Option<Error>>,
    completed: AtomicUsize,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, usize> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// Releases the slot even if the panic handler itself panics.
struct Slot(Arc<Shared>);

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.completed.fetch_add(1, Ordering::SeqCst);
        let mut active = self.0.active();
        *active = active.saturating_sub(1);
        self.0.changed.notify_all();
    }
}

/// Runs independent tasks on at most `concurrency` threads. The first task
/// error cancels the pool; once cancelled, no further task is admitted.
pub struct WorkerPool {
    limit: usize,
    cancel: CancelToken,
    handler: PanicHandler,
    shared: Arc<Shared>,
}

impl WorkerPool {
    pub fn new(parent: &CancelToken, opts: PoolOptions) -> Self {
        let cancel = match opts.timeout {
            Some(t) => parent.child_with_timeout(t),
            None => parent.child(),
        };
        Self {
            limit: opts.concurrency.max(1),
            cancel,
            handler: opts
                .panic_handler
                .unwrap_or_else(|| Arc::new(log_panic) as PanicHandler),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Token observed by tasks; fires on first error, cancel or timeout.
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Block until a slot is free, then start `task`. Returns `false` and
    /// drops the task when the pool is cancelled first.
    pub fn run<F>(&self, task: F) -> bool
    where
        F: FnOnce(CancelToken) -> Result<()> + Send + 'static,
    {
        let mut active = self.shared.active();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if *active < self.limit {
                break;
            }
            active = self
                .shared
                .changed
                .wait_timeout(active, WAKE_INTERVAL)
                .map(|(g, _)| g)
                .unwrap_or_else(|p| p.into_inner().0);
        }
        *active += 1;
        drop(active);

        let slot = Slot(Arc::clone(&self.shared));
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let handler = Arc::clone(&self.handler);
        std::thread::spawn(move || {
            let _slot = slot;
            let token = cancel.clone();
            match catch_unwind(AssertUnwindSafe(move || task(token))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let mut first = shared
                        .first_error
                        .lock()
                        .unwrap_or_else(|p| p.into_inner());
                    if first.is_none() {
                        *first = Some(e);
                        drop(first);
                        cancel.cancel();
                    }
                }
                Err(payload) => handler(&RecoveredPanic::from_payload(payload), &cancel),
            }
        });
        true
    }

    /// Wait for every admitted task, or until the pool is cancelled or times
    /// out. A captured task error takes precedence over the token's error;
    /// a pool that was cancelled never reports success.
    pub fn wait(&self) -> Result<()> {
        let mut active = self.shared.active();
        loop {
            if *active == 0 || self.cancel.is_cancelled() {
                break;
            }
            active = self
                .shared
                .changed
                .wait_timeout(active, WAKE_INTERVAL)
                .map(|(g, _)| g)
                .unwrap_or_else(|p| p.into_inner().0);
        }
        drop(active);

        let first = self
            .shared
            .first_error
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        if let Some(e) = first {
            return Err(e);
        }
        self.cancel.check()
    }

    /// Tasks that returned, failed or panicked so far.
    pub fn completed(&self) -> usize {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        self.shared.changed.notify_all();
    }
}
