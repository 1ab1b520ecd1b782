use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};

const POLL_STEP: Duration = Duration::from_millis(50);

/// Cancellation handle shared between a pool, its tasks and the subprocesses
/// those tasks start. Children observe their parent; cancelling a child never
/// affects the parent.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<CancelToken>,
    // First observed reason wins, so a later deadline does not rewrite a cancel.
    reason: OnceLock<ErrorKind>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                parent: Some(self.clone()),
                ..Inner::default()
            }),
        }
    }

    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        let deadline = match self.deadline() {
            Some(parent) if parent < own => parent,
            _ => own,
        };
        Self {
            inner: Arc::new(Inner {
                deadline: Some(deadline),
                parent: Some(self.clone()),
                ..Inner::default()
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _ = self.inner.reason.set(ErrorKind::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.err().is_some()
    }

    /// `None` while live; otherwise why the token fired.
    pub fn err(&self) -> Option<Error> {
        if let Some(kind) = self.inner.reason.get() {
            return Some(error_for(*kind));
        }
        if let Some(parent) = self.inner.parent.as_ref()
            && let Some(e) = parent.err()
        {
            let _ = self.inner.reason.set(e.kind());
            return self.inner.reason.get().map(|k| error_for(*k));
        }
        if let Some(deadline) = self.inner.deadline
            && Instant::now() >= deadline
        {
            let _ = self.inner.reason.set(ErrorKind::DeadlineExceeded);
            return self.inner.reason.get().map(|k| error_for(*k));
        }
        None
    }

    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        let parent = self.inner.parent.as_ref().and_then(CancelToken::deadline);
        match (self.inner.deadline, parent) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Sleep for `dur`, returning early with the token's error if it fires.
    pub fn sleep(&self, dur: Duration) -> Result<()> {
        let until = Instant::now() + dur;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep(POLL_STEP.min(until - now));
        }
    }
}

fn error_for(kind: ErrorKind) -> Error {
    match kind {
        ErrorKind::DeadlineExceeded => Error::deadline_exceeded(),
        _ => Error::cancelled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_observes_parent_cancel() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert_eq!(child.err().map(|e| e.kind()), Some(ErrorKind::Cancelled));
    }

    #[test]
    fn cancelling_child_leaves_parent_live() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[test]
    fn deadline_fires_and_sticks() {
        let t = CancelToken::new().child_with_timeout(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(t.err().map(|e| e.kind()), Some(ErrorKind::DeadlineExceeded));
        t.cancel();
        assert_eq!(t.err().map(|e| e.kind()), Some(ErrorKind::DeadlineExceeded));
    }

    #[test]
    fn sleep_returns_early_on_cancel() {
        let t = CancelToken::new();
        let t2 = t.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            t2.cancel();
        });
        let start = Instant::now();
        let err = t.sleep(Duration::from_secs(10)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(5));
        h.join().expect("join");
    }
}
