//! Shared abort channel.
//!
//! The presence of a signal, not its content, is the abort trigger. The first
//! failure raised is kept so the coordinator can surface the real cause.

use crate::core::errors::{PoolError, Result};
use chrono::{DateTime, Utc};
use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};

/// Who failed, on what, and when
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSignal {
    pub worker: String,
    pub task: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

struct Failure {
    signal: ErrorSignal,
    error: PoolError,
}

type Waker = Box<dyn Fn() + Send + Sync>;

/// Registration handle returned by [`ErrorBoard::on_raise`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WakerId(u64);

struct BoardInner {
    raised: AtomicBool,
    tx: Sender<Failure>,
    rx: Receiver<Failure>,
    wakers: Mutex<Vec<(WakerId, Waker)>>,
    next_waker: AtomicU64,
}

/// Cloneable handle to one run's abort channel
#[derive(Clone)]
pub struct ErrorBoard {
    inner: Arc<BoardInner>,
}

impl fmt::Debug for ErrorBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorBoard")
            .field("raised", &self.is_raised())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Default for ErrorBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorBoard {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(BoardInner {
                raised: AtomicBool::new(false),
                tx,
                rx,
                wakers: Mutex::new(Vec::new()),
                next_waker: AtomicU64::new(0),
            }),
        }
    }

    /// Post a failure and wake everything registered with
    /// [`on_raise`](Self::on_raise)
    pub fn raise(&self, worker: &str, task: &str, error: PoolError) {
        let signal = ErrorSignal {
            worker: worker.to_string(),
            task: task.to_string(),
            message: error.to_string(),
            raised_at: Utc::now(),
        };
        error!(
            worker = %signal.worker,
            task = %signal.task,
            category = error.category(),
            "Raising error board: {:?}",
            error
        );
        // the board owns its receiver, so the send cannot fail
        let _ = self.inner.tx.send(Failure { signal, error });
        let first = !self.inner.raised.swap(true, Ordering::AcqRel);
        if first {
            for (_, wake) in self.inner.wakers.lock().iter() {
                wake();
            }
        }
    }

    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::Acquire)
    }

    /// `Err(Aborted)` once the board is raised; does not consume the signal
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(PoolError::aborted("error board raised by a sibling"))
        } else {
            Ok(())
        }
    }

    /// Consume the first pending failure.
    ///
    /// The board stays raised afterwards; consuming the signal only hands
    /// its cause to one observer.
    pub fn take(&self) -> Option<(ErrorSignal, PoolError)> {
        self.inner
            .rx
            .try_recv()
            .ok()
            .map(|failure| (failure.signal, failure.error))
    }

    /// Consume the cause if still pending, otherwise report a plain abort
    pub fn take_error(&self) -> PoolError {
        match self.take() {
            Some((signal, error)) => {
                warn!(
                    worker = %signal.worker,
                    task = %signal.task,
                    "Abandoning run after failure"
                );
                error
            }
            None => PoolError::aborted("error board raised"),
        }
    }

    /// Number of failures posted and not yet consumed
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    /// Run `wake` when the board is first raised, or right away if it
    /// already is.
    ///
    /// The waker stays registered until [`remove_waker`](Self::remove_waker)
    /// is called with the returned id.
    pub fn on_raise(&self, wake: impl Fn() + Send + Sync + 'static) -> WakerId {
        let id = WakerId(self.inner.next_waker.fetch_add(1, Ordering::Relaxed));
        let mut wakers = self.inner.wakers.lock();
        if self.is_raised() {
            wake();
        }
        wakers.push((id, Box::new(wake)));
        id
    }

    /// Deregister a waker; returns whether it was still registered
    pub fn remove_waker(&self, id: WakerId) -> bool {
        let mut wakers = self.inner.wakers.lock();
        let before = wakers.len();
        wakers.retain(|(registered, _)| *registered != id);
        wakers.len() != before
    }

    pub fn waker_count(&self) -> usize {
        self.inner.wakers.lock().len()
    }
}
