//! Unbounded task channel with an end-of-work signal.
//!
//! Two ways to say "no more work" are supported: sentinel tokens, one per
//! consumer, and closing the queue, which behaves like an endless supply of
//! sentinels once the remaining tasks are drained. The coordinator closes.

use crate::core::errors::{PoolError, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A unit of work: a position or key plus an opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<K, P> {
    pub key: K,
    pub payload: P,
}

impl<K, P> Task<K, P> {
    pub fn new(key: K, payload: P) -> Self {
        Self { key, payload }
    }
}

impl<K: fmt::Debug, P> fmt::Display for Task<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.key)
    }
}

enum Envelope<T> {
    Task(T),
    Sentinel,
}

/// Result of one fetch
#[derive(Debug, PartialEq, Eq)]
pub enum Fetched<T> {
    Task(T),
    /// A sentinel was dequeued, or the queue is closed and drained
    Sentinel,
    /// Nothing arrived within the probe timeout
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    /// Wait until a task or sentinel arrives
    Blocking,
    /// Wait at most this long; `Duration::ZERO` never blocks
    Probe(Duration),
}

struct QueueInner<T> {
    tx: Mutex<Option<Sender<Envelope<T>>>>,
    rx: Receiver<Envelope<T>>,
    submitted: AtomicU64,
}

/// Cloneable handle; every clone feeds from the same channel
pub struct TaskQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            inner: Arc::new(QueueInner {
                tx: Mutex::new(Some(tx)),
                rx,
                submitted: AtomicU64::new(0),
            }),
        }
    }

    fn send(&self, envelope: Envelope<T>) -> Result<()> {
        let tx = self.inner.tx.lock();
        match tx.as_ref() {
            // the queue owns a receiver, so the send itself cannot fail
            Some(tx) => tx.send(envelope).map_err(|_| PoolError::QueueClosed),
            None => Err(PoolError::QueueClosed),
        }
    }

    pub fn push(&self, task: T) -> Result<()> {
        self.send(Envelope::Task(task))?;
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue one sentinel per consumer that must stop
    pub fn push_sentinels(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.send(Envelope::Sentinel)?;
        }
        Ok(())
    }

    /// Refuse further pushes; consumers see `Sentinel` once the queue drains
    pub fn close(&self) {
        self.inner.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    pub fn fetch(&self, mode: FetchMode) -> Fetched<T> {
        let received = match mode {
            FetchMode::Blocking => self.inner.rx.recv().ok(),
            FetchMode::Probe(timeout) if timeout.is_zero() => match self.inner.rx.try_recv() {
                Ok(envelope) => Some(envelope),
                Err(TryRecvError::Empty) => return Fetched::Empty,
                Err(TryRecvError::Disconnected) => None,
            },
            FetchMode::Probe(timeout) => match self.inner.rx.recv_timeout(timeout) {
                Ok(envelope) => Some(envelope),
                Err(RecvTimeoutError::Timeout) => return Fetched::Empty,
                Err(RecvTimeoutError::Disconnected) => None,
            },
        };
        match received {
            Some(Envelope::Task(task)) => Fetched::Task(task),
            Some(Envelope::Sentinel) | None => Fetched::Sentinel,
        }
    }

    /// Discard everything still queued; returns how many tasks were dropped
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while let Ok(envelope) = self.inner.rx.try_recv() {
            if matches!(envelope, Envelope::Task(_)) {
                dropped += 1;
            }
        }
        dropped
    }

    /// Tasks and sentinels currently queued
    pub fn len(&self) -> usize {
        self.inner.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rx.is_empty()
    }

    /// Tasks accepted since creation
    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }
}
