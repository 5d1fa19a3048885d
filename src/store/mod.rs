//! Synchronized result stores shared by workers and the coordinator.
//!
//! Two variants share one contract: [`OrderedStore`] keyed by position and
//! [`KeyedStore`] keyed by identifier. Both guard all state with a single
//! mutex, signal a condition variable after each mutation, count chunked
//! values as one logical entry, and reject a second write to the same
//! position or key.

pub mod keyed;
pub mod ordered;
pub mod sync;

pub use keyed::{KeyedGuard, KeyedStore};
pub use ordered::{OrderedGuard, OrderedStore};
pub use sync::{CellGuard, SyncCell, WaitOutcome};

use crate::codec::ChunkedValue;
use crate::core::errors::Result;
use std::time::Duration;

pub(crate) enum Slot<T> {
    Inline(T),
    Chunked(ChunkedValue),
}

/// Where workers publish finished results.
///
/// The coordinator only needs the tally and a way to sleep until it moves;
/// `version`/`wait_for_change_since` let it wait without missing a change
/// that happened between its check and its sleep.
pub trait ResultSink<K, V>: Send + Sync {
    fn publish(&self, key: K, value: V, weight: u64) -> Result<()>;

    /// Sum of weights published so far and not yet popped
    fn tally(&self) -> u64;

    fn version(&self) -> u64;

    fn wait_for_change_since(&self, seen: u64, timeout: Duration) -> WaitOutcome;

    /// Interrupt every waiter, used when a run is aborted
    fn wake(&self) {}
}
