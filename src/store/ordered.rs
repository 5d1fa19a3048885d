use crate::codec::ChunkCodec;
use crate::core::errors::{PoolError, Result};
use crate::store::sync::{CellGuard, SyncCell, WaitOutcome};
use crate::store::{ResultSink, Slot};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

struct Entry<T> {
    slot: Slot<T>,
    weight: u64,
}

/// Entries keyed by position; the map keeps them sorted on insert.
pub struct OrderedState<T> {
    entries: BTreeMap<u64, Entry<T>>,
    tally: u64,
}

impl<T> OrderedState<T> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            tally: 0,
        }
    }

    fn insert(&mut self, position: u64, slot: Slot<T>, weight: u64) -> Result<()> {
        if self.entries.contains_key(&position) {
            return Err(PoolError::duplicate(position));
        }
        self.entries.insert(position, Entry { slot, weight });
        self.tally += weight;
        Ok(())
    }

    fn contiguous_run(&self) -> Vec<u64> {
        let mut run = Vec::new();
        let mut expected = None;
        for &position in self.entries.keys() {
            match expected {
                Some(next) if position != next => break,
                _ => {}
            }
            run.push(position);
            expected = position.checked_add(1);
            if expected.is_none() {
                break;
            }
        }
        run
    }

    fn take(&mut self, positions: &[u64]) -> Vec<Slot<T>> {
        let mut slots = Vec::with_capacity(positions.len());
        for position in positions {
            if let Some(entry) = self.entries.remove(position) {
                self.tally -= entry.weight;
                slots.push(entry.slot);
            }
        }
        slots
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Shared store reconstructing a stream in position order regardless of
/// which worker finished first.
///
/// Values whose serialized form exceeds the codec's part size are kept as a
/// framed fragment run under their position and count as one entry.
pub struct OrderedStore<T> {
    cell: Arc<SyncCell<OrderedState<T>>>,
    codec: ChunkCodec,
}

impl<T> Clone for OrderedStore<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            codec: self.codec,
        }
    }
}

impl<T> OrderedStore<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(codec: ChunkCodec) -> Self {
        Self {
            cell: Arc::new(SyncCell::new(OrderedState::new())),
            codec,
        }
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    fn prepare(&self, value: T) -> Result<Slot<T>> {
        if self.codec.needs_chunking(&value)? {
            let chunked = self.codec.encode(&value)?;
            debug!(parts = chunked.part_count(), "Routing oversized value through codec");
            Ok(Slot::Chunked(chunked))
        } else {
            Ok(Slot::Inline(value))
        }
    }

    fn open(&self, slot: Slot<T>) -> Result<T> {
        match slot {
            Slot::Inline(value) => Ok(value),
            Slot::Chunked(chunked) => self.codec.decode(chunked.fragments()),
        }
    }

    /// Store `value` at `position`. A position can be written once.
    pub fn put(&self, position: u64, value: T) -> Result<()> {
        self.put_weighted(position, value, 1)
    }

    /// Store `value` and count it as `weight` units in [`tally`](Self::tally)
    pub fn put_weighted(&self, position: u64, value: T, weight: u64) -> Result<()> {
        // encode outside the lock
        let slot = self.prepare(value)?;
        self.cell.mutate(|state| state.insert(position, slot, weight))
    }

    /// Remove and return the contiguous run starting at the lowest stored
    /// position, in position order.
    pub fn pop_ordered_run(&self) -> Result<Vec<T>> {
        let slots = self.cell.mutate(|state| {
            let run = state.contiguous_run();
            state.take(&run)
        });
        slots.into_iter().map(|slot| self.open(slot)).collect()
    }

    /// [`pop_ordered_run`](Self::pop_ordered_run) with every value flattened,
    /// for stores of chunked batches
    pub fn pop_ordered_run_flat<U>(&self) -> Result<Vec<U>>
    where
        T: IntoIterator<Item = U>,
    {
        Ok(self
            .pop_ordered_run()?
            .into_iter()
            .flat_map(IntoIterator::into_iter)
            .collect())
    }

    /// Remove every entry, returned in ascending position with gaps skipped
    pub fn pop_all_sorted(&self) -> Result<Vec<(u64, T)>> {
        let drained = self.cell.mutate(|state| {
            state.tally = 0;
            std::mem::take(&mut state.entries)
        });
        drained
            .into_iter()
            .map(|(position, entry)| Ok((position, self.open(entry.slot)?)))
            .collect()
    }

    /// Count of logical entries
    pub fn len(&self) -> usize {
        self.cell.read(|state| state.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of entry weights
    pub fn tally(&self) -> u64 {
        self.cell.read(|state| state.tally)
    }

    pub fn contains(&self, position: u64) -> bool {
        self.cell.read(|state| state.entries.contains_key(&position))
    }

    pub fn positions(&self) -> Vec<u64> {
        self.cell.read(|state| state.entries.keys().copied().collect())
    }

    /// Number of entries currently held as fragment runs
    pub fn chunked_len(&self) -> usize {
        self.cell.read(|state| {
            state
                .entries
                .values()
                .filter(|e| matches!(e.slot, Slot::Chunked(_)))
                .count()
        })
    }

    pub fn wait_for_change(&self, timeout: Duration) -> WaitOutcome {
        self.cell.wait_for_change(timeout)
    }

    /// Hold the store across several operations
    pub fn acquire(&self) -> OrderedGuard<'_, T> {
        OrderedGuard {
            store: self,
            guard: self.cell.acquire(),
        }
    }
}

/// Exclusive access to an [`OrderedStore`]
pub struct OrderedGuard<'a, T> {
    store: &'a OrderedStore<T>,
    guard: CellGuard<'a, OrderedState<T>>,
}

impl<'a, T> OrderedGuard<'a, T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn len(&self) -> usize {
        self.guard.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tally(&self) -> u64 {
        self.guard.data().tally
    }

    pub fn put(&mut self, position: u64, value: T) -> Result<()> {
        let slot = self.store.prepare(value)?;
        self.guard.mutate(|state| state.insert(position, slot, 1))
    }

    pub fn pop_ordered_run(&mut self) -> Result<Vec<T>> {
        let slots = self.guard.mutate(|state| {
            let run = state.contiguous_run();
            state.take(&run)
        });
        slots.into_iter().map(|slot| self.store.open(slot)).collect()
    }

    /// Release, wait, re-acquire
    pub fn wait_for_change(&mut self, timeout: Duration) -> WaitOutcome {
        self.guard.wait_for_change(timeout)
    }

    pub fn release(self) {}
}

impl<T> ResultSink<u64, T> for OrderedStore<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    fn publish(&self, key: u64, value: T, weight: u64) -> Result<()> {
        self.put_weighted(key, value, weight)
    }

    fn tally(&self) -> u64 {
        OrderedStore::tally(self)
    }

    fn version(&self) -> u64 {
        self.cell.version()
    }

    fn wait_for_change_since(&self, seen: u64, timeout: Duration) -> WaitOutcome {
        self.cell.wait_for_change_since(seen, timeout)
    }

    fn wake(&self) {
        self.cell.poke();
    }
}
