use crate::codec::{ChunkCodec, Fragment};
use crate::core::errors::{PoolError, Result};
use crate::store::sync::{CellGuard, SyncCell, WaitOutcome};
use crate::store::ResultSink;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

type BlockId = u64;

#[derive(Debug)]
enum KeyedSlot<V> {
    Inline(V),
    /// Ordered ids of the fragments in the block table
    Blocks(Vec<BlockId>),
}

#[derive(Debug)]
struct Entry<V> {
    slot: KeyedSlot<V>,
    weight: u64,
}

/// Entries by key plus a block table holding the fragments of oversized ones
#[derive(Debug)]
pub struct KeyedState<K, V> {
    entries: HashMap<K, Entry<V>>,
    blocks: HashMap<BlockId, Fragment>,
    next_block: BlockId,
    tally: u64,
}

enum Prepared<V> {
    Inline(V),
    Fragments(Vec<Fragment>),
}

impl<K: Eq + Hash, V> KeyedState<K, V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            blocks: HashMap::new(),
            next_block: 0,
            tally: 0,
        }
    }

    fn store_blocks(&mut self, fragments: Vec<Fragment>) -> Vec<BlockId> {
        fragments
            .into_iter()
            .map(|fragment| {
                let id = self.next_block;
                self.next_block += 1;
                self.blocks.insert(id, fragment);
                id
            })
            .collect()
    }

    fn insert(&mut self, key: K, prepared: Prepared<V>, weight: u64) {
        let slot = match prepared {
            Prepared::Inline(value) => KeyedSlot::Inline(value),
            Prepared::Fragments(fragments) => KeyedSlot::Blocks(self.store_blocks(fragments)),
        };
        self.entries.insert(key, Entry { slot, weight });
        self.tally += weight;
    }

    /// Remove an entry together with every block it owns
    fn remove(&mut self, key: &K) -> Option<Prepared<V>> {
        let entry = self.entries.remove(key)?;
        self.tally -= entry.weight;
        Some(match entry.slot {
            KeyedSlot::Inline(value) => Prepared::Inline(value),
            KeyedSlot::Blocks(ids) => Prepared::Fragments(
                ids.iter().filter_map(|id| self.blocks.remove(id)).collect(),
            ),
        })
    }

    fn fragments_of(&self, ids: &[BlockId]) -> Vec<Fragment> {
        ids.iter()
            .filter_map(|id| self.blocks.get(id).cloned())
            .collect()
    }
}

/// Shared store for results whose order is irrelevant: trained models,
/// fitted vectorizers, per-classifier weight vectors.
#[derive(Debug)]
pub struct KeyedStore<K, V> {
    cell: Arc<SyncCell<KeyedState<K, V>>>,
    codec: ChunkCodec,
}

impl<K, V> Clone for KeyedStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            codec: self.codec,
        }
    }
}

impl<K, V> KeyedStore<K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Serialize + DeserializeOwned,
{
    pub fn new(codec: ChunkCodec) -> Self {
        Self {
            cell: Arc::new(SyncCell::new(KeyedState::new())),
            codec,
        }
    }

    fn prepare(&self, value: V) -> Result<Prepared<V>> {
        if self.codec.needs_chunking(&value)? {
            let chunked = self.codec.encode(&value)?;
            debug!(parts = chunked.part_count(), "Splitting oversized value into blocks");
            Ok(Prepared::Fragments(chunked.into_fragments()))
        } else {
            Ok(Prepared::Inline(value))
        }
    }

    fn open(&self, prepared: Prepared<V>) -> Result<V> {
        match prepared {
            Prepared::Inline(value) => Ok(value),
            Prepared::Fragments(fragments) => self.codec.decode(&fragments),
        }
    }

    /// Store `value` under `key`. A key can be written once; use
    /// [`replace`](Self::replace) to overwrite.
    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.put_weighted(key, value, 1)
    }

    pub fn put_weighted(&self, key: K, value: V, weight: u64) -> Result<()> {
        let prepared = self.prepare(value)?;
        self.cell.mutate(|state| {
            if state.entries.contains_key(&key) {
                return Err(PoolError::duplicate(format!("{:?}", key)));
            }
            state.insert(key, prepared, weight);
            Ok(())
        })
    }

    /// Overwrite `key`, dropping the blocks of any previous value first.
    /// Returns whether a previous value existed.
    pub fn replace(&self, key: K, value: V) -> Result<bool> {
        let prepared = self.prepare(value)?;
        Ok(self.cell.mutate(|state| {
            let existed = state.remove(&key).is_some();
            state.insert(key, prepared, 1);
            existed
        }))
    }

    pub fn get(&self, key: &K) -> Result<Option<V>>
    where
        V: Clone,
    {
        let prepared = self.cell.read(|state| {
            state.entries.get(key).map(|entry| match &entry.slot {
                KeyedSlot::Inline(value) => Prepared::Inline(value.clone()),
                KeyedSlot::Blocks(ids) => Prepared::Fragments(state.fragments_of(ids)),
            })
        });
        prepared.map(|p| self.open(p)).transpose()
    }

    /// Remove `key` and all its fragments. Returns whether it existed.
    pub fn delete(&self, key: &K) -> bool {
        self.cell.mutate(|state| state.remove(key).is_some())
    }

    /// Remove and return the value under `key`
    pub fn pop(&self, key: &K) -> Result<Option<V>> {
        self.cell
            .mutate(|state| state.remove(key))
            .map(|p| self.open(p))
            .transpose()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cell.read(|state| state.entries.contains_key(key))
    }

    pub fn keys(&self) -> Vec<K> {
        self.cell.read(|state| state.entries.keys().cloned().collect())
    }

    pub fn values(&self) -> Result<Vec<V>>
    where
        V: Clone,
    {
        let prepared: Vec<Prepared<V>> = self.cell.read(|state| {
            state
                .entries
                .values()
                .map(|entry| match &entry.slot {
                    KeyedSlot::Inline(value) => Prepared::Inline(value.clone()),
                    KeyedSlot::Blocks(ids) => Prepared::Fragments(state.fragments_of(ids)),
                })
                .collect()
        });
        prepared.into_iter().map(|p| self.open(p)).collect()
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Result<Vec<(K, V)>> {
        let drained: Vec<(K, Prepared<V>)> = self.cell.mutate(|state| {
            let keys: Vec<K> = state.entries.keys().cloned().collect();
            keys.into_iter()
                .filter_map(|k| state.remove(&k).map(|p| (k, p)))
                .collect()
        });
        drained
            .into_iter()
            .map(|(k, p)| Ok((k, self.open(p)?)))
            .collect()
    }

    /// Count of logical entries
    pub fn len(&self) -> usize {
        self.cell.read(|state| state.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tally(&self) -> u64 {
        self.cell.read(|state| state.tally)
    }

    /// Fragments currently held in the block table, markers included
    pub fn block_count(&self) -> usize {
        self.cell.read(|state| state.blocks.len())
    }

    pub fn wait_for_change(&self, timeout: Duration) -> WaitOutcome {
        self.cell.wait_for_change(timeout)
    }

    pub fn acquire(&self) -> KeyedGuard<'_, K, V> {
        KeyedGuard {
            store: self,
            guard: self.cell.acquire(),
        }
    }
}

/// Exclusive access to a [`KeyedStore`]
pub struct KeyedGuard<'a, K, V> {
    store: &'a KeyedStore<K, V>,
    guard: CellGuard<'a, KeyedState<K, V>>,
}

impl<'a, K, V> KeyedGuard<'a, K, V>
where
    K: Eq + Hash + Clone + Debug,
    V: Serialize + DeserializeOwned,
{
    pub fn len(&self) -> usize {
        self.guard.data().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tally(&self) -> u64 {
        self.guard.data().tally
    }

    pub fn contains(&self, key: &K) -> bool {
        self.guard.data().entries.contains_key(key)
    }

    pub fn put(&mut self, key: K, value: V) -> Result<()> {
        let prepared = self.store.prepare(value)?;
        self.guard.mutate(|state| {
            if state.entries.contains_key(&key) {
                return Err(PoolError::duplicate(format!("{:?}", key)));
            }
            state.insert(key, prepared, 1);
            Ok(())
        })
    }

    pub fn pop(&mut self, key: &K) -> Result<Option<V>> {
        let prepared = self.guard.mutate(|state| state.remove(key));
        prepared.map(|p| self.store.open(p)).transpose()
    }

    pub fn wait_for_change(&mut self, timeout: Duration) -> WaitOutcome {
        self.guard.wait_for_change(timeout)
    }

    pub fn release(self) {}
}

impl<K, V> ResultSink<K, V> for KeyedStore<K, V>
where
    K: Eq + Hash + Clone + Debug + Send,
    V: Serialize + DeserializeOwned + Send,
{
    fn publish(&self, key: K, value: V, weight: u64) -> Result<()> {
        self.put_weighted(key, value, weight)
    }

    fn tally(&self) -> u64 {
        KeyedStore::tally(self)
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
