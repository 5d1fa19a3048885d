//! Ordered document cache.
//!
//! Documents finish in any order but leave in strictly increasing index
//! order. A producer registers the indices it will eventually deliver with
//! [`OrderedDocumentCache::wait_for`]; indices never registered are gaps and
//! are written as a blank filler once a higher index goes out. Only
//! registered documents are cached, so empty lines cost nothing.
//!
//! Documents too large to keep around take the direct path:
//! [`OrderedDocumentCache::write_without_caching`] parks the caller until its
//! index is the awaited one, then writes straight through.

use crate::board::ErrorBoard;
use crate::core::config::{DEFAULT_MAX_PART_SIZE, MAX_WAIT_TIMEOUT};
use crate::core::errors::{PoolError, Result};
use crate::store::{ResultSink, SyncCell, WaitOutcome};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// A finished document and the text written after it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    pub terminator: String,
}

impl Document {
    pub fn new(text: impl Into<String>, terminator: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            terminator: terminator.into(),
        }
    }

    /// A document ending its line
    pub fn line(text: impl Into<String>) -> Self {
        Self::new(text, "\n")
    }
}

struct CacheState<W> {
    out: W,
    /// Registered and not yet written, ascending; the first is awaited
    awaited: BTreeSet<u64>,
    cached: BTreeMap<u64, Document>,
    /// Next index to be written
    next: u64,
    waiting_writers: usize,
    accepted: u64,
}

impl<W: Write> CacheState<W> {
    fn check_registered(&self, index: u64) -> Result<()> {
        if self.awaited.contains(&index) {
            Ok(())
        } else if index < self.next {
            Err(PoolError::AlreadyEmitted { index })
        } else {
            Err(PoolError::UnregisteredIndex { index })
        }
    }

    fn head_is_cached(&self) -> bool {
        match (self.awaited.first(), self.cached.first_key_value()) {
            (Some(head), Some((cached, _))) => head == cached,
            _ => false,
        }
    }

    fn fill_to(&mut self, index: u64, filler: &str) -> io::Result<()> {
        while self.next < index {
            self.out.write_all(filler.as_bytes())?;
            self.next += 1;
        }
        Ok(())
    }

    fn emit(&mut self, index: u64, doc: &Document, filler: &str) -> io::Result<()> {
        self.fill_to(index, filler)?;
        self.out.write_all(doc.text.as_bytes())?;
        self.out.write_all(doc.terminator.as_bytes())?;
        self.next = index + 1;
        self.awaited.remove(&index);
        Ok(())
    }

    /// Write the cached documents that are next in line
    fn flush_ready(&mut self, filler: &str) -> io::Result<usize> {
        let mut written = 0;
        while self.head_is_cached() {
            if let Some((index, doc)) = self.cached.pop_first() {
                self.emit(index, &doc, filler)?;
                written += 1;
            }
        }
        if written > 0 {
            self.out.flush()?;
        }
        Ok(written)
    }
}

fn write_failed(error: io::Error) -> PoolError {
    PoolError::io("write document", error)
}

/// See the module docs. Share it behind an `Arc`.
pub struct OrderedDocumentCache<W> {
    cell: SyncCell<CacheState<W>>,
    filler: String,
    max_part_size: usize,
    max_wait: Duration,
    board: Option<ErrorBoard>,
}

impl<W> OrderedDocumentCache<W>
where
    W: Write + Send,
{
    pub fn new(out: W) -> Self {
        Self {
            cell: SyncCell::new(CacheState {
                out,
                awaited: BTreeSet::new(),
                cached: BTreeMap::new(),
                next: 0,
                waiting_writers: 0,
                accepted: 0,
            }),
            filler: "\n".to_string(),
            max_part_size: DEFAULT_MAX_PART_SIZE,
            max_wait: MAX_WAIT_TIMEOUT,
            board: None,
        }
    }

    /// Text written for every gap; a newline by default
    pub fn with_filler(mut self, filler: impl Into<String>) -> Self {
        self.filler = filler.into();
        self
    }

    /// Documents longer than this bypass the cache when published
    pub fn with_max_part_size(mut self, bytes: usize) -> Self {
        self.max_part_size = bytes;
        self
    }

    /// Longest single sleep of a direct writer
    pub fn with_max_wait(mut self, timeout: Duration) -> Self {
        self.max_wait = timeout;
        self
    }

    /// Direct writers give up with `Aborted` once `board` is raised
    pub fn with_board(mut self, board: ErrorBoard) -> Self {
        self.board = Some(board);
        self
    }

    /// Announce that `index` will be delivered
    pub fn wait_for(&self, index: u64) -> Result<()> {
        self.cell.mutate(|state| {
            if index < state.next {
                return Err(PoolError::AlreadyEmitted { index });
            }
            if !state.awaited.insert(index) {
                return Err(PoolError::duplicate(index));
            }
            Ok(())
        })
    }

    /// Store a finished document until its turn comes
    pub fn cache_doc(&self, index: u64, doc: Document) -> Result<()> {
        self.cell.mutate(|state| {
            state.check_registered(index)?;
            if state.cached.contains_key(&index) {
                return Err(PoolError::duplicate(index));
            }
            trace!(index, "Caching document");
            state.cached.insert(index, doc);
            state.accepted += 1;
            Ok(())
        })
    }

    /// Write every cached document that is next in line, filling gaps.
    /// Returns how many documents were written.
    pub fn cache_write(&self) -> Result<usize> {
        let filler = self.filler.as_str();
        let mut guard = self.cell.acquire();
        if !guard.data().head_is_cached() {
            return Ok(0);
        }
        guard
            .mutate(|state| state.flush_ready(filler))
            .map_err(write_failed)
    }

    /// Block until `index` is the awaited index, then write `doc` directly.
    ///
    /// The caller's slot is occupied while waiting. Cached documents ahead of
    /// `index` are flushed by the waiting writer itself, so a direct write
    /// never depends on anyone else calling [`cache_write`](Self::cache_write).
    pub fn write_without_caching(&self, index: u64, doc: Document) -> Result<()> {
        let filler = self.filler.as_str();
        let mut guard = self.cell.acquire();
        guard.data().check_registered(index)?;
        if guard.data().cached.contains_key(&index) {
            return Err(PoolError::duplicate(index));
        }
        guard.mutate(|state| state.waiting_writers += 1);

        let outcome = loop {
            let actionable = {
                let state = guard.data();
                state.head_is_cached() || state.awaited.first() == Some(&index)
            };
            if actionable {
                let step = guard.mutate(|state| -> io::Result<bool> {
                    state.flush_ready(filler)?;
                    if state.awaited.first() != Some(&index) {
                        return Ok(false);
                    }
                    state.emit(index, &doc, filler)?;
                    state.out.flush()?;
                    state.accepted += 1;
                    Ok(true)
                });
                match step {
                    Ok(true) => break Ok(()),
                    Ok(false) => {}
                    Err(e) => break Err(write_failed(e)),
                }
            }

            if let Some(board) = &self.board {
                if board.is_raised() {
                    break Err(PoolError::aborted(format!(
                        "direct write of document {} abandoned",
                        index
                    )));
                }
            }
            if guard.wait_for_change(self.max_wait) == WaitOutcome::TimedOut {
                debug!(index, "Direct writer still waiting for its turn");
            }
        };

        guard.mutate(|state| state.waiting_writers -= 1);
        outcome
    }

    /// Flush what is ready, then write blanks for every index below `total`
    /// that never produced output.
    ///
    /// Fails if a registered document was never delivered.
    pub fn finish(&self, total: u64) -> Result<()> {
        let filler = self.filler.as_str();
        self.cell.mutate(|state| {
            state.flush_ready(filler).map_err(write_failed)?;
            if let Some(&missing) = state.awaited.first() {
                return Err(PoolError::aborted(format!(
                    "{} registered documents never delivered, first is {}",
                    state.awaited.len(),
                    missing
                )));
            }
            state.fill_to(total, filler).map_err(write_failed)?;
            state.out.flush().map_err(write_failed)
        })
    }

    pub fn cached_len(&self) -> usize {
        self.cell.read(|state| state.cached.len())
    }

    pub fn waiting_writers(&self) -> usize {
        self.cell.read(|state| state.waiting_writers)
    }

    /// Last index written, gaps included
    pub fn last_written(&self) -> Option<u64> {
        self.cell.read(|state| state.next.checked_sub(1))
    }

    /// Index currently awaited
    pub fn awaited(&self) -> Option<u64> {
        self.cell.read(|state| state.awaited.first().copied())
    }

    /// Run `f` on the output under the cache lock
    pub fn with_output<R>(&self, f: impl FnOnce(&mut W) -> R) -> R {
        let mut guard = self.cell.acquire();
        guard.mutate(|state| f(&mut state.out))
    }
}

impl<W> ResultSink<u64, Document> for OrderedDocumentCache<W>
where
    W: Write + Send,
{
    /// Cache `doc`, or write it directly when it is too large to cache
    fn publish(&self, key: u64, doc: Document, _weight: u64) -> Result<()> {
        if doc.text.len() > self.max_part_size {
            self.write_without_caching(key, doc)
        } else {
            self.cache_doc(key, doc)
        }
    }

    fn tally(&self) -> u64 {
        self.cell.read(|state| state.accepted)
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

/// In-memory output shared between the cache and whoever reads it back
#[derive(Debug, Clone, Default)]
pub struct SharedOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

impl Write for SharedOutput {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn text(cache: &OrderedDocumentCache<Vec<u8>>) -> String {
        cache.with_output(|out| String::from_utf8(out.clone()).unwrap())
    }

    #[test]
    fn test_gaps_are_filled_with_blanks() {
        let cache = OrderedDocumentCache::new(Vec::new());
        for index in [0, 2, 5] {
            cache.wait_for(index).unwrap();
        }
        cache.cache_doc(5, Document::line("d5")).unwrap();
        cache.cache_doc(2, Document::line("d2")).unwrap();
        cache.cache_doc(0, Document::line("d0")).unwrap();

        assert_eq!(cache.cache_write().unwrap(), 3);
        assert_eq!(text(&cache), "d0\n\nd2\n\n\nd5\n");
        assert_eq!(cache.last_written(), Some(5));
        assert_eq!(cache.cached_len(), 0);
    }

    #[test]
    fn test_flush_stops_at_missing_head() {
        let cache = OrderedDocumentCache::new(Vec::new());
        for index in 0..3 {
            cache.wait_for(index).unwrap();
        }
        cache.cache_doc(1, Document::line("b")).unwrap();
        cache.cache_doc(2, Document::line("c")).unwrap();
        assert_eq!(cache.cache_write().unwrap(), 0);
        assert_eq!(cache.awaited(), Some(0));
        assert_eq!(cache.last_written(), None);

        cache.cache_doc(0, Document::line("a")).unwrap();
        assert_eq!(cache.cache_write().unwrap(), 3);
        assert_eq!(text(&cache), "a\nb\nc\n");
        assert_eq!(cache.awaited(), None);
    }

    #[test]
    fn test_registration_errors() {
        let cache = OrderedDocumentCache::new(Vec::new());
        assert!(matches!(
            cache.cache_doc(3, Document::line("x")),
            Err(PoolError::UnregisteredIndex { index: 3 })
        ));

        cache.wait_for(0).unwrap();
        assert!(matches!(cache.wait_for(0), Err(PoolError::DuplicateEntry { .. })));
        cache.cache_doc(0, Document::line("a")).unwrap();
        cache.cache_write().unwrap();

        assert!(matches!(cache.wait_for(0), Err(PoolError::AlreadyEmitted { index: 0 })));
        assert!(matches!(
            cache.cache_doc(0, Document::line("again")),
            Err(PoolError::AlreadyEmitted { index: 0 })
        ));
    }

    #[test]
    fn test_direct_write_waits_for_its_turn() {
        let cache = Arc::new(OrderedDocumentCache::new(Vec::new()).with_max_wait(Duration::from_millis(50)));
        cache.wait_for(0).unwrap();
        cache.wait_for(1).unwrap();

        let writer = Arc::clone(&cache);
        let handle = thread::spawn(move || writer.write_without_caching(1, Document::line("big")));

        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.waiting_writers(), 1);
        assert_eq!(text(&cache), "");

        // nobody calls cache_write: the direct writer flushes index 0 itself
        cache.cache_doc(0, Document::line("small")).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(text(&cache), "small\nbig\n");
        assert_eq!(cache.waiting_writers(), 0);
    }

    #[test]
    fn test_direct_write_gives_up_on_abort() {
        let board = ErrorBoard::new();
        let cache = Arc::new(
            OrderedDocumentCache::new(Vec::new())
                .with_max_wait(Duration::from_millis(10))
                .with_board(board.clone()),
        );
        cache.wait_for(0).unwrap();
        cache.wait_for(1).unwrap();

        let writer = Arc::clone(&cache);
        let handle = thread::spawn(move || writer.write_without_caching(1, Document::line("big")));
        thread::sleep(Duration::from_millis(20));
        board.raise("parpipe-worker-0", "0", PoolError::aborted("test"));

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(PoolError::Aborted { .. })));
        assert_eq!(cache.waiting_writers(), 0);
    }

    #[test]
    fn test_finish_writes_trailing_blanks() {
        let cache = OrderedDocumentCache::new(Vec::new());
        cache.wait_for(1).unwrap();
        cache.cache_doc(1, Document::new("words", " ")).unwrap();
        cache.finish(4).unwrap();
        assert_eq!(text(&cache), "\nwords \n\n");
    }

    #[test]
    fn test_finish_reports_undelivered_documents() {
        let cache = OrderedDocumentCache::new(Vec::new());
        cache.wait_for(0).unwrap();
        assert!(matches!(cache.finish(1), Err(PoolError::Aborted { .. })));
    }

    #[test]
    fn test_publish_routes_oversized_documents_directly() {
        let cache = OrderedDocumentCache::new(SharedOutput::new()).with_max_part_size(4);
        let output = cache.with_output(|out| out.clone());
        cache.wait_for(0).unwrap();
        cache.wait_for(1).unwrap();

        cache.publish(0, Document::line("tiny"), 1).unwrap();
        assert_eq!(cache.cached_len(), 1);
        // index 0 is flushed by the direct writer before its own text
        cache.publish(1, Document::line("enormous"), 1).unwrap();
        assert_eq!(output.to_string_lossy(), "tiny\nenormous\n");
        assert_eq!(ResultSink::tally(&cache), 2);
    }
}
