//! Line-by-line text pipeline.
//!
//! Reads text, cuts every line into parts of bounded word count, runs a
//! caller-supplied transform on each non-empty part across the worker pool
//! and writes the results in input order through an
//! [`OrderedDocumentCache`].
//!
//! The reading thread is also the coordinator. Empty parts are never
//! delegated: they are left as gaps and come out as blank lines. When the
//! queue is far enough ahead of the workers, or a part is too large to be
//! shared, the coordinator transforms the part itself.

use crate::board::ErrorBoard;
use crate::cache::{Document, OrderedDocumentCache};
use crate::core::config::PoolConfig;
use crate::core::errors::{PoolError, Result};
use crate::pool::coordinator::{abandon, arm_abort, join_workers, spawn_workers, ProgressLog};
use crate::pool::stats::RunStats;
use crate::pool::worker::{Operation, Worker};
use crate::queue::{FetchMode, Task, TaskQueue};
use crate::store::ResultSink;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{debug, info};

/// One part of an input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePart {
    /// Zero-based input line number
    pub line: u64,
    /// Whether this part ends its line
    pub last: bool,
    /// Words of the part joined by single spaces
    pub text: String,
}

impl LinePart {
    pub fn terminator(&self) -> &'static str {
        if self.last {
            "\n"
        } else {
            " "
        }
    }
}

/// Splits a reader into [`LinePart`]s.
///
/// Every line yields at least one part; a line without words yields one
/// empty part. Trailing whitespace after the final newline yields nothing.
pub struct LineParts<R> {
    reader: R,
    max_words: usize,
    line: u64,
    buf: String,
    pending: VecDeque<LinePart>,
    done: bool,
}

impl<R: BufRead> LineParts<R> {
    pub fn new(reader: R, max_words: usize) -> Self {
        Self {
            reader,
            max_words: max_words.max(1),
            line: 0,
            buf: String::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn split_buffered_line(&mut self) {
        let line = self.line;
        self.line += 1;

        let words: Vec<&str> = self.buf.split_whitespace().collect();
        if words.is_empty() {
            self.pending.push_back(LinePart {
                line,
                last: true,
                text: String::new(),
            });
            return;
        }

        let chunks: Vec<&[&str]> = words.chunks(self.max_words).collect();
        let count = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            self.pending.push_back(LinePart {
                line,
                last: i + 1 == count,
                text: chunk.join(" "),
            });
        }
    }
}

impl<R: BufRead> Iterator for LineParts<R> {
    type Item = io::Result<LinePart>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(part) = self.pending.pop_front() {
            return Some(Ok(part));
        }
        if self.done {
            return None;
        }

        self.buf.clear();
        match self.reader.read_line(&mut self.buf) {
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                let unterminated = !self.buf.ends_with('\n');
                if unterminated && self.buf.trim().is_empty() {
                    self.done = true;
                    return None;
                }
                self.split_buffered_line();
                self.pending.pop_front().map(Ok)
            }
        }
    }
}

/// Counters of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub lines: u64,
    pub parts: u64,
    /// Parts handed to spawned workers
    pub delegated: u64,
    /// Parts transformed by the coordinator itself
    pub helped: u64,
}

struct Transform<F>(F);

impl<F> Operation<u64, Document> for Transform<F>
where
    F: Fn(&str) -> anyhow::Result<String> + Send + Sync,
{
    type Output = Document;

    fn execute(&self, _index: &u64, part: Document) -> anyhow::Result<Document> {
        let text = (self.0)(&part.text)?;
        let terminator = if part.terminator == " " && text.is_empty() {
            String::new()
        } else {
            part.terminator
        };
        Ok(Document { text, terminator })
    }
}

/// Stop the workers for a failure the coordinator hit itself.
///
/// A board already raised by a worker holds the real cause, which wins.
fn halt<T>(queue: &TaskQueue<T>, board: &ErrorBoard, error: PoolError) -> PoolError {
    if board.is_raised() {
        return abandon(queue, board);
    }
    board.raise("coordinator", "input", PoolError::aborted(error.to_string()));
    error
}

/// Closes the queue when the run ends, whichever way it ends
struct CloseOnDrop<T>(TaskQueue<T>);

impl<T> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub struct LinePipeline<F> {
    config: PoolConfig,
    transform: Arc<Transform<F>>,
}

impl<F> LinePipeline<F>
where
    F: Fn(&str) -> anyhow::Result<String> + Send + Sync + 'static,
{
    pub fn new(config: PoolConfig, transform: F) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            transform: Arc::new(Transform(transform)),
        })
    }

    /// Transform `input` into `output`, one output line per input line
    pub fn run<R, W>(&self, input: R, output: W) -> Result<PipelineSummary>
    where
        R: BufRead,
        W: Write + Send + 'static,
    {
        let participants = self.config.effective_workers().max(1);
        let spawned = participants - 1;
        let lead = spawned * self.config.helper_lead_factor;

        let board = ErrorBoard::new();
        let cache = Arc::new(
            OrderedDocumentCache::new(output)
                .with_max_part_size(self.config.max_part_size)
                .with_max_wait(self.config.max_wait_timeout())
                .with_board(board.clone()),
        );
        let sink: Arc<dyn ResultSink<u64, Document>> = cache.clone();
        let queue: TaskQueue<Task<u64, Document>> = TaskQueue::new();
        let _closer = CloseOnDrop(queue.clone());
        let stats = Arc::new(RunStats::new(participants, 0));
        let _hook = arm_abort(&board, &queue, Arc::downgrade(&sink));

        info!(run_id = %stats.run_id(), participants, "Starting line pipeline");
        let handles = spawn_workers(spawned, &queue, &sink, &self.transform, &board, &stats)?;
        let mut helper = Worker::new(
            "helper",
            queue.clone(),
            Arc::clone(&sink),
            Arc::clone(&self.transform),
            board.clone(),
            Arc::clone(&stats),
        );

        let mut summary = PipelineSummary::default();
        let mut progress = ProgressLog::new(self.config.progress_interval());

        for part in LineParts::new(input, self.config.max_words_per_part) {
            let part = part.map_err(|e| halt(&queue, &board, PoolError::io("read input", e)))?;
            if board.is_raised() {
                return Err(abandon(&queue, &board));
            }

            if !part.text.is_empty() {
                let index = summary.parts;
                cache.wait_for(index).map_err(|e| halt(&queue, &board, e))?;
                let oversized = part.text.len() > self.config.max_part_size;
                let terminator = part.terminator();
                let task = Task::new(index, Document::new(part.text, terminator));

                if spawned == 0 || oversized || queue.len() > lead {
                    if oversized {
                        debug!(index, "Part too large to share, transforming it here");
                    }
                    summary.helped += 1;
                    if !helper.process(task) {
                        return Err(abandon(&queue, &board));
                    }
                } else {
                    if queue.push(task).is_err() {
                        return Err(abandon(&queue, &board));
                    }
                    summary.delegated += 1;
                }
                cache.cache_write().map_err(|e| halt(&queue, &board, e))?;
            }

            if part.last {
                summary.lines += 1;
            }
            summary.parts += 1;

            if progress.due() {
                let written = cache.last_written().map_or(0, |last| last + 1);
                info!(
                    "Written {} parts of {} lines read, {} processed parts waiting",
                    written,
                    summary.lines,
                    cache.cached_len()
                );
            }
        }

        // nothing left to read, help drain the queue
        let poll = self.config.helper_poll_timeout();
        while !queue.is_empty() {
            if board.is_raised() {
                return Err(abandon(&queue, &board));
            }
            helper.run(FetchMode::Probe(poll));
            cache.cache_write().map_err(|e| halt(&queue, &board, e))?;
        }
        queue.close();

        join_workers(handles, &queue, &board, || cache.cache_write().map(|_| ()))
            .map_err(|e| halt(&queue, &board, e))?;
        cache.finish(summary.parts)?;

        info!(
            lines = summary.lines,
            parts = summary.parts,
            delegated = summary.delegated,
            helped = summary.helped,
            "Line pipeline finished"
        );
        Ok(summary)
    }
}
