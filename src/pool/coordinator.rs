//! Coordinator: runs a batch of tasks on a worker pool and collects results.
//!
//! The coordinator spawns `workers - 1` threads and plays the last worker
//! itself. While the queue has work it probes for one task at a time
//! ("helping"); once the queue is drained it waits on the result sink with a
//! bounded timeout, re-checking the error board on every wake.
//!
//! Failure is fail-fast: the first error raised on the board closes and
//! drains the queue, wakes every waiter and is returned to the caller.
//! In-flight tasks are not waited for; their workers exit at their next
//! board check.

use crate::board::{ErrorBoard, WakerId};
use crate::codec::ChunkCodec;
use crate::core::config::PoolConfig;
use crate::core::errors::{PoolError, Result};
use crate::pool::stats::{RunReport, RunStats};
use crate::pool::worker::{Operation, Worker, WorkerExit};
use crate::queue::{FetchMode, Task, TaskQueue};
use crate::store::{KeyedStore, OrderedStore, ResultSink};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often a joining coordinator re-checks the board
pub(crate) const JOIN_POLL: Duration = Duration::from_millis(5);

/// Rate limiter for progress lines
pub(crate) struct ProgressLog {
    interval: Duration,
    last: Instant,
}

impl ProgressLog {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Instant::now(),
        }
    }

    pub(crate) fn due(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Keeps a run's abort waker registered on the board until dropped
#[must_use = "dropping the hook disarms the abort immediately"]
pub(crate) struct AbortHook {
    board: ErrorBoard,
    id: WakerId,
}

impl Drop for AbortHook {
    fn drop(&mut self) {
        self.board.remove_waker(self.id);
    }
}

/// Close and drain the queue once the board is raised, and interrupt every
/// wait on `sink`. The waker lives as long as the returned hook.
pub(crate) fn arm_abort<T, K, V>(
    board: &ErrorBoard,
    queue: &TaskQueue<T>,
    sink: Weak<dyn ResultSink<K, V>>,
) -> AbortHook
where
    T: Send + 'static,
    K: 'static,
    V: 'static,
{
    let queue = queue.clone();
    let id = board.on_raise(move || {
        queue.close();
        let dropped = queue.drain();
        if dropped > 0 {
            debug!(dropped, "Dropped queued tasks after abort");
        }
        if let Some(sink) = sink.upgrade() {
            sink.wake();
        }
    });
    AbortHook {
        board: board.clone(),
        id,
    }
}

pub(crate) fn spawn_workers<K, P, Op>(
    count: usize,
    queue: &TaskQueue<Task<K, P>>,
    sink: &Arc<dyn ResultSink<K, Op::Output>>,
    op: &Arc<Op>,
    board: &ErrorBoard,
    stats: &Arc<RunStats>,
) -> Result<Vec<JoinHandle<WorkerExit>>>
where
    K: Debug + Send + 'static,
    P: Send + 'static,
    Op: Operation<K, P> + 'static,
    Op::Output: 'static,
{
    let mut handles = Vec::with_capacity(count);
    for i in 0..count {
        let name = format!("parpipe-worker-{}", i);
        let mut worker = Worker::new(
            name.clone(),
            queue.clone(),
            Arc::clone(sink),
            Arc::clone(op),
            board.clone(),
            Arc::clone(stats),
        );
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker.run(FetchMode::Blocking))
            .map_err(|e| {
                queue.close();
                PoolError::io("spawn worker thread", e)
            })?;
        handles.push(handle);
    }
    debug!(workers = count, "Spawned workers");
    Ok(handles)
}

/// Wait for every worker to finish, calling `tick` between board checks.
///
/// Returns the board's error as soon as it is raised instead of joining.
pub(crate) fn join_workers<T>(
    handles: Vec<JoinHandle<WorkerExit>>,
    queue: &TaskQueue<T>,
    board: &ErrorBoard,
    mut tick: impl FnMut() -> Result<()>,
) -> Result<()> {
    loop {
        if board.is_raised() {
            return Err(abandon(queue, board));
        }
        tick()?;
        if handles.iter().all(|handle| handle.is_finished()) {
            break;
        }
        thread::sleep(JOIN_POLL);
    }

    for handle in handles {
        let name = handle.thread().name().unwrap_or("worker").to_string();
        if handle.join().is_err() {
            return Err(PoolError::WorkerPanicked {
                worker: name,
                task: "join".to_string(),
                message: "worker thread panicked outside a task".to_string(),
            });
        }
    }
    if board.is_raised() {
        return Err(abandon(queue, board));
    }
    Ok(())
}

/// Stop feeding workers and surface the first failure
pub(crate) fn abandon<T>(queue: &TaskQueue<T>, board: &ErrorBoard) -> PoolError {
    queue.close();
    let dropped = queue.drain();
    warn!(dropped, "Error board raised, abandoning run");
    board.take_error()
}

fn shortfall(expected: u64, tally: u64) -> PoolError {
    PoolError::configuration_field(
        format!(
            "all tasks finished with a tally of {} but {} was expected",
            tally, expected
        ),
        "expected",
    )
}

fn join_error(error: tokio::task::JoinError) -> PoolError {
    PoolError::WorkerPanicked {
        worker: "coordinator".to_string(),
        task: "run".to_string(),
        message: error.to_string(),
    }
}

/// Runs batches of tasks; one run at a time per call, any number of calls
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: PoolConfig,
    board: Option<ErrorBoard>,
}

impl Coordinator {
    pub fn new(config: PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            board: None,
        })
    }

    /// Use `board` instead of a fresh board per run, so long-running
    /// operations can poll it. A raised board stays raised: the coordinator
    /// is spent after the first failure.
    pub fn with_board(mut self, board: ErrorBoard) -> Self {
        self.board = Some(board);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn codec(&self) -> ChunkCodec {
        ChunkCodec::new(self.config.max_part_size).with_compression(self.config.compression)
    }

    /// Run one task per payload, positions `0..n`, and return the outputs in
    /// position order
    pub fn run_ordered<P, Op>(&self, payloads: Vec<P>, op: Op) -> Result<(Vec<Op::Output>, RunReport)>
    where
        P: Send + 'static,
        Op: Operation<u64, P> + 'static,
        Op::Output: Serialize + DeserializeOwned + Send + 'static,
    {
        let expected = payloads.len() as u64;
        self.run_ordered_expecting(payloads, op, expected)
    }

    /// [`run_ordered`](Self::run_ordered) for operations with custom weights:
    /// the run completes once the published weights reach `expected`
    pub fn run_ordered_expecting<P, Op>(
        &self,
        payloads: Vec<P>,
        op: Op,
        expected: u64,
    ) -> Result<(Vec<Op::Output>, RunReport)>
    where
        P: Send + 'static,
        Op: Operation<u64, P> + 'static,
        Op::Output: Serialize + DeserializeOwned + Send + 'static,
    {
        let store = OrderedStore::new(self.codec());
        let tasks = payloads
            .into_iter()
            .enumerate()
            .map(|(position, payload)| Task::new(position as u64, payload))
            .collect();
        let sink: Arc<dyn ResultSink<u64, Op::Output>> = Arc::new(store.clone());
        let report = self.run_with_sink(tasks, Arc::new(op), sink, expected)?;
        let results = store.pop_ordered_run()?;
        Ok((results, report))
    }

    /// Run one task per `(key, payload)` and return the keyed results
    pub fn run_keyed<K, P, Op>(
        &self,
        tasks: Vec<(K, P)>,
        op: Op,
    ) -> Result<(KeyedStore<K, Op::Output>, RunReport)>
    where
        K: Eq + Hash + Clone + Debug + Send + 'static,
        P: Send + 'static,
        Op: Operation<K, P> + 'static,
        Op::Output: Serialize + DeserializeOwned + Send + 'static,
    {
        let store = KeyedStore::new(self.codec());
        let expected = tasks.len() as u64;
        let tasks = tasks
            .into_iter()
            .map(|(key, payload)| Task::new(key, payload))
            .collect();
        let sink: Arc<dyn ResultSink<K, Op::Output>> = Arc::new(store.clone());
        let report = self.run_with_sink(tasks, Arc::new(op), sink, expected)?;
        Ok((store, report))
    }

    /// Run `tasks` into `sink` until its tally reaches `expected`
    pub fn run_with_sink<K, P, Op>(
        &self,
        tasks: Vec<Task<K, P>>,
        op: Arc<Op>,
        sink: Arc<dyn ResultSink<K, Op::Output>>,
        expected: u64,
    ) -> Result<RunReport>
    where
        K: Debug + Send + 'static,
        P: Send + 'static,
        Op: Operation<K, P> + 'static,
        Op::Output: 'static,
    {
        let total = tasks.len();
        let participants = self.config.effective_workers().min(total).max(1);
        let board = self.board.clone().unwrap_or_default();
        let stats = Arc::new(RunStats::new(participants, total));
        info!(
            run_id = %stats.run_id(),
            tasks = total,
            participants,
            expected,
            "Starting run"
        );

        if participants == 1 {
            self.run_inline(tasks, op, &sink, expected, &board, &stats)?;
        } else {
            self.run_parallel(tasks, op, &sink, expected, &board, &stats, participants)?;
        }

        let report = stats.report();
        info!(
            run_id = %report.run_id,
            processed = report.processed,
            elapsed_ms = report.elapsed().num_milliseconds(),
            "Run finished"
        );
        Ok(report)
    }

    fn run_inline<K, P, Op>(
        &self,
        tasks: Vec<Task<K, P>>,
        op: Arc<Op>,
        sink: &Arc<dyn ResultSink<K, Op::Output>>,
        expected: u64,
        board: &ErrorBoard,
        stats: &Arc<RunStats>,
    ) -> Result<()>
    where
        K: Debug + Send + 'static,
        P: Send + 'static,
        Op: Operation<K, P> + 'static,
        Op::Output: 'static,
    {
        debug!("Single participant, running inline");
        let total = tasks.len() as u64;
        // never fed; tasks go straight to `process`
        let idle_queue = TaskQueue::new();
        let mut helper = Worker::new(
            "helper",
            idle_queue,
            Arc::clone(sink),
            op,
            board.clone(),
            Arc::clone(stats),
        );
        let mut progress = ProgressLog::new(self.config.progress_interval());

        for (done, task) in tasks.into_iter().enumerate() {
            if board.is_raised() || !helper.process(task) {
                return Err(board.take_error());
            }
            if progress.due() {
                log_progress(done as u64 + 1, total);
            }
        }

        let tally = sink.tally();
        if tally < expected {
            return Err(shortfall(expected, tally));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_parallel<K, P, Op>(
        &self,
        tasks: Vec<Task<K, P>>,
        op: Arc<Op>,
        sink: &Arc<dyn ResultSink<K, Op::Output>>,
        expected: u64,
        board: &ErrorBoard,
        stats: &Arc<RunStats>,
        participants: usize,
    ) -> Result<()>
    where
        K: Debug + Send + 'static,
        P: Send + 'static,
        Op: Operation<K, P> + 'static,
        Op::Output: 'static,
    {
        let total = tasks.len() as u64;
        let queue = TaskQueue::new();
        let _hook = arm_abort(board, &queue, Arc::downgrade(sink));

        let handles = spawn_workers(participants - 1, &queue, sink, &op, board, stats)?;
        for task in tasks {
            // only fails once an abort has closed the queue
            if queue.push(task).is_err() {
                break;
            }
        }
        queue.close();

        let mut helper = Worker::new(
            "helper",
            queue.clone(),
            Arc::clone(sink),
            op,
            board.clone(),
            Arc::clone(stats),
        );
        let poll = self.config.helper_poll_timeout();
        let max_wait = self.config.max_wait_timeout();
        let mut progress = ProgressLog::new(self.config.progress_interval());
        let mut helping = true;

        loop {
            if board.is_raised() {
                return Err(abandon(&queue, board));
            }

            // processed before tally: a task is counted only after it is published
            let processed = stats.processed();
            let seen = sink.version();
            let tally = sink.tally();
            if tally >= expected {
                break;
            }
            if processed >= total {
                return Err(shortfall(expected, tally));
            }

            if helping {
                if helper.run(FetchMode::Probe(poll)) == WorkerExit::Stopped {
                    debug!("Queue drained, coordinator stops helping");
                    helping = false;
                }
            } else {
                sink.wait_for_change_since(seen, max_wait);
            }

            if progress.due() {
                log_progress(sink.tally(), expected);
            }
        }

        join_workers(handles, &queue, board, || Ok(()))
    }

    /// [`run_ordered`](Self::run_ordered) on tokio's blocking pool
    pub async fn run_ordered_async<P, Op>(
        &self,
        payloads: Vec<P>,
        op: Op,
    ) -> Result<(Vec<Op::Output>, RunReport)>
    where
        P: Send + 'static,
        Op: Operation<u64, P> + 'static,
        Op::Output: Serialize + DeserializeOwned + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::task::spawn_blocking(move || coordinator.run_ordered(payloads, op))
            .await
            .map_err(join_error)?
    }

    /// [`run_keyed`](Self::run_keyed) on tokio's blocking pool
    pub async fn run_keyed_async<K, P, Op>(
        &self,
        tasks: Vec<(K, P)>,
        op: Op,
    ) -> Result<(KeyedStore<K, Op::Output>, RunReport)>
    where
        K: Eq + Hash + Clone + Debug + Send + 'static,
        P: Send + 'static,
        Op: Operation<K, P> + 'static,
        Op::Output: Serialize + DeserializeOwned + Send + 'static,
    {
        let coordinator = self.clone();
        tokio::task::spawn_blocking(move || coordinator.run_keyed(tasks, op))
            .await
            .map_err(join_error)?
    }
}

fn log_progress(done: u64, total: u64) {
    let percent = if total == 0 {
        100.0
    } else {
        done as f64 * 100.0 / total as f64
    };
    info!("done: {:.1}% - {}/{}", percent, done, total);
}
