use crate::board::ErrorBoard;
use crate::core::errors::PoolError;
use crate::pool::stats::RunStats;
use crate::queue::{FetchMode, Fetched, Task, TaskQueue};
use crate::store::ResultSink;
use std::any::Any;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info_span, trace, Span};

/// The caller-supplied unit of work.
///
/// Any `Fn(&K, P) -> anyhow::Result<O>` closure is an operation with weight 1.
/// Implement the trait directly to weigh outputs (rows in a batch, say) or to
/// release caches between tasks.
pub trait Operation<K, P>: Send + Sync {
    type Output;

    fn execute(&self, key: &K, payload: P) -> anyhow::Result<Self::Output>;

    /// How much `output` counts towards the run's expected total
    fn weight(&self, _output: &Self::Output) -> u64 {
        1
    }

    /// Called after every task once its buffers are dropped
    fn reclaim(&self) {}
}

impl<K, P, O, F> Operation<K, P> for F
where
    F: Fn(&K, P) -> anyhow::Result<O> + Send + Sync,
{
    type Output = O;

    fn execute(&self, key: &K, payload: P) -> anyhow::Result<O> {
        self(key, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Fetching,
    Executing,
    Publishing,
    Stopped,
}

/// Why [`Worker::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// End of work: sentinel received or queue closed and drained
    Stopped,
    /// Probe found nothing within its timeout
    Idle,
    /// Probe processed one task
    Processed,
    /// This worker's task failed and the board has been raised
    Failed,
    /// A sibling raised the board
    Aborted,
}

/// Pulls tasks, executes the operation and publishes results.
///
/// A worker never retries: the first failure is posted to the board and the
/// worker stops.
pub struct Worker<K, P, Op>
where
    Op: Operation<K, P>,
{
    name: String,
    queue: TaskQueue<Task<K, P>>,
    sink: Arc<dyn ResultSink<K, Op::Output>>,
    op: Arc<Op>,
    board: ErrorBoard,
    stats: Arc<RunStats>,
    state: WorkerState,
    span: Span,
}

impl<K, P, Op> Worker<K, P, Op>
where
    K: Debug,
    Op: Operation<K, P>,
{
    pub fn new(
        name: impl Into<String>,
        queue: TaskQueue<Task<K, P>>,
        sink: Arc<dyn ResultSink<K, Op::Output>>,
        op: Arc<Op>,
        board: ErrorBoard,
        stats: Arc<RunStats>,
    ) -> Self {
        let name = name.into();
        let span = info_span!("worker", worker = %name, run_id = %stats.run_id());
        Self {
            name,
            queue,
            sink,
            op,
            board,
            stats,
            state: WorkerState::Idle,
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Fetch and process tasks.
    ///
    /// `FetchMode::Blocking` loops until the end of work, a failure or an
    /// abort. A probe handles at most one task and returns, which lets the
    /// coordinator interleave helping with its own bookkeeping.
    pub fn run(&mut self, mode: FetchMode) -> WorkerExit {
        let span = self.span.clone();
        let _entered = span.enter();

        loop {
            if self.state == WorkerState::Stopped {
                return WorkerExit::Stopped;
            }
            if self.board.is_raised() {
                debug!("Board raised, leaving the queue");
                self.state = WorkerState::Stopped;
                return WorkerExit::Aborted;
            }

            self.state = WorkerState::Fetching;
            let task = match self.queue.fetch(mode) {
                Fetched::Task(task) => task,
                Fetched::Sentinel => {
                    debug!("End of work");
                    self.state = WorkerState::Stopped;
                    return WorkerExit::Stopped;
                }
                Fetched::Empty => {
                    self.state = WorkerState::Idle;
                    return WorkerExit::Idle;
                }
            };

            if !self.process(task) {
                return WorkerExit::Failed;
            }
            if mode != FetchMode::Blocking {
                return WorkerExit::Processed;
            }
        }
    }

    /// Execute one task and publish its result.
    ///
    /// Returns `false` after posting the failure to the board; the worker is
    /// stopped from then on.
    pub fn process(&mut self, task: Task<K, P>) -> bool {
        let Task { key, payload } = task;
        trace!(task = ?key, "Executing");
        self.state = WorkerState::Executing;

        let op = Arc::clone(&self.op);
        let executed = panic::catch_unwind(AssertUnwindSafe(|| op.execute(&key, payload)));
        let output = match executed {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                let error = PoolError::worker_execution(self.name.as_str(), format!("{:?}", key), source);
                return self.fail(&key, error);
            }
            Err(payload) => {
                let error = PoolError::WorkerPanicked {
                    worker: self.name.clone(),
                    task: format!("{:?}", key),
                    message: panic_message(payload.as_ref()),
                };
                return self.fail(&key, error);
            }
        };

        self.state = WorkerState::Publishing;
        let weight = self.op.weight(&output);
        let key_text = format!("{:?}", key);
        if let Err(error) = self.sink.publish(key, output, weight) {
            self.state = WorkerState::Stopped;
            self.board.raise(&self.name, &key_text, error);
            return false;
        }

        self.stats.record(&self.name);
        self.op.reclaim();
        self.state = WorkerState::Idle;
        true
    }

    fn fail(&mut self, key: &K, error: PoolError) -> bool {
        self.state = WorkerState::Stopped;
        self.board.raise(&self.name, &format!("{:?}", key), error);
        false
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
