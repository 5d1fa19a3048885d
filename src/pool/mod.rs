//! Worker pool: workers, the coordinating helper, run statistics and
//! ordered partitioning.

pub mod coordinator;
pub mod partition;
pub mod stats;
pub mod worker;

pub use coordinator::Coordinator;
pub use partition::part_ranges;
pub use stats::{RunReport, RunStats};
pub use worker::{Operation, Worker, WorkerExit, WorkerState};
