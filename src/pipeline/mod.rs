//! Drivers built on the pool and the ordered document cache.

pub mod lines;

pub use lines::{LinePart, LineParts, LinePipeline, PipelineSummary};
