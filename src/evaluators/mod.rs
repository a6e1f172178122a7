//! Trigger evaluators: long-list multi-trigger monitoring and hot-list
//! one-shot targets.

pub mod hot;
pub mod long;

pub use hot::{HotEvaluator, HotTickSummary};
pub use long::{LongEvaluator, TickSummary};
