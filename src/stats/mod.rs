//! Statistics module
//!
//! Lock-free batch counters using atomic operations.

mod atomic;

pub use atomic::{BatchStats, RunSummary};
