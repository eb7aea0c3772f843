//! Scatter creation policy.
//!
//! The pool is cut into equally sized slabs. A slab is lazily assigned to one slot
//! size class on first use and hands out slots tracked by an atomic bitmap. Workers
//! start probing at a slab derived from their thread id so that concurrent requests
//! scatter over the table instead of piling onto slab 0.

pub mod config;
pub mod heap;
pub mod probe;
pub mod size_class;
pub mod slab_table;
#[cfg(feature = "tracking")]
pub mod stats;

pub use config::{Reclaim, ScatterConfig};
pub use heap::Scatter;
pub use probe::BoundedProbe;
pub use size_class::SizeClasses;
#[cfg(feature = "tracking")]
pub use stats::HeapStats;
