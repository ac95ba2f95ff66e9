//! Performance sampling seam.
//!
//! An optional external observer bracketing each draw. `begin`/`end` wrap
//! the producer invocation only; `finish` flushes buffered samples before
//! the final throughput report and `dump` receives the run totals at loop
//! exit. Vendor counter implementations (e.g. AMD_performance_monitor)
//! plug in behind this trait.

use std::time::Duration;

/// Per-draw sampling brackets.
pub trait PerfSampler {
    /// Called immediately before the frame producer runs.
    fn begin(&mut self) {}

    /// Called immediately after the frame producer returns.
    fn end(&mut self) {}

    /// Flush buffered samples; called once before final reporting.
    fn finish(&mut self) {}

    /// Receive run totals at loop exit.
    fn dump(&mut self, _frames: u64, _elapsed: Duration) {}
}

/// Sampler used when no counters were requested.
pub struct NullSampler;

impl PerfSampler for NullSampler {}
