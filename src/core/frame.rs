//! The steady-state frame loop.
//!
//! `WarmingUp -> Steady -> (Interrupted | Exhausted | Failed)`. Each
//! iteration renders through the frame producer, forces GPU completion,
//! resolves the frame's kernel framebuffer, checks for user interruption
//! and hands the buffer to the commit protocol. Buffer release is strictly
//! in frame order; the previously displayed buffer is released only after
//! its successor's commit returns.

use std::time::{Duration, Instant};

use drm_fourcc::DrmFourcc;
use glow::HasContext;
use tracing::{debug, info};

use crate::core::buffers::slot_for_frame;
use crate::core::commit::{input_pending, CommitOutcome, CommitProtocol};
use crate::core::display::DisplayTarget;
use crate::core::errors::{PipelineError, RuntimeError};
use crate::core::import::{self, FrameBuffers};
use crate::core::perf::PerfSampler;
use crate::core::producer::FrameProducer;
use crate::core::render::RenderContext;
use crate::device::Card;

/// Loop phase while the loop is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    /// Before the first successful commit; a modeset is still allowed.
    WarmingUp,
    /// Modeset done, flipping buffers.
    Steady,
}

/// How the loop ended. Both variants are clean exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The configured frame count was reached.
    Exhausted,
    /// The user interrupted the run.
    Interrupted,
}

// ============================================================================
// Frame budget
// ============================================================================

/// Bounded or unbounded frame count.
#[derive(Debug, Clone, Copy)]
pub struct FrameBudget {
    limit: u32,
}

impl FrameBudget {
    /// `limit` of 0 runs until interrupted.
    pub fn new(limit: u32) -> Self {
        Self { limit }
    }

    /// True once `next_frame` frames have already run.
    pub fn exhausted(&self, next_frame: u64) -> bool {
        self.limit != 0 && next_frame >= self.limit as u64
    }
}

// ============================================================================
// Throughput measurement
// ============================================================================

/// Frame throughput over the measured window.
#[derive(Debug, Clone, Copy)]
pub struct Throughput {
    /// Completed frames, excluding the first (its timing carries one-time
    /// setup cost such as shader compilation).
    pub frames: u64,
    pub elapsed: Duration,
}

impl Throughput {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Reports throughput at a minimum interval and once at loop exit.
pub struct ThroughputReporter {
    start: Instant,
    last_report: Instant,
}

const REPORT_INTERVAL: Duration = Duration::from_secs(2);

impl ThroughputReporter {
    pub fn new(now: Instant) -> Self {
        Self {
            start: now,
            last_report: now,
        }
    }

    fn snapshot(&self, frames_started: u64, now: Instant) -> Throughput {
        Throughput {
            frames: frames_started.saturating_sub(1),
            elapsed: now.duration_since(self.start),
        }
    }

    /// A report if at least the reporting interval has elapsed since the
    /// previous one.
    pub fn maybe_report(&mut self, frames_started: u64, now: Instant) -> Option<Throughput> {
        if now.duration_since(self.last_report) < REPORT_INTERVAL {
            return None;
        }
        self.last_report = now;
        Some(self.snapshot(frames_started, now))
    }

    /// Final report at loop exit.
    pub fn finish(&self, frames_started: u64, now: Instant) -> Throughput {
        self.snapshot(frames_started, now)
    }
}

// ============================================================================
// Frame loop
// ============================================================================

/// Owns one run of the steady-state loop.
pub struct FrameLoop<'a> {
    pub card: &'a Card,
    pub target: &'a DisplayTarget,
    pub render: &'a RenderContext,
    pub buffers: &'a mut FrameBuffers,
    pub commit: &'a mut CommitProtocol,
    pub producer: &'a mut dyn FrameProducer,
    pub sampler: &'a mut dyn PerfSampler,
    pub budget: FrameBudget,
    pub format: DrmFourcc,
}

impl FrameLoop<'_> {
    pub fn run(mut self) -> Result<LoopExit, PipelineError> {
        let mut state = LoopState::WarmingUp;
        let mut frame: u64 = 0;
        let mut start = Instant::now();
        let mut reporter = ThroughputReporter::new(start);
        // Previously displayed swap-chain buffer, released (dropped) only
        // once its successor is on screen.
        let mut displayed = None;

        let exit = loop {
            if self.budget.exhausted(frame) {
                break LoopExit::Exhausted;
            }
            if frame == 1 {
                // Restart measurement on the second frame so one-time
                // setup cost stays out of the reported rate.
                start = Instant::now();
                reporter = ThroughputReporter::new(start);
            }

            if let FrameBuffers::Pool { slots, .. } = &*self.buffers {
                let slot = &slots[slot_for_frame(frame, slots.len())];
                if let Some(render) = &slot.imported.render {
                    unsafe {
                        self.render
                            .gl
                            .bind_framebuffer(glow::FRAMEBUFFER, Some(render.fbo));
                    }
                }
            }

            self.sampler.begin();
            self.producer.draw(&self.render.gl, start, frame);
            self.sampler.end();

            // Full pipeline barrier: some drivers do not serialize rendering
            // against a queued flip, and the display must never scan out a
            // buffer whose rendering is still in flight.
            unsafe { self.render.gl.finish() };

            let (fb, front) = match &mut *self.buffers {
                FrameBuffers::Swapchain { surface } => {
                    self.render.swap_buffers()?;
                    let mut front = unsafe { surface.lock_front_buffer() }.map_err(|e| {
                        PipelineError::Runtime(RuntimeError::Gpu(format!(
                            "failed to lock front buffer: {e}"
                        )))
                    })?;
                    let fb = import::framebuffer_for_front(self.card, &mut front, self.format)?;
                    (fb, Some(front))
                }
                FrameBuffers::Pool { slots, .. } => {
                    (slots[slot_for_frame(frame, slots.len())].imported.fb, None)
                }
            };

            if let Some(report) = reporter.maybe_report(frame + 1, Instant::now()) {
                info!(
                    "Rendered {} frames in {:.6} sec ({:.6} fps)",
                    report.frames,
                    report.elapsed.as_secs_f64(),
                    report.fps()
                );
            }

            if input_pending().map_err(|source| RuntimeError::Os {
                what: "polling the control input failed",
                source,
            })? {
                info!("user interrupted!");
                break LoopExit::Interrupted;
            }

            let allow_modeset = state == LoopState::WarmingUp;
            match self.commit.commit(self.card, self.target, fb, allow_modeset)? {
                CommitOutcome::Interrupted => break LoopExit::Interrupted,
                CommitOutcome::Displayed => {}
            }
            if state == LoopState::WarmingUp {
                debug!("First commit done, entering steady state");
                state = LoopState::Steady;
            }

            // Strict in-order rotation: dropping the previous front buffer
            // releases it back to the swap chain.
            displayed = front;
            frame += 1;
        };

        drop(displayed);
        self.sampler.finish();

        let report = reporter.finish(frame, Instant::now());
        info!(
            "Rendered {} frames in {:.6} sec ({:.6} fps)",
            report.frames,
            report.elapsed.as_secs_f64(),
            report.fps()
        );
        self.sampler.dump(report.frames, report.elapsed);
        Ok(exit)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_of_five_runs_exactly_five_frames() {
        let budget = FrameBudget::new(5);
        let mut producer_invocations = 0u32;
        let mut frame = 0u64;
        while !budget.exhausted(frame) {
            producer_invocations += 1;
            frame += 1;
        }
        assert_eq!(producer_invocations, 5);
        assert!(budget.exhausted(5));
    }

    #[test]
    fn test_zero_budget_is_unbounded() {
        let budget = FrameBudget::new(0);
        assert!(!budget.exhausted(0));
        assert!(!budget.exhausted(u64::MAX / 2));
    }

    #[test]
    fn test_reporter_excludes_first_frame() {
        let now = Instant::now();
        let reporter = ThroughputReporter::new(now);
        let report = reporter.finish(1, now + Duration::from_secs(1));
        assert_eq!(report.frames, 0);

        let report = reporter.finish(61, now + Duration::from_secs(1));
        assert_eq!(report.frames, 60);
        assert!((report.fps() - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_reporter_spacing_is_at_least_two_seconds() {
        let now = Instant::now();
        let mut reporter = ThroughputReporter::new(now);

        assert!(reporter.maybe_report(10, now + Duration::from_secs(1)).is_none());
        let first = reporter.maybe_report(121, now + Duration::from_secs(2));
        assert!(first.is_some());
        assert_eq!(first.unwrap().frames, 120);

        // The window restarts after each report.
        assert!(reporter.maybe_report(150, now + Duration::from_secs(3)).is_none());
        assert!(reporter.maybe_report(241, now + Duration::from_secs(4)).is_some());
    }

    #[test]
    fn test_throughput_fps_handles_zero_elapsed() {
        let throughput = Throughput {
            frames: 10,
            elapsed: Duration::ZERO,
        };
        assert_eq!(throughput.fps(), 0.0);
    }
}
