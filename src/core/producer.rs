//! Frame producer seam.
//!
//! The pipeline invokes the producer exactly once per frame, before the
//! GPU barrier, with the currently bound render target. What gets drawn is
//! the producer's business; the built-in one just sweeps the clear color
//! so a running pipeline is visible without any shader payload.

use std::time::Instant;

/// Renders one frame into the currently bound render target.
pub trait FrameProducer {
    fn draw(&mut self, gl: &glow::Context, start: Instant, frame: u64);
}

/// Built-in producer: full-screen clear cycling through the color wheel.
pub struct ColorSweep {
    width: u32,
    height: u32,
}

impl ColorSweep {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FrameProducer for ColorSweep {
    fn draw(&mut self, gl: &glow::Context, _start: Instant, frame: u64) {
        use glow::HasContext;

        let phase = (frame % 240) as f32 / 240.0;
        let (r, g, b) = wheel(phase);
        unsafe {
            gl.viewport(0, 0, self.width as i32, self.height as i32);
            gl.clear_color(r, g, b, 1.0);
            gl.clear(glow::COLOR_BUFFER_BIT);
        }
    }
}

/// Map a phase in [0, 1) onto a smooth RGB cycle.
pub(crate) fn wheel(phase: f32) -> (f32, f32, f32) {
    let angle = phase * std::f32::consts::TAU;
    let component = |shift: f32| 0.5 + 0.5 * (angle + shift).sin();
    (
        component(0.0),
        component(std::f32::consts::TAU / 3.0),
        component(2.0 * std::f32::consts::TAU / 3.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wheel_stays_in_unit_range() {
        for i in 0..240 {
            let (r, g, b) = wheel(i as f32 / 240.0);
            for c in [r, g, b] {
                assert!((0.0..=1.0).contains(&c), "component {c} out of range");
            }
        }
    }

    #[test]
    fn test_wheel_cycles() {
        let (r0, g0, b0) = wheel(0.0);
        let (r1, g1, b1) = wheel(1.0);
        assert!((r0 - r1).abs() < 1e-5);
        assert!((g0 - g1).abs() < 1e-5);
        assert!((b0 - b1).abs() < 1e-5);
    }
}
