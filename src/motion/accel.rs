// src/motion/accel.rs - Acceleration profile generator
//
// Turns a single straight-line move into an ordered list of integer
// micro-segments approximating a trapezoidal or triangular velocity
// curve. Pure: no clocks, no IO, never panics on any input.
use crate::config::{AxisSettings, SpeedSettings};
use crate::motion::Point;

/// One planned micro-move: whole-step deltas plus an integer duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionSegment {
    pub dx: i64,
    pub dy: i64,
    pub duration_ms: u64,
}

/// Axis velocities below this (steps per ms) emit zero for that axis in
/// the segment; the running projection absorbs the deficit later.
const AXIS_VELOCITY_FLOOR: f64 = 0.002;

/// Plan the micro-segments for a move from `src` to `dst`.
///
/// The pen-down profile is used when the pen is down, and borrowed for
/// sub-threshold pen-up moves. Segment displacements always sum to the
/// per-axis rounded total; durations are clamped to >= 1 ms. Axis
/// inversion and motor swap are applied last, to the emitted deltas.
/// A zero-distance move yields an empty list.
pub fn plan_segments(
    src: Point,
    dst: Point,
    pen_down: bool,
    speed: &SpeedSettings,
    axis: &AxisSettings,
) -> Vec<MotionSegment> {
    let vx = dst.x - src.x;
    let vy = dst.y - src.y;
    let distance = (vx * vx + vy * vy).sqrt();
    if !(distance > 0.0) {
        return Vec::new();
    }

    let drawing = pen_down || distance < speed.short_move_threshold_steps;
    let slice = speed.time_slice_ms.max(1.0);
    let max_v = speed.active_steps_per_ms(drawing).max(1e-6);
    let accel_time = speed.accel_time_ms(drawing).max(slice);
    let accel_rate = max_v / accel_time;
    // Distance the discretized full ramp actually covers. The trapezoid
    // decision must use this, not the continuous 0.5*maxV*tAccel
    // estimate: when tAccel/slice rounds up, two continuous-estimate
    // ramps would overshoot the move and force a reversing flush
    // segment at the end.
    let intervals = (accel_time / slice).round().max(1.0) as u32;
    let ramp_covered = 0.5 * max_v * slice * intervals as f64;

    let mut emitter = SegmentEmitter::new(vx / distance, vy / distance);

    if distance < speed.min_segment_steps {
        // Degenerate: one constant-velocity segment at half speed.
        let v = max_v / 2.0;
        emitter.push(distance, distance / v);
    } else if distance > 2.0 * ramp_covered {
        // Trapezoid: full ramp, optional cruise, symmetric ramp-down.
        for i in 1..=intervals {
            let v = i as f64 * max_v / (intervals as f64 + 1.0);
            emitter.push(v * slice, slice);
        }
        let cruise = distance - 2.0 * ramp_covered;
        if cruise > max_v * slice {
            emitter.push(cruise, cruise / max_v);
        }
        for i in (1..=intervals).rev() {
            let v = i as f64 * max_v / (intervals as f64 + 1.0);
            emitter.push(v * slice, slice);
        }
    } else {
        // Triangle: accelerate to a reduced peak, then straight back down.
        let t_accel = (4.0 * accel_rate * distance).sqrt() / (2.0 * accel_rate);
        let v_peak = accel_rate * t_accel;
        let intervals = (t_accel / slice).floor() as u32;
        if intervals < 2 {
            // Too short to subdivide: constant velocity at half peak.
            let v = (v_peak / 2.0).max(1e-6);
            emitter.push(distance, distance / v);
        } else {
            for i in 1..=intervals {
                let v = i as f64 * v_peak / (intervals as f64 + 1.0);
                emitter.push(v * slice, slice);
            }
            for i in (1..=intervals).rev() {
                let v = i as f64 * v_peak / (intervals as f64 + 1.0);
                emitter.push(v * slice, slice);
            }
        }
    }

    let mut segments = emitter.finish(vx, vy);
    apply_axis_settings(&mut segments, axis);
    segments
}

/// Total scheduled time for a list of segments.
pub fn total_duration_ms(segments: &[MotionSegment]) -> u64 {
    segments.iter().map(|s| s.duration_ms).sum()
}

/// Tracks the running fractional projection of the move vector so that
/// rounding never accumulates: each segment emits the difference between
/// the rounded cumulative position and what was already emitted.
struct SegmentEmitter {
    ux: f64,
    uy: f64,
    travelled: f64,
    emitted_x: i64,
    emitted_y: i64,
    segments: Vec<MotionSegment>,
}

impl SegmentEmitter {
    fn new(ux: f64, uy: f64) -> Self {
        Self {
            ux,
            uy,
            travelled: 0.0,
            emitted_x: 0,
            emitted_y: 0,
            segments: Vec::new(),
        }
    }

    fn push(&mut self, along: f64, duration_ms: f64) {
        self.travelled += along;
        let target_x = (self.travelled * self.ux).round() as i64;
        let target_y = (self.travelled * self.uy).round() as i64;
        let duration = duration_ms.max(1.0).round() as u64;

        let mut dx = target_x - self.emitted_x;
        let mut dy = target_y - self.emitted_y;
        if (dx.abs() as f64) / (duration as f64) < AXIS_VELOCITY_FLOOR {
            dx = 0;
        } else {
            self.emitted_x = target_x;
        }
        if (dy.abs() as f64) / (duration as f64) < AXIS_VELOCITY_FLOOR {
            dy = 0;
        } else {
            self.emitted_y = target_y;
        }

        self.segments.push(MotionSegment {
            dx,
            dy,
            duration_ms: duration,
        });
    }

    /// Flush the remainder so segment sums hit the rounded totals exactly.
    fn finish(mut self, total_x: f64, total_y: f64) -> Vec<MotionSegment> {
        let rx = total_x.round() as i64 - self.emitted_x;
        let ry = total_y.round() as i64 - self.emitted_y;
        if rx != 0 || ry != 0 {
            match self.segments.last_mut() {
                Some(last) => {
                    last.dx += rx;
                    last.dy += ry;
                }
                None => self.segments.push(MotionSegment {
                    dx: rx,
                    dy: ry,
                    duration_ms: 1,
                }),
            }
        }
        self.segments
    }
}

fn apply_axis_settings(segments: &mut [MotionSegment], axis: &AxisSettings) {
    for seg in segments.iter_mut() {
        if axis.invert_x {
            seg.dx = -seg.dx;
        }
        if axis.invert_y {
            seg.dy = -seg.dy;
        }
        if axis.swap_motors {
            std::mem::swap(&mut seg.dx, &mut seg.dy);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AxisSettings, SpeedSettings};

    fn sum_segments(segments: &[MotionSegment]) -> (i64, i64) {
        segments
            .iter()
            .fold((0, 0), |(x, y), s| (x + s.dx, y + s.dy))
    }

    #[test]
    fn test_zero_distance_returns_empty() {
        let segs = plan_segments(
            Point::new(10.0, 10.0),
            Point::new(10.0, 10.0),
            true,
            &SpeedSettings::default(),
            &AxisSettings::default(),
        );
        assert!(segs.is_empty());
    }

    #[test]
    fn test_worked_example_exact_sum() {
        // Park (0,0) -> (100,100), min 50 max 500 sps, pen down.
        let speed = SpeedSettings {
            min_sps: 50.0,
            max_sps: 500.0,
            ..SpeedSettings::default()
        };
        let segs = plan_segments(
            Point::new(0.0, 0.0),
            Point::new(100.0, 100.0),
            true,
            &speed,
            &AxisSettings::default(),
        );
        assert!(!segs.is_empty());
        assert_eq!(sum_segments(&segs), (100, 100));
        for seg in &segs {
            assert!(seg.duration_ms >= 1);
        }
    }

    #[test]
    fn test_exact_sum_across_profiles() {
        let speed = SpeedSettings::default();
        let axis = AxisSettings::default();
        let cases = [
            (3.0, 2.0),        // degenerate
            (40.0, -25.0),     // triangle
            (-300.0, 170.0),   // triangle, mixed signs
            (5000.0, 2500.0),  // trapezoid with cruise
            (1200.0, -1100.0), // trapezoid
        ];
        for (x, y) in cases {
            for pen_down in [true, false] {
                let segs = plan_segments(
                    Point::new(0.0, 0.0),
                    Point::new(x, y),
                    pen_down,
                    &speed,
                    &axis,
                );
                assert!(!segs.is_empty(), "no segments for ({x},{y})");
                let want = (x.round() as i64, y.round() as i64);
                assert_eq!(sum_segments(&segs), want, "sum mismatch for ({x},{y})");
            }
        }
    }

    #[test]
    fn test_short_move_returns_at_least_one_segment() {
        let speed = SpeedSettings::default();
        let segs = plan_segments(
            Point::new(0.0, 0.0),
            Point::new(2.0, 0.0),
            false,
            &speed,
            &AxisSettings::default(),
        );
        assert_eq!(segs.len(), 1);
        assert_eq!(sum_segments(&segs), (2, 0));
    }

    #[test]
    fn test_long_move_has_ramp_cruise_ramp() {
        let speed = SpeedSettings::default();
        let segs = plan_segments(
            Point::new(0.0, 0.0),
            Point::new(10000.0, 0.0),
            false,
            &speed,
            &AxisSettings::default(),
        );
        // A long move must produce more than the two ramps' worth of
        // slices only if a cruise fits; either way it is many segments.
        assert!(segs.len() > 10);
        // Ramp-up starts slower than the middle of the move.
        let first = segs.first().unwrap();
        let mid = segs[segs.len() / 2];
        assert!(first.dx.abs() <= mid.dx.abs());
        assert_eq!(sum_segments(&segs), (10000, 0));
    }

    #[test]
    fn test_axis_inversion_and_swap_applied_last() {
        let speed = SpeedSettings::default();
        let axis = AxisSettings {
            invert_x: true,
            invert_y: false,
            swap_motors: true,
        };
        let segs = plan_segments(
            Point::new(0.0, 0.0),
            Point::new(60.0, 20.0),
            true,
            &speed,
            &axis,
        );
        // invert_x then swap: emitted (dx,dy) = (dy, -dx) of the raw plan.
        assert_eq!(sum_segments(&segs), (20, -60));
    }

    #[test]
    fn test_rounded_up_ramp_never_reverses_direction() {
        // accel_time/slice = 16.6 rounds to 17 intervals; with the
        // continuous ramp estimate this move classified as trapezoid,
        // the ramps overshot 630 steps and the flush segment ran
        // backwards through the line being drawn.
        let speed = SpeedSettings {
            accel_time_drawing_ms: 415.0,
            time_slice_ms: 25.0,
            ..SpeedSettings::default()
        };
        let segs = plan_segments(
            Point::new(0.0, 0.0),
            Point::new(630.0, 0.0),
            true,
            &speed,
            &AxisSettings::default(),
        );
        assert_eq!(sum_segments(&segs), (630, 0));
        for (i, seg) in segs.iter().enumerate() {
            assert!(seg.dx >= 0, "segment {i} reverses direction: dx={}", seg.dx);
            assert_eq!(seg.dy, 0);
        }
    }

    #[test]
    fn test_durations_strictly_positive_and_total_increases() {
        let speed = SpeedSettings::default();
        let segs = plan_segments(
            Point::new(0.0, 0.0),
            Point::new(100.0, 100.0),
            true,
            &speed,
            &AxisSettings::default(),
        );
        let mut elapsed = 0u64;
        for seg in &segs {
            let next = elapsed + seg.duration_ms;
            assert!(next > elapsed);
            elapsed = next;
        }
        assert_eq!(elapsed, total_duration_ms(&segs));
    }
}
