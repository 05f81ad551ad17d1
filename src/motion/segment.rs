// src/motion/segment.rs - one queued move and its planner state

use crate::motion::sink::PulseCommand;
use crate::motion::{E_AXIS, NUM_AXIS, Z_AXIS};

/// Kinematic description of one queued move.
///
/// `dir` is a bitmask: bit `axis` is set when the axis moves, bit
/// `axis + 4` when its direction is positive. Speeds are millimetres per
/// second, intervals are ticks of the reference clock per step.
#[derive(Debug, Default)]
pub struct MoveSegment {
    // geometry
    pub delta: [u32; NUM_AXIS],
    pub dir: u8,
    pub primary_axis: usize,
    pub steps_remaining: u32,
    /// Cartesian distance for XY/XYZ moves, |dE| for pure extrusion, mm.
    pub distance: f64,

    // kinematics
    pub speed: f64,
    pub full_speed: f64,
    pub inv_full_speed: f64,
    pub full_interval: u64,
    /// Signed per-axis speed at full speed.
    pub axis_speeds: [f64; NUM_AXIS],
    /// Acceleration along the primary axis, steps/s².
    pub acceleration_prim: u64,
    /// 2·a·distance, mm²/s².
    pub acceleration_distance2: f64,
    /// Fixed-point acceleration used by the stepping integrator:
    /// 262144·acceleration_prim/f_cpu.
    pub f_acceleration: u64,
    pub v_max: u64,
    pub time_in_ticks: u64,

    // planner state
    pub start_speed: f64,
    pub end_speed: f64,
    pub min_speed: f64,
    pub max_junction_speed: f64,
    pub v_start: u64,
    pub v_end: u64,
    pub accel_steps: u32,
    pub decel_steps: u32,

    // flags
    pub start_speed_fixed: bool,
    pub end_speed_fixed: bool,
    pub parameters_up_to_date: bool,
    pub nominal: bool,
    /// Pre-buffered pipeline priming move; the planner skips it.
    pub warmup: bool,
    pub cancelable: bool,
    pub wait_ms: u64,

    // Bresenham accumulators, one per axis
    pub error: [i64; NUM_AXIS],

    /// Step command buffer, retained across reuse of the slot.
    pub commands: Vec<PulseCommand>,
}

impl MoveSegment {
    /// Resets the planning state for a fresh admission. The command buffer
    /// survives so the stepping thread can reuse the allocation.
    pub fn prepare(&mut self, speed_mm_s: f64, cancelable: bool, wait_ms: u64) {
        self.speed = speed_mm_s;
        self.dir = 0;
        self.start_speed_fixed = false;
        self.end_speed_fixed = false;
        self.parameters_up_to_date = false;
        self.nominal = false;
        self.warmup = false;
        self.cancelable = cancelable;
        self.wait_ms = wait_ms;
        self.max_junction_speed = 0.0;
    }

    pub fn set_move_of_axis(&mut self, axis: usize) {
        self.dir |= 1 << axis;
    }

    pub fn set_positive_direction(&mut self, axis: usize) {
        self.dir |= 1 << (axis + 4);
    }

    pub fn is_move(&self, axis: usize) -> bool {
        self.dir & (1 << axis) != 0
    }

    pub fn is_positive_move(&self, axis: usize) -> bool {
        self.is_move(axis) && self.dir & (1 << (axis + 4)) != 0
    }

    pub fn is_no_move(&self) -> bool {
        self.dir & 0x0f == 0
    }

    pub fn is_xyz_move(&self) -> bool {
        self.dir & 0b0111 != 0
    }

    pub fn is_x_or_y_move(&self) -> bool {
        self.dir & 0b0011 != 0
    }

    pub fn is_z_move(&self) -> bool {
        self.is_move(Z_AXIS)
    }

    pub fn is_e_move(&self) -> bool {
        self.is_move(E_AXIS)
    }

    pub fn is_e_positive_move(&self) -> bool {
        self.is_positive_move(E_AXIS)
    }

    pub fn is_e_only_move(&self) -> bool {
        self.is_e_move() && !self.is_xyz_move()
    }

    pub fn fix_start_and_end_speed(&mut self) {
        self.start_speed_fixed = true;
        self.end_speed_fixed = true;
    }

    pub fn invalidate_parameters(&mut self) {
        self.parameters_up_to_date = false;
    }

    /// True while `step_number` lies on the acceleration ramp.
    pub fn accelerating(&self, step_number: u32) -> bool {
        step_number < self.accel_steps
    }

    /// True once `step_number` has entered the deceleration ramp.
    pub fn decelerating(&self, step_number: u32) -> bool {
        step_number >= self.steps_remaining.saturating_sub(self.decel_steps)
    }

    /// Derives the step-domain ramp lengths from the boundary speeds.
    ///
    /// When both ramps together would overshoot the move, the profile is
    /// trimmed down to a peak with no cruise phase; the ramps never sum to
    /// more than `steps_remaining` afterwards.
    pub fn update_steps_parameter(&mut self) {
        if self.parameters_up_to_date || self.warmup {
            return;
        }
        let start_factor = self.start_speed * self.inv_full_speed;
        let end_factor = self.end_speed * self.inv_full_speed;
        self.v_start = (self.v_max as f64 * start_factor) as u64;
        self.v_end = (self.v_max as f64 * end_factor) as u64;
        let vmax2 = self.v_max * self.v_max;
        let twice_accel = self.acceleration_prim << 1;
        // +1 covers the truncation of the integer division
        self.accel_steps = ((vmax2 - self.v_start * self.v_start) / twice_accel) as u32 + 1;
        self.decel_steps = ((vmax2 - self.v_end * self.v_end) / twice_accel) as u32 + 1;
        if self.accel_steps + self.decel_steps >= self.steps_remaining {
            let reduction = (self.accel_steps + self.decel_steps + 2 - self.steps_remaining) >> 1;
            self.accel_steps -= reduction.min(self.accel_steps);
            self.decel_steps -= reduction.min(self.decel_steps);
            self.decel_steps = self
                .decel_steps
                .min(self.steps_remaining.saturating_sub(self.accel_steps));
        }
        self.parameters_up_to_date = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::{X_AXIS, Y_AXIS};

    #[test]
    fn direction_bits_are_independent_of_move_bits() {
        let mut segment = MoveSegment::default();
        segment.set_move_of_axis(X_AXIS);
        segment.set_positive_direction(Y_AXIS);
        assert!(segment.is_move(X_AXIS));
        assert!(!segment.is_positive_move(X_AXIS));
        // a direction bit without the move bit is not a positive move
        assert!(!segment.is_positive_move(Y_AXIS));
        assert!(!segment.is_no_move());
        assert!(segment.is_x_or_y_move());
        assert!(!segment.is_z_move());
        assert!(!segment.is_e_only_move());
    }

    #[test]
    fn e_only_move_detection() {
        let mut segment = MoveSegment::default();
        segment.set_move_of_axis(E_AXIS);
        assert!(segment.is_e_only_move());
        segment.set_move_of_axis(X_AXIS);
        assert!(!segment.is_e_only_move());
    }

    fn ramp_segment(steps: u32, start: f64, end: f64) -> MoveSegment {
        let mut segment = MoveSegment {
            steps_remaining: steps,
            full_speed: 50.0,
            inv_full_speed: 1.0 / 50.0,
            v_max: 4000,
            acceleration_prim: 240_000,
            start_speed: start,
            end_speed: end,
            min_speed: 10.0,
            ..MoveSegment::default()
        };
        segment.update_steps_parameter();
        segment
    }

    #[test]
    fn ramp_lengths_for_a_long_move() {
        let segment = ramp_segment(800, 10.0, 10.0);
        assert_eq!(segment.v_start, 800);
        assert_eq!(segment.v_end, 800);
        assert_eq!(segment.accel_steps, 33);
        assert_eq!(segment.decel_steps, 33);
        assert!(segment.parameters_up_to_date);
        assert!(segment.accelerating(32));
        assert!(!segment.accelerating(33));
        assert!(segment.decelerating(767));
        assert!(!segment.decelerating(766));
    }

    #[test]
    fn overshooting_ramps_are_trimmed_to_a_peak() {
        let segment = ramp_segment(40, 0.0, 0.0);
        // untrimmed both ramps would be 34 steps
        assert_eq!(segment.accel_steps, 19);
        assert_eq!(segment.decel_steps, 19);
        assert!(segment.accel_steps + segment.decel_steps <= 40);
    }

    #[test]
    fn one_sided_trim_never_exceeds_the_move() {
        // start at full speed, long deceleration demand on a short move
        let segment = ramp_segment(20, 50.0, 0.0);
        assert!(segment.accel_steps + segment.decel_steps <= 20);
        assert_eq!(segment.decel_steps, 20);
    }

    #[test]
    fn warmup_segments_keep_stale_parameters() {
        let mut segment = ramp_segment(800, 10.0, 10.0);
        segment.invalidate_parameters();
        segment.warmup = true;
        segment.start_speed = 25.0;
        segment.update_steps_parameter();
        assert!(!segment.parameters_up_to_date);
        assert_eq!(segment.v_start, 800);
    }
}
