//! Move admission and the lookahead trapezoid planner.
//!
//! `queue_move` runs on the caller's thread: it converts the displacement
//! into a Bresenham-ready segment, then revisits the tail of the ring and
//! iteratively relaxes junction speeds under the jerk and acceleration
//! budgets. A dedicated stepping thread consumes completed segments; the
//! planner never touches the segment the stepping thread is executing.

use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use crate::config::{ConfigError, PlannerSettings};
use crate::motion::profile::MachineProfile;
use crate::motion::ring::SegmentRing;
use crate::motion::segment::MoveSegment;
use crate::motion::sink::PulseSink;
use crate::motion::{stepper, E_AXIS, NUM_AXIS, NUM_MOVING_AXIS, X_AXIS, Y_AXIS, Z_AXIS};

pub(crate) struct PlannerShared {
    pub(crate) ring: SegmentRing,
    pub(crate) profile: RwLock<MachineProfile>,
    pub(crate) sink: Arc<dyn PulseSink>,
    pub(crate) f_cpu: u64,
    pub(crate) print_move_buffer_wait_ms: u64,
    pub(crate) min_buffered_move_time_ms: u64,
}

pub struct MotionPlanner {
    shared: Arc<PlannerShared>,
    worker: Option<JoinHandle<()>>,
}

impl MotionPlanner {
    pub fn new(settings: PlannerSettings, sink: Arc<dyn PulseSink>) -> Result<Self, ConfigError> {
        settings.validate()?;
        let profile = MachineProfile::from_settings(&settings);
        tracing::info!(
            extruders = settings.extruders.len(),
            cache = settings.move_cache_size,
            "motion planner configured"
        );
        Ok(Self {
            shared: Arc::new(PlannerShared {
                ring: SegmentRing::new(settings.move_cache_size),
                profile: RwLock::new(profile),
                sink,
                f_cpu: settings.f_cpu,
                print_move_buffer_wait_ms: settings.print_move_buffer_wait_ms,
                min_buffered_move_time_ms: settings.min_buffered_move_time_ms,
            }),
            worker: None,
        })
    }

    /// Starts the pulse sink, then the stepping thread.
    pub fn run_thread(&mut self) {
        self.shared.ring.clear_stop();
        self.shared.sink.run();
        let shared = Arc::clone(&self.shared);
        self.worker = Some(
            std::thread::Builder::new()
                .name("pulseplan-stepper".into())
                .spawn(move || stepper::run(&shared))
                .expect("failed to spawn stepping thread"),
        );
        tracing::info!("stepping thread started");
    }

    /// Stops the sink and the stepping thread. Pending segments in the
    /// ring are not executed.
    pub fn stop_thread(&mut self, join: bool) {
        self.shared.sink.stop();
        self.shared.ring.request_stop();
        if join {
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
                tracing::info!("stepping thread stopped");
            }
        }
    }

    /// Blocks until the ring is drained and the pulse sink reports idle.
    pub fn wait_until_finished(&self) {
        self.shared.ring.wait_until_drained();
        if !self.shared.ring.stopped() {
            self.shared.sink.wait_until_finished();
        }
    }

    pub fn reset(&self) {
        self.shared.sink.reset();
    }

    /// Number of segments currently queued.
    pub fn queue_length(&self) -> usize {
        self.shared.ring.count()
    }

    // configuration, SI units in

    pub fn set_max_feedrates(&self, rates: [f64; NUM_MOVING_AXIS]) {
        self.shared.profile.write().unwrap().set_max_feedrates(&rates);
    }

    pub fn set_print_acceleration(&self, accel: [f64; NUM_MOVING_AXIS]) {
        self.shared.profile.write().unwrap().set_print_acceleration(&accel);
    }

    pub fn set_travel_acceleration(&self, accel: [f64; NUM_MOVING_AXIS]) {
        self.shared.profile.write().unwrap().set_travel_acceleration(&accel);
    }

    pub fn set_axis_steps_per_meter(&self, steps: [f64; NUM_MOVING_AXIS]) {
        self.shared.profile.write().unwrap().set_axis_steps_per_meter(&steps);
    }

    pub fn set_max_jerk(&self, xy_jerk: f64, z_jerk: f64) {
        self.shared.profile.write().unwrap().set_max_jerk(xy_jerk, z_jerk);
    }

    pub fn set_extruder_max_feedrate(&self, index: usize, rate: f64) {
        let mut profile = self.shared.profile.write().unwrap();
        profile.extruders[index].set_max_feedrate(rate);
        if profile.current_extruder == index {
            profile.select_extruder(index);
        }
    }

    pub fn set_extruder_max_start_feedrate(&self, index: usize, rate: f64) {
        self.shared.profile.write().unwrap().extruders[index].set_max_start_feedrate(rate);
    }

    pub fn set_extruder_print_acceleration(&self, index: usize, accel: f64) {
        let mut profile = self.shared.profile.write().unwrap();
        profile.extruders[index].set_print_acceleration(accel);
        if profile.current_extruder == index {
            profile.select_extruder(index);
        }
    }

    pub fn set_extruder_travel_acceleration(&self, index: usize, accel: f64) {
        let mut profile = self.shared.profile.write().unwrap();
        profile.extruders[index].set_travel_acceleration(accel);
        if profile.current_extruder == index {
            profile.select_extruder(index);
        }
    }

    pub fn set_extruder_steps_per_meter(&self, index: usize, steps: f64) {
        let mut profile = self.shared.profile.write().unwrap();
        profile.extruders[index].set_axis_steps_per_meter(steps);
        if profile.current_extruder == index {
            profile.select_extruder(index);
        }
    }

    /// Selects the active extruder; its limits become the E axis limits.
    pub fn set_extruder(&self, index: usize) {
        self.shared.profile.write().unwrap().select_extruder(index);
    }

    /// Queues one move. `axis_diff` is the signed displacement in metres,
    /// `num_steps` the per-axis step counts already rounded by the caller,
    /// `speed` the commanded feedrate in m/s.
    ///
    /// Blocks while the ring is full. Returns without queueing when a stop
    /// was requested; a move with no steps on any axis is dropped.
    pub fn queue_move(
        &self,
        mut axis_diff: [f64; NUM_AXIS],
        num_steps: [u32; NUM_AXIS],
        speed: f64,
        cancelable: bool,
        optimize: bool,
    ) {
        let Some(write) = self.shared.ring.wait_for_room() else {
            return;
        };
        let profile = self.shared.profile.read().unwrap();
        {
            let mut guard = self.shared.ring.segment(write);
            let segment = &mut *guard;
            let wait_ms = if optimize {
                self.shared.print_move_buffer_wait_ms
            } else {
                0
            };
            segment.prepare(speed * 1000.0, cancelable, wait_ms);

            for axis in 0..NUM_AXIS {
                axis_diff[axis] *= 1000.0;
                segment.delta[axis] = num_steps[axis];
                if axis_diff[axis] >= 0.0 {
                    segment.set_positive_direction(axis);
                }
                if segment.delta[axis] != 0 {
                    segment.set_move_of_axis(axis);
                }
            }

            if segment.is_no_move() {
                tracing::warn!("dropping move with no steps on any axis");
                return;
            }

            // The tie-broken priority decides which axis drives the DDA on
            // equal-delta diagonals.
            let d = segment.delta;
            segment.primary_axis = if d[Y_AXIS] > d[X_AXIS] && d[Y_AXIS] > d[Z_AXIS] && d[Y_AXIS] > d[E_AXIS] {
                Y_AXIS
            } else if d[X_AXIS] > d[Z_AXIS] && d[X_AXIS] > d[E_AXIS] {
                X_AXIS
            } else if d[Z_AXIS] > d[E_AXIS] {
                Z_AXIS
            } else {
                E_AXIS
            };
            segment.steps_remaining = segment.delta[segment.primary_axis];

            segment.distance = if segment.is_xyz_move() {
                let xy_dist2 = axis_diff[X_AXIS] * axis_diff[X_AXIS]
                    + axis_diff[Y_AXIS] * axis_diff[Y_AXIS];
                let dist2 = if segment.is_z_move() {
                    xy_dist2 + axis_diff[Z_AXIS] * axis_diff[Z_AXIS]
                } else {
                    xy_dist2
                };
                dist2.sqrt().max(axis_diff[E_AXIS].abs())
            } else {
                axis_diff[E_AXIS].abs()
            };

            calculate_move(&profile, self.shared.f_cpu, segment, &axis_diff);
        }
        self.update_trapezoids(&profile, write);
        drop(profile);
        self.shared.ring.publish();
        tracing::debug!(slot = write, "queued move");
    }

    /// Propagates reachable junction speeds across the ring after a new
    /// segment has been filled, before the counter is bumped.
    ///
    /// Walks back to the last segment with a fixed end speed, then runs the
    /// backward and forward relaxation passes over the mutable window. The
    /// currently executing segment is never touched.
    pub(crate) fn update_trapezoids(&self, profile: &MachineProfile, write: usize) {
        let ring = &self.shared.ring;
        let mut maxfirst = ring.head_index();
        if maxfirst != write {
            maxfirst = ring.next_index(maxfirst);
        }
        let mut first = write;
        while first != maxfirst && !ring.segment(first).end_speed_fixed {
            first = ring.prev_index(first);
        }
        if first != write && ring.segment(first).end_speed_fixed {
            first = ring.next_index(first);
        }
        if first == write {
            // nothing older to relax against
            ring.block(write);
            {
                let mut segment = ring.segment(write);
                segment.start_speed_fixed = true;
                segment.update_steps_parameter();
            }
            ring.unblock(write);
            return;
        }

        ring.block(first);
        let previous_index = ring.prev_index(write);
        {
            let mut previous_guard = ring.segment(previous_index);
            let mut current_guard = ring.segment(write);
            let previous = &mut *previous_guard;
            let current = &mut *current_guard;

            // a z-move boundary is never blended
            if (previous.primary_axis == Z_AXIS) != (current.primary_axis == Z_AXIS) {
                previous.end_speed_fixed = true;
                current.start_speed_fixed = true;
                current.update_steps_parameter();
                drop(current_guard);
                drop(previous_guard);
                ring.unblock(first);
                return;
            }

            compute_max_junction_speed(profile, previous, current);

            // neither is a pure extruder move, or both are
            if previous.is_e_only_move() != current.is_e_only_move() {
                previous.end_speed_fixed = true;
                current.start_speed_fixed = true;
                current.update_steps_parameter();
                drop(current_guard);
                drop(previous_guard);
                ring.unblock(first);
                return;
            }
        }

        self.backward_pass(write, first);
        self.forward_pass(first, write);

        // refresh the step parameters over the touched range, releasing
        // each segment as soon as it is done so the stepping thread can
        // pick up finished work early
        let mut index = first;
        while index != write {
            ring.segment(index).update_steps_parameter();
            ring.unblock(index);
            let next = ring.next_index(index);
            ring.block(next);
            index = next;
        }
        ring.segment(write).update_steps_parameter();
        ring.unblock(write);
    }

    /// Walks from the newest segment down to `last`, lowering entry speeds
    /// to what deceleration can actually absorb.
    fn backward_pass(&self, start: usize, last: usize) {
        let ring = &self.shared.ring;
        let mut index = start;
        let mut last_junction_speed = ring.segment(start).end_speed;
        while index != last {
            let previous_index = ring.prev_index(index);
            let mut act_guard = ring.segment(index);
            let mut previous_guard = ring.segment(previous_index);
            let act = &mut *act_guard;
            let previous = &mut *previous_guard;

            // what the junction could reach if we decelerate through act
            last_junction_speed = if act.nominal {
                act.full_speed
            } else {
                (last_junction_speed * last_junction_speed + act.acceleration_distance2).sqrt()
            };
            if last_junction_speed >= previous.max_junction_speed {
                if previous.end_speed != previous.max_junction_speed {
                    previous.invalidate_parameters();
                    previous.end_speed = previous.min_speed.max(previous.max_junction_speed);
                }
                if act.start_speed != previous.max_junction_speed {
                    act.start_speed = act.min_speed.max(previous.max_junction_speed);
                    act.invalidate_parameters();
                }
                last_junction_speed = previous.end_speed;
            } else {
                act.start_speed = act.min_speed.max(last_junction_speed);
                last_junction_speed = last_junction_speed.max(previous.min_speed);
                previous.end_speed = last_junction_speed;
                previous.invalidate_parameters();
                act.invalidate_parameters();
            }
            drop(act_guard);
            drop(previous_guard);
            index = previous_index;
        }
    }

    /// Walks from `first` towards the newest segment, raising exit speeds
    /// to what acceleration allows and pinning junctions that reached
    /// their ceiling.
    fn forward_pass(&self, first: usize, write: usize) {
        let ring = &self.shared.ring;
        let mut index = first;
        let mut left_speed = ring.segment(first).start_speed;
        while index != write {
            let act_index = index;
            index = ring.next_index(index);
            let mut act_guard = ring.segment(act_index);
            let mut next_guard = ring.segment(index);
            let act = &mut *act_guard;
            let next = &mut *next_guard;

            let mut vmax_right = if act.nominal {
                act.full_speed
            } else {
                (left_speed * left_speed + act.acceleration_distance2).sqrt()
            };
            if vmax_right > act.end_speed {
                // the backward pass clamped this junction
                if left_speed < act.min_speed {
                    left_speed = act.min_speed;
                    act.end_speed =
                        (left_speed * left_speed + act.acceleration_distance2).sqrt();
                }
                act.start_speed = left_speed;
                left_speed = act
                    .end_speed
                    .min(act.max_junction_speed)
                    .max(next.min_speed);
                next.start_speed = left_speed;
                if act.end_speed == act.max_junction_speed {
                    act.end_speed_fixed = true;
                    next.start_speed_fixed = true;
                }
                act.invalidate_parameters();
            } else {
                // full acceleration fits in the line, nothing can improve it
                act.fix_start_and_end_speed();
                act.invalidate_parameters();
                if act.min_speed > left_speed {
                    left_speed = act.min_speed;
                    vmax_right =
                        (left_speed * left_speed + act.acceleration_distance2).sqrt();
                }
                act.start_speed = left_speed;
                act.end_speed = act.min_speed.max(vmax_right);
                left_speed = act
                    .end_speed
                    .min(act.max_junction_speed)
                    .max(next.min_speed);
                next.start_speed = left_speed;
                next.start_speed_fixed = true;
            }
        }
        let mut newest = ring.segment(write);
        newest.start_speed = newest.min_speed.max(left_speed);
    }
}

impl Drop for MotionPlanner {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop_thread(true);
        }
    }
}

impl std::fmt::Debug for MotionPlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MotionPlanner")
            .field("queue_length", &self.shared.ring.count())
            .field("running", &self.worker.is_some())
            .finish()
    }
}

/// Parameterises a freshly admitted segment: per-axis speeds at the
/// limiting interval, the primary-axis acceleration that violates no
/// per-axis cap, and the safe boundary speeds.
fn calculate_move(
    profile: &MachineProfile,
    f_cpu: u64,
    segment: &mut MoveSegment,
    axis_diff: &[f64; NUM_AXIS],
) {
    let ticks_per_second = f_cpu as f64;
    let mut axis_interval = [0.0f64; NUM_AXIS];

    // the minimum-speed floor keeps the explicit integration stable
    let speed = if segment.is_x_or_y_move() {
        profile.minimum_speed.max(segment.speed)
    } else {
        segment.speed
    };
    let time_for_move = ticks_per_second * segment.distance / speed;
    segment.time_in_ticks = time_for_move as u64;

    // slowest interval that violates no axis feedrate cap
    let mut limit_interval = time_for_move / segment.steps_remaining as f64;
    for axis in 0..NUM_AXIS {
        if segment.is_move(axis) {
            // mm * ticks/s / (mm/s * steps) = ticks/step
            axis_interval[axis] = axis_diff[axis].abs() * ticks_per_second
                / (profile.max_feedrate[axis] * segment.steps_remaining as f64);
            limit_interval = limit_interval.max(axis_interval[axis]);
        }
    }
    segment.full_interval = limit_interval as u64;

    let time_for_move = segment.full_interval as f64 * segment.steps_remaining as f64;
    let inv_time_s = ticks_per_second / time_for_move;
    for axis in 0..NUM_AXIS {
        if segment.is_move(axis) {
            axis_interval[axis] = time_for_move / segment.delta[axis] as f64;
            segment.axis_speeds[axis] = axis_diff[axis] * inv_time_s;
        } else {
            segment.axis_speeds[axis] = 0.0;
        }
    }
    segment.full_speed = segment.distance * inv_time_s;

    // the slowest axis to reach its plateau bounds the shared acceleration
    let accel = if segment.is_e_positive_move() {
        &profile.max_print_accel_steps
    } else {
        &profile.max_travel_accel_steps
    };
    let mut slowest_axis_plateau = f64::MAX;
    for axis in 0..NUM_AXIS {
        if segment.is_move(axis) {
            // ticks/step * steps/s² = ticks/s²
            slowest_axis_plateau = slowest_axis_plateau.min(axis_interval[axis] * accel[axis]);
        }
    }

    segment.error = [(segment.delta[segment.primary_axis] >> 1) as i64; NUM_AXIS];
    segment.inv_full_speed = 1.0 / segment.full_speed;
    segment.acceleration_prim =
        (slowest_axis_plateau / axis_interval[segment.primary_axis]) as u64;
    segment.f_acceleration =
        (262144.0 * segment.acceleration_prim as f64 / ticks_per_second) as u64;
    segment.acceleration_distance2 =
        2.0 * segment.distance * slowest_axis_plateau * segment.full_speed / ticks_per_second;

    let safe = safe_speed(profile, segment);
    segment.start_speed = safe;
    segment.end_speed = safe;
    segment.min_speed = safe;
    // can it reach full speed within the line?
    if segment.start_speed * segment.start_speed + segment.acceleration_distance2
        >= segment.full_speed * segment.full_speed
    {
        segment.nominal = true;
    }
    segment.v_max = f_cpu / segment.full_interval;
}

/// Largest entry/exit speed for a segment taken in isolation, without any
/// junction assistance.
fn safe_speed(profile: &MachineProfile, segment: &MoveSegment) -> f64 {
    let mut safe = profile.max_jerk * 0.5;

    if segment.is_z_move() {
        let z_speed = segment.axis_speeds[Z_AXIS].abs();
        if segment.primary_axis == Z_AXIS {
            safe = profile.max_z_jerk * 0.5 * segment.full_speed / z_speed;
        } else if z_speed > profile.max_z_jerk * 0.5 {
            safe = safe.min(profile.max_z_jerk * 0.5 * segment.full_speed / z_speed);
        }
    }

    if segment.is_e_move() {
        let max_start = profile.current().max_start_feedrate;
        if segment.is_xyz_move() {
            safe = safe
                .min(0.5 * max_start * segment.full_speed / segment.axis_speeds[E_AXIS].abs());
        } else {
            // a retraction or prime
            safe = 0.5 * max_start;
        }
    }

    if segment.primary_axis == X_AXIS || segment.primary_axis == Y_AXIS {
        safe = safe.max(profile.minimum_speed);
    } else if segment.primary_axis == Z_AXIS {
        safe = safe.max(profile.minimum_z_speed);
    }
    safe.min(segment.full_speed)
}

/// Largest junction speed between two adjacent segments that stays inside
/// every jerk budget, stored on the earlier segment.
fn compute_max_junction_speed(
    profile: &MachineProfile,
    previous: &mut MoveSegment,
    current: &MoveSegment,
) {
    let dx = current.axis_speeds[X_AXIS] - previous.axis_speeds[X_AXIS];
    let dy = current.axis_speeds[Y_AXIS] - previous.axis_speeds[Y_AXIS];
    let mut factor = 1.0;
    let jerk = (dx * dx + dy * dy).sqrt();
    if jerk > profile.max_jerk {
        factor = profile.max_jerk / jerk;
    }
    if previous.is_z_move() || current.is_z_move() {
        let dz = (current.axis_speeds[Z_AXIS] - previous.axis_speeds[Z_AXIS]).abs();
        if dz > profile.max_z_jerk {
            factor = f64::min(factor, profile.max_z_jerk / dz);
        }
    }
    let e_jerk = (current.axis_speeds[E_AXIS] - previous.axis_speeds[E_AXIS]).abs();
    let max_start = profile.current().max_start_feedrate;
    if e_jerk > max_start {
        factor = f64::min(factor, max_start / e_jerk);
    }
    previous.max_junction_speed = (previous.full_speed * factor).min(current.full_speed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtruderSettings, PlannerSettings};
    use crate::motion::sink::PulseCommand;
    use float_cmp::approx_eq;

    struct NullSink;

    impl PulseSink for NullSink {
        fn push_block(&self, _commands: &[PulseCommand], _stride: usize, _tag: usize, _ticks: u64) {}
        fn wait_until_low_move_time(&self, _ticks: u64) {}
        fn wait_until_finished(&self) {}
        fn run(&self) {}
        fn stop(&self) {}
        fn reset(&self) {}
    }

    fn test_settings() -> PlannerSettings {
        PlannerSettings {
            f_cpu: 200_000_000,
            move_cache_size: 8,
            max_feedrate: [0.3, 0.3, 0.3],
            max_print_acceleration: [3.0, 3.0, 3.0],
            max_travel_acceleration: [3.0, 3.0, 3.0],
            axis_steps_per_meter: [80_000.0, 80_000.0, 80_000.0],
            max_xy_jerk: 0.02,
            max_z_jerk: 0.0003,
            extruders: vec![ExtruderSettings {
                max_feedrate: 0.3,
                max_start_feedrate: 0.04,
                max_print_acceleration: 3.0,
                max_travel_acceleration: 3.0,
                axis_steps_per_meter: 80_000.0,
            }],
            ..PlannerSettings::default()
        }
    }

    // queueing without run_thread leaves segments in the ring for
    // inspection; nothing consumes them
    fn planner() -> MotionPlanner {
        MotionPlanner::new(test_settings(), Arc::new(NullSink)).unwrap()
    }

    #[test]
    fn primary_axis_tie_breaking() {
        let planner = planner();
        let step = 0.000125; // 10 steps at 80 steps/mm
        planner.queue_move([step; 4], [10, 10, 10, 10], 0.01, false, false);
        planner.queue_move([step, step, 0.0, 0.0], [10, 10, 0, 0], 0.01, false, false);
        planner.queue_move([0.0, step, 0.0, 0.0], [0, 10, 0, 0], 0.01, false, false);
        planner.queue_move([step, step, step, 0.0], [10, 10, 10, 0], 0.01, false, false);
        assert_eq!(planner.shared.ring.segment(0).primary_axis, E_AXIS);
        assert_eq!(planner.shared.ring.segment(1).primary_axis, X_AXIS);
        assert_eq!(planner.shared.ring.segment(2).primary_axis, Y_AXIS);
        assert_eq!(planner.shared.ring.segment(3).primary_axis, Z_AXIS);
    }

    #[test]
    fn construction_rejects_invalid_settings() {
        let mut settings = test_settings();
        settings.extruders.clear();
        assert!(MotionPlanner::new(settings, Arc::new(NullSink)).is_err());
    }

    #[test]
    fn degenerate_move_is_dropped() {
        let planner = planner();
        planner.queue_move([0.0; 4], [0; 4], 0.05, false, false);
        assert_eq!(planner.queue_length(), 0);
    }

    #[test]
    fn single_x_move_parameterisation() {
        let planner = planner();
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);
        let segment = planner.shared.ring.segment(0);
        assert_eq!(segment.primary_axis, X_AXIS);
        assert_eq!(segment.steps_remaining, 800);
        assert!(approx_eq!(f64, segment.distance, 10.0));
        assert!(approx_eq!(f64, segment.full_speed, 50.0, epsilon = 1e-9));
        assert_eq!(segment.full_interval, 50_000);
        assert_eq!(segment.v_max, 4000);
        assert_eq!(segment.time_in_ticks, 40_000_000);
        assert_eq!(segment.acceleration_prim, 240_000);
        assert!(approx_eq!(
            f64,
            segment.acceleration_distance2,
            60_000.0,
            epsilon = 1e-6
        ));
        // safe speed is half the xy jerk budget
        assert!(approx_eq!(f64, segment.min_speed, 10.0, epsilon = 1e-9));
        assert!(approx_eq!(f64, segment.start_speed, 10.0, epsilon = 1e-9));
        assert!(segment.nominal);
        assert!(segment.start_speed_fixed);
        assert_eq!(segment.error, [400; 4]);
    }

    // The segment at the head index may already be executing, so the
    // planner never blends the very first junction of an idle ring. Each
    // test therefore queues a lead-in move and inspects the pair behind it.

    #[test]
    fn collinear_moves_blend_at_full_speed() {
        let planner = planner();
        for _ in 0..3 {
            planner.queue_move([0.005, 0.0, 0.0, 0.0], [400, 0, 0, 0], 0.05, false, false);
        }
        let first = planner.shared.ring.segment(1);
        let second = planner.shared.ring.segment(2);
        assert!(approx_eq!(f64, first.max_junction_speed, 50.0, epsilon = 1e-9));
        assert!(approx_eq!(f64, first.end_speed, 50.0, epsilon = 1e-9));
        assert!(approx_eq!(f64, second.start_speed, 50.0, epsilon = 1e-9));
        assert!(first.nominal);
        assert!(second.nominal);
    }

    #[test]
    fn right_angle_corner_is_jerk_limited() {
        let planner = planner();
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);
        planner.queue_move([0.0, 0.01, 0.0, 0.0], [0, 800, 0, 0], 0.05, false, false);
        let first = planner.shared.ring.segment(1);
        let second = planner.shared.ring.segment(2);
        // jerk = sqrt(50² + 50²) ≈ 70.7 mm/s, factor = 20 / 70.7
        let expected = 50.0 * 20.0 / (50.0f64 * 50.0 + 50.0 * 50.0).sqrt();
        assert!(approx_eq!(f64, first.max_junction_speed, expected, epsilon = 1e-9));
        assert!(approx_eq!(f64, first.end_speed, expected, epsilon = 1e-9));
        assert!(approx_eq!(f64, second.start_speed, expected, epsilon = 1e-9));
        // the junction speeds actually adopted stay inside the budget
        let scale_prev = first.end_speed / first.full_speed;
        let scale_cur = second.start_speed / second.full_speed;
        let dx = second.axis_speeds[X_AXIS] * scale_cur - first.axis_speeds[X_AXIS] * scale_prev;
        let dy = second.axis_speeds[Y_AXIS] * scale_cur - first.axis_speeds[Y_AXIS] * scale_prev;
        assert!((dx * dx + dy * dy).sqrt() <= 20.0 + 1e-6);
    }

    #[test]
    fn z_transition_pins_the_junction() {
        let planner = planner();
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);
        planner.queue_move([0.0, 0.0, 0.001, 0.0], [0, 0, 80, 0], 0.002, false, false);
        let first = planner.shared.ring.segment(1);
        let second = planner.shared.ring.segment(2);
        assert!(first.end_speed_fixed);
        assert!(second.start_speed_fixed);
        // the xy move still ends at its own safe speed
        assert!(approx_eq!(f64, first.end_speed, 10.0, epsilon = 1e-9));
    }

    #[test]
    fn opposed_retractions_use_the_full_e_jerk_budget() {
        let planner = planner();
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);
        planner.queue_move([0.0, 0.0, 0.0, -0.002], [0, 0, 0, 160], 0.03, false, false);
        planner.queue_move([0.0, 0.0, 0.0, 0.002], [0, 0, 0, 160], 0.03, false, false);
        let first = planner.shared.ring.segment(1);
        let second = planner.shared.ring.segment(2);
        assert!(approx_eq!(f64, first.axis_speeds[E_AXIS], -30.0, epsilon = 1e-3));
        assert!(approx_eq!(f64, second.axis_speeds[E_AXIS], 30.0, epsilon = 1e-3));
        // the junction clamps the reversal to the extruder start feedrate
        assert!(approx_eq!(f64, first.max_junction_speed, 20.0, epsilon = 1e-6));
        assert!(approx_eq!(f64, first.end_speed, 20.0, epsilon = 1e-6));
        assert!(approx_eq!(f64, second.start_speed, 20.0, epsilon = 1e-6));
        let e_jerk = (second.start_speed / second.full_speed * second.axis_speeds[E_AXIS]
            - first.end_speed / first.full_speed * first.axis_speeds[E_AXIS])
            .abs();
        assert!(e_jerk <= 40.0 + 1e-6);
    }

    #[test]
    fn acceleration_table_follows_extruder_direction() {
        let mut settings = test_settings();
        settings.max_travel_acceleration = [1.0, 1.0, 1.0];
        settings.extruders[0].max_travel_acceleration = 1.0;
        let planner = MotionPlanner::new(settings, Arc::new(NullSink)).unwrap();
        // priming move uses the print table
        planner.queue_move([0.01, 0.0, 0.0, 0.001], [800, 0, 0, 80], 0.05, false, false);
        // retracting move uses the travel table
        planner.queue_move([0.01, 0.0, 0.0, -0.001], [800, 0, 0, 80], 0.05, false, false);
        assert_eq!(planner.shared.ring.segment(0).acceleration_prim, 240_000);
        assert_eq!(planner.shared.ring.segment(1).acceleration_prim, 80_000);
    }

    #[test]
    fn replanning_without_new_segments_is_a_fixed_point() {
        let planner = planner();
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);
        planner.queue_move([0.0, 0.01, 0.0, 0.0], [0, 800, 0, 0], 0.05, false, false);
        planner.queue_move([0.01, 0.0, 0.0, 0.0], [800, 0, 0, 0], 0.05, false, false);

        let snapshot = |index: usize| {
            let segment = planner.shared.ring.segment(index);
            (
                segment.start_speed,
                segment.end_speed,
                segment.max_junction_speed,
                segment.v_start,
                segment.v_end,
                segment.accel_steps,
                segment.decel_steps,
                segment.nominal,
            )
        };
        let before: Vec<_> = (0..3).map(snapshot).collect();
        {
            let profile = planner.shared.profile.read().unwrap();
            planner.update_trapezoids(&profile, 2);
        }
        let after: Vec<_> = (0..3).map(snapshot).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn junction_invariants_hold_along_a_chain() {
        let planner = planner();
        let moves: [[f64; 2]; 5] = [
            [0.01, 0.0],
            [0.0, 0.01],
            [-0.005, 0.0],
            [0.0, -0.01],
            [0.008, 0.002],
        ];
        for [dx, dy] in moves {
            let sx = (dx.abs() * 80_000.0).round() as u32;
            let sy = (dy.abs() * 80_000.0).round() as u32;
            planner.queue_move([dx, dy, 0.0, 0.0], [sx, sy, 0, 0], 0.05, false, false);
        }
        for i in 0..4 {
            let previous = planner.shared.ring.segment(i);
            let current = planner.shared.ring.segment(i + 1);
            let scale_prev = previous.end_speed / previous.full_speed;
            let scale_cur = current.start_speed / current.full_speed;
            let dx = current.axis_speeds[X_AXIS] * scale_cur
                - previous.axis_speeds[X_AXIS] * scale_prev;
            let dy = current.axis_speeds[Y_AXIS] * scale_cur
                - previous.axis_speeds[Y_AXIS] * scale_prev;
            let jerk = (dx * dx + dy * dy).sqrt();
            // boundary speeds may sit at the numerical-stability floor,
            // which is allowed to spend slightly more than the budget
            let floor = planner.shared.profile.read().unwrap().minimum_speed;
            assert!(
                jerk <= 20.0 + 2.0 * floor + 1e-6,
                "junction {i} spends {jerk} mm/s"
            );
            assert!(previous.min_speed <= previous.end_speed + 1e-9);
            assert!(previous.end_speed <= previous.full_speed + 1e-9);
            assert!(current.min_speed <= current.start_speed + 1e-9);
            assert!(current.start_speed <= current.full_speed + 1e-9);
        }
    }
}
