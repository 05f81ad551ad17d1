// src/motion/stepper.rs - stepping engine worker
//
// Consumes completed segments from the head of the ring, synthesises one
// pulse command per step with a Bresenham DDA across the non-primary axes
// and a discrete velocity integration for the timing, and hands the block
// to the pulse sink.

use std::mem;
use std::time::Duration;

use crate::motion::planner::PlannerShared;
use crate::motion::sink::PulseCommand;
use crate::motion::{E_AXIS, NUM_AXIS};

/// A reused command buffer is reallocated once it over-allocates by more
/// than this many entries.
const EXCESS_COMMAND_CAPACITY: usize = 1024 * 1024;

/// Velocity gained after `timer` ticks at the fixed-point acceleration.
fn compute_v(timer: u64, f_acceleration: u64) -> u64 {
    ((timer >> 8) * f_acceleration) >> 10
}

fn pulse_bit(axis: usize, extruder_bit: u8) -> u8 {
    if axis == E_AXIS {
        extruder_bit
    } else {
        axis as u8
    }
}

pub(crate) fn run(shared: &PlannerShared) {
    let f_cpu = shared.f_cpu;
    let mut refill = true;
    loop {
        let Some(head) = shared.ring.wait_for_work() else {
            break;
        };

        // give the lookahead a chance to accumulate more moves before the
        // head starts executing
        let head_waits = shared.ring.segment(head).wait_ms > 0;
        shared.ring.fill_up_wait(
            head_waits,
            Duration::from_millis(shared.print_move_buffer_wait_ms),
            &mut refill,
        );
        if shared.ring.stopped() {
            break;
        }

        if shared.ring.is_blocked(head) {
            // the planner is mid-update on this segment
            tracing::warn!(slot = head, "head segment is blocked, backing off");
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }

        let extruder_bit = shared.profile.read().unwrap().current().stepper_command_position;

        let mut guard = shared.ring.segment(head);
        let segment = &mut *guard;
        segment.fix_start_and_end_speed();
        if !segment.parameters_up_to_date {
            segment.update_steps_parameter();
        }

        let steps = segment.steps_remaining as usize;
        if segment.commands.capacity() < steps
            || segment.commands.capacity() - steps > EXCESS_COMMAND_CAPACITY
        {
            segment.commands = Vec::with_capacity(steps);
        }
        segment.commands.clear();

        let mut direction_mask = 0u8;
        let mut cancellable_mask = 0u8;
        for axis in 0..NUM_AXIS {
            if segment.is_positive_move(axis) {
                direction_mask |= 1 << pulse_bit(axis, extruder_bit);
            }
            if segment.cancelable && segment.is_move(axis) {
                cancellable_mask |= 1 << pulse_bit(axis, extruder_bit);
            }
        }

        let error_wrap = segment.delta[segment.primary_axis] as i64;
        let mut v_max_reached = segment.v_start;
        let mut timer_accel = 0u64;
        let mut timer_decel = 0u64;

        for step_number in 0..segment.steps_remaining {
            let mut step_mask = 0u8;
            for axis in 0..NUM_AXIS {
                if segment.is_move(axis) {
                    segment.error[axis] -= segment.delta[axis] as i64;
                    if segment.error[axis] < 0 {
                        step_mask |= 1 << pulse_bit(axis, extruder_bit);
                        segment.error[axis] += error_wrap;
                    }
                }
            }

            let interval = if segment.accelerating(step_number) {
                v_max_reached = (compute_v(timer_accel, segment.f_acceleration)
                    + segment.v_start)
                    .min(segment.v_max);
                let interval = f_cpu / v_max_reached;
                timer_accel += interval;
                interval
            } else if segment.decelerating(step_number) {
                let dv = compute_v(timer_decel, segment.f_acceleration);
                // past the ramp the integration overshoots, land on v_end
                let v = if dv > v_max_reached {
                    segment.v_end
                } else {
                    (v_max_reached - dv).max(segment.v_end)
                };
                let interval = f_cpu / v;
                timer_decel += interval;
                interval
            } else {
                segment.full_interval
            };
            assert!(interval < 4 * f_cpu, "step interval out of range");

            segment.commands.push(PulseCommand {
                step: step_mask,
                direction: direction_mask,
                cancellable: cancellable_mask,
                options: 0,
                delay: interval as u32,
            });
        }

        // let the sink drain before handing over more work, so the
        // lookahead window stays as full as possible
        shared
            .sink
            .wait_until_low_move_time((f_cpu / 1000) * shared.min_buffered_move_time_ms);

        tracing::debug!(
            slot = head,
            start_speed = segment.start_speed,
            end_speed = segment.end_speed,
            steps = segment.steps_remaining,
            "sending step block"
        );
        shared.sink.push_block(
            &segment.commands,
            mem::size_of::<PulseCommand>(),
            head,
            segment.time_in_ticks,
        );

        drop(guard);
        shared.ring.complete_head();
    }
}
