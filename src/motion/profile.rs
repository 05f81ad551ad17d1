// src/motion/profile.rs - per-axis and per-extruder limit tables

use crate::config::{ExtruderSettings, PlannerSettings};
use crate::motion::{E_AXIS, NUM_AXIS, NUM_MOVING_AXIS, X_AXIS, Z_AXIS};

/// Limits of one extruder, cached in the millimetre/step domain together
/// with the derived step-rate accelerations.
#[derive(Debug, Clone)]
pub struct ExtruderProfile {
    pub max_feedrate: f64,           // mm/s
    pub max_start_feedrate: f64,     // mm/s
    pub max_acceleration: f64,       // mm/s², printing
    pub max_travel_acceleration: f64, // mm/s²
    pub steps_per_mm: f64,
    pub inv_steps_per_mm: f64,
    pub max_print_accel_steps: f64,  // steps/s²
    pub max_travel_accel_steps: f64, // steps/s²
    /// Bit this extruder occupies in the pulse-command step and direction
    /// masks.
    pub stepper_command_position: u8,
}

impl ExtruderProfile {
    pub fn from_settings(settings: &ExtruderSettings, index: usize) -> Self {
        let mut profile = Self {
            max_feedrate: settings.max_feedrate * 1000.0,
            max_start_feedrate: settings.max_start_feedrate * 1000.0,
            max_acceleration: settings.max_print_acceleration * 1000.0,
            max_travel_acceleration: settings.max_travel_acceleration * 1000.0,
            steps_per_mm: settings.axis_steps_per_meter / 1000.0,
            inv_steps_per_mm: 0.0,
            max_print_accel_steps: 0.0,
            max_travel_accel_steps: 0.0,
            stepper_command_position: (index + 3) as u8,
        };
        profile.recompute();
        profile
    }

    pub fn set_max_feedrate(&mut self, rate: f64) {
        self.max_feedrate = rate * 1000.0;
    }

    pub fn set_max_start_feedrate(&mut self, rate: f64) {
        self.max_start_feedrate = rate * 1000.0;
    }

    pub fn set_print_acceleration(&mut self, accel: f64) {
        self.max_acceleration = accel * 1000.0;
        self.recompute();
    }

    pub fn set_travel_acceleration(&mut self, accel: f64) {
        self.max_travel_acceleration = accel * 1000.0;
        self.recompute();
    }

    pub fn set_axis_steps_per_meter(&mut self, steps: f64) {
        self.steps_per_mm = steps / 1000.0;
        self.recompute();
    }

    fn recompute(&mut self) {
        self.inv_steps_per_mm = 1.0 / self.steps_per_mm;
        self.max_print_accel_steps = self.max_acceleration * self.steps_per_mm;
        self.max_travel_accel_steps = self.max_travel_acceleration * self.steps_per_mm;
    }
}

/// Limit tables for the machine frame. The E column mirrors the currently
/// selected extruder and is refreshed by [`MachineProfile::select_extruder`].
#[derive(Debug, Clone)]
pub struct MachineProfile {
    pub max_feedrate: [f64; NUM_AXIS],            // mm/s
    pub max_acceleration: [f64; NUM_AXIS],        // mm/s², printing
    pub max_travel_acceleration: [f64; NUM_AXIS], // mm/s²
    pub steps_per_mm: [f64; NUM_AXIS],
    pub inv_steps_per_mm: [f64; NUM_AXIS],
    pub max_print_accel_steps: [f64; NUM_AXIS],  // steps/s²
    pub max_travel_accel_steps: [f64; NUM_AXIS], // steps/s²
    /// Jerk budget for the XY plane, mm/s.
    pub max_jerk: f64,
    /// Jerk budget for the Z axis, mm/s.
    pub max_z_jerk: f64,
    /// Smallest speed that still integrates stably on X/Y, mm/s.
    pub minimum_speed: f64,
    /// Same bound for Z-primary moves, mm/s.
    pub minimum_z_speed: f64,
    pub extruders: Vec<ExtruderProfile>,
    pub current_extruder: usize,
}

impl MachineProfile {
    pub fn from_settings(settings: &PlannerSettings) -> Self {
        let extruders = settings
            .extruders
            .iter()
            .enumerate()
            .map(|(i, e)| ExtruderProfile::from_settings(e, i))
            .collect();
        let mut profile = Self {
            max_feedrate: [0.0; NUM_AXIS],
            max_acceleration: [0.0; NUM_AXIS],
            max_travel_acceleration: [0.0; NUM_AXIS],
            steps_per_mm: [0.0; NUM_AXIS],
            inv_steps_per_mm: [0.0; NUM_AXIS],
            max_print_accel_steps: [0.0; NUM_AXIS],
            max_travel_accel_steps: [0.0; NUM_AXIS],
            max_jerk: settings.max_xy_jerk * 1000.0,
            max_z_jerk: settings.max_z_jerk * 1000.0,
            minimum_speed: 0.0,
            minimum_z_speed: 0.0,
            extruders,
            current_extruder: 0,
        };
        for axis in 0..NUM_MOVING_AXIS {
            profile.max_feedrate[axis] = settings.max_feedrate[axis] * 1000.0;
            profile.max_acceleration[axis] = settings.max_print_acceleration[axis] * 1000.0;
            profile.max_travel_acceleration[axis] =
                settings.max_travel_acceleration[axis] * 1000.0;
            profile.steps_per_mm[axis] = settings.axis_steps_per_meter[axis] / 1000.0;
        }
        profile.recompute_parameters();
        profile.select_extruder(0);
        profile
    }

    /// The active extruder.
    pub fn current(&self) -> &ExtruderProfile {
        &self.extruders[self.current_extruder]
    }

    /// Selects the active extruder and copies its limits into the E column
    /// of the axis tables.
    pub fn select_extruder(&mut self, index: usize) {
        assert!(index < self.extruders.len(), "extruder index out of range");
        self.current_extruder = index;
        let ext = &self.extruders[index];
        self.max_feedrate[E_AXIS] = ext.max_feedrate;
        self.max_acceleration[E_AXIS] = ext.max_acceleration;
        self.max_travel_acceleration[E_AXIS] = ext.max_travel_acceleration;
        self.steps_per_mm[E_AXIS] = ext.steps_per_mm;
        self.inv_steps_per_mm[E_AXIS] = ext.inv_steps_per_mm;
        self.max_print_accel_steps[E_AXIS] = ext.max_print_accel_steps;
        self.max_travel_accel_steps[E_AXIS] = ext.max_travel_accel_steps;
    }

    pub fn set_max_feedrates(&mut self, rates: &[f64; NUM_MOVING_AXIS]) {
        for axis in 0..NUM_MOVING_AXIS {
            self.max_feedrate[axis] = rates[axis] * 1000.0;
        }
    }

    pub fn set_print_acceleration(&mut self, accel: &[f64; NUM_MOVING_AXIS]) {
        for axis in 0..NUM_MOVING_AXIS {
            self.max_acceleration[axis] = accel[axis] * 1000.0;
        }
        self.recompute_parameters();
    }

    pub fn set_travel_acceleration(&mut self, accel: &[f64; NUM_MOVING_AXIS]) {
        for axis in 0..NUM_MOVING_AXIS {
            self.max_travel_acceleration[axis] = accel[axis] * 1000.0;
        }
        self.recompute_parameters();
    }

    pub fn set_axis_steps_per_meter(&mut self, steps: &[f64; NUM_MOVING_AXIS]) {
        for axis in 0..NUM_MOVING_AXIS {
            self.steps_per_mm[axis] = steps[axis] / 1000.0;
        }
        self.recompute_parameters();
    }

    pub fn set_max_jerk(&mut self, xy_jerk: f64, z_jerk: f64) {
        self.max_jerk = xy_jerk * 1000.0;
        self.max_z_jerk = z_jerk * 1000.0;
    }

    /// Refreshes the derived step-domain values and the minimum stable
    /// speeds after any base limit changed.
    pub fn recompute_parameters(&mut self) {
        for axis in 0..NUM_MOVING_AXIS {
            self.inv_steps_per_mm[axis] = 1.0 / self.steps_per_mm[axis];
            self.max_print_accel_steps[axis] =
                self.max_acceleration[axis] * self.steps_per_mm[axis];
            self.max_travel_accel_steps[axis] =
                self.max_travel_acceleration[axis] * self.steps_per_mm[axis];
        }
        let accel = self.max_acceleration[X_AXIS].max(self.max_travel_acceleration[X_AXIS]);
        self.minimum_speed = accel * (2.0 / (self.steps_per_mm[X_AXIS] * accel)).sqrt();
        let accel = self.max_acceleration[Z_AXIS].max(self.max_travel_acceleration[Z_AXIS]);
        self.minimum_z_speed = accel * (2.0 / (self.steps_per_mm[Z_AXIS] * accel)).sqrt();
    }
}
