//! Planner configuration.
//!
//! All values are accepted in SI units: metres, m/s, m/s² and steps per
//! metre. Conversion into the internal millimetre/step domain happens when
//! the settings are applied to the limit tables.
//!
//! ## Example: TOML configuration
//!
//! ```toml
//! f_cpu = 200000000
//! move_cache_size = 32
//! max_feedrate = [0.3, 0.3, 0.02]
//! max_xy_jerk = 0.02
//! max_z_jerk = 0.0003
//!
//! [[extruders]]
//! max_feedrate = 0.05
//! max_start_feedrate = 0.04
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::motion::NUM_MOVING_AXIS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerSettings {
    /// Reference tick frequency of the pulse generator, in Hz.
    pub f_cpu: u64,
    /// Capacity of the segment ring. At least 8; a power of two keeps the
    /// index wrap cheap.
    pub move_cache_size: usize,
    /// How long the stepping thread may hold an optimize-tagged head move
    /// back while waiting for the ring to fill, in milliseconds.
    pub print_move_buffer_wait_ms: u64,
    /// Low-water mark handed to the pulse sink, in milliseconds of
    /// buffered move time.
    pub min_buffered_move_time_ms: u64,
    /// Per-axis feedrate ceiling (X, Y, Z), m/s.
    pub max_feedrate: [f64; NUM_MOVING_AXIS],
    /// Per-axis printing acceleration (X, Y, Z), m/s².
    pub max_print_acceleration: [f64; NUM_MOVING_AXIS],
    /// Per-axis travel acceleration (X, Y, Z), m/s².
    pub max_travel_acceleration: [f64; NUM_MOVING_AXIS],
    /// Steps per metre for each moving axis.
    pub axis_steps_per_meter: [f64; NUM_MOVING_AXIS],
    /// Jerk budget for the XY plane, m/s.
    pub max_xy_jerk: f64,
    /// Jerk budget for the Z axis, m/s.
    pub max_z_jerk: f64,
    pub extruders: Vec<ExtruderSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtruderSettings {
    /// Feedrate ceiling, m/s.
    pub max_feedrate: f64,
    /// Largest speed the extruder may be jerked to from standstill, m/s.
    pub max_start_feedrate: f64,
    /// Printing acceleration, m/s².
    pub max_print_acceleration: f64,
    /// Travel acceleration, m/s².
    pub max_travel_acceleration: f64,
    /// Steps per metre of filament.
    pub axis_steps_per_meter: f64,
}

impl Default for PlannerSettings {
    fn default() -> Self {
        Self {
            f_cpu: 200_000_000,
            move_cache_size: 32,
            print_move_buffer_wait_ms: 250,
            min_buffered_move_time_ms: 100,
            max_feedrate: [0.3, 0.3, 0.02],
            max_print_acceleration: [3.0, 3.0, 0.1],
            max_travel_acceleration: [3.0, 3.0, 0.1],
            axis_steps_per_meter: [80_000.0, 80_000.0, 400_000.0],
            max_xy_jerk: 0.02,
            max_z_jerk: 0.0003,
            extruders: vec![ExtruderSettings::default()],
        }
    }
}

impl Default for ExtruderSettings {
    fn default() -> Self {
        Self {
            max_feedrate: 0.05,
            max_start_feedrate: 0.04,
            max_print_acceleration: 3.0,
            max_travel_acceleration: 3.0,
            axis_steps_per_meter: 500_000.0,
        }
    }
}

impl PlannerSettings {
    /// Loads settings from a TOML file and validates them.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every limit the planner divides by or scales with. Called
    /// before construction so a bad machine description fails before any
    /// thread starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.f_cpu == 0 {
            return Err(ConfigError::Invalid("f_cpu must be non-zero".into()));
        }
        if self.move_cache_size < 8 {
            return Err(ConfigError::Invalid(format!(
                "move_cache_size must be at least 8, got {}",
                self.move_cache_size
            )));
        }
        if self.extruders.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one extruder must be configured".into(),
            ));
        }
        for axis in 0..NUM_MOVING_AXIS {
            if self.max_feedrate[axis] <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "max_feedrate[{axis}] must be positive"
                )));
            }
            if self.max_print_acceleration[axis] <= 0.0 || self.max_travel_acceleration[axis] <= 0.0
            {
                return Err(ConfigError::Invalid(format!(
                    "acceleration limits for axis {axis} must be positive"
                )));
            }
            if self.axis_steps_per_meter[axis] <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "axis_steps_per_meter[{axis}] must be positive"
                )));
            }
        }
        if self.max_xy_jerk <= 0.0 || self.max_z_jerk <= 0.0 {
            return Err(ConfigError::Invalid("jerk budgets must be positive".into()));
        }
        for (i, extruder) in self.extruders.iter().enumerate() {
            if extruder.max_feedrate <= 0.0
                || extruder.max_start_feedrate <= 0.0
                || extruder.max_print_acceleration <= 0.0
                || extruder.max_travel_acceleration <= 0.0
                || extruder.axis_steps_per_meter <= 0.0
            {
                return Err(ConfigError::Invalid(format!(
                    "extruder {i} limits must all be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_validate() {
        assert!(PlannerSettings::default().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let settings: PlannerSettings = toml::from_str(
            r#"
            f_cpu = 100000000
            max_xy_jerk = 0.015

            [[extruders]]
            max_feedrate = 0.08
            "#,
        )
        .unwrap();
        assert_eq!(settings.f_cpu, 100_000_000);
        assert_eq!(settings.max_xy_jerk, 0.015);
        assert_eq!(settings.move_cache_size, 32);
        assert_eq!(settings.extruders.len(), 1);
        assert_eq!(settings.extruders[0].max_feedrate, 0.08);
        assert_eq!(settings.extruders[0].max_start_feedrate, 0.04);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn loads_settings_from_a_file() {
        let path = std::env::temp_dir().join("pulseplan_settings_test.toml");
        std::fs::write(&path, "f_cpu = 150000000\nmove_cache_size = 16\n").unwrap();
        let settings = PlannerSettings::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(settings.f_cpu, 150_000_000);
        assert_eq!(settings.move_cache_size, 16);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = PlannerSettings::from_file("/nonexistent/pulseplan.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn rejects_missing_extruders() {
        let mut settings = PlannerSettings::default();
        settings.extruders.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_small_cache() {
        let mut settings = PlannerSettings::default();
        settings.move_cache_size = 4;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_zero_steps_per_meter() {
        let mut settings = PlannerSettings::default();
        settings.axis_steps_per_meter[1] = 0.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn rejects_negative_extruder_acceleration() {
        let mut settings = PlannerSettings::default();
        settings.extruders[0].max_print_acceleration = -1.0;
        assert!(settings.validate().is_err());
    }
}
