//! Motion-planning core for a 3D printer host.
//!
//! Accepts logical moves (per-axis displacement plus a commanded feedrate),
//! runs them through a lookahead trapezoid planner that bounds every
//! junction by the configured jerk budgets, and emits one pulse command per
//! step to a downstream real-time pulse generator.
//!
//! The external API is strictly SI (metres, m/s, m/s²); everything is
//! converted to the millimetre/step domain on admission.

pub mod config;
pub mod motion;

pub use config::{ConfigError, ExtruderSettings, PlannerSettings};
pub use motion::planner::MotionPlanner;
pub use motion::sink::{PulseCommand, PulseSink};
