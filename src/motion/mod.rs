// motion: segment model, admission, lookahead planner and stepping engine

pub mod planner;
pub mod profile;
pub mod ring;
pub mod segment;
pub mod sink;
pub mod stepper;

/// Axes handled by the planner: three moving axes plus the active extruder.
pub const NUM_AXIS: usize = 4;
/// Moving axes of the machine frame (X, Y, Z).
pub const NUM_MOVING_AXIS: usize = 3;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;
pub const E_AXIS: usize = 3;
