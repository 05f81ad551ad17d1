// src/motion/sink.rs - boundary to the real-time pulse generator

/// One step command, 8 bytes. The pulse generator reads the block as raw
/// bytes with a fixed stride, so the layout is wire-stable.
///
/// Bit layout of the masks: X=0, Y=1, Z=2, the active extruder at its
/// `stepper_command_position`. A set direction bit means positive travel.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PulseCommand {
    /// Axes pulsing on this tick.
    pub step: u8,
    pub direction: u8,
    /// Axes whose step may be dropped when the move is cancelled
    /// mid-flight.
    pub cancellable: u8,
    /// Reserved, always 0.
    pub options: u8,
    /// Ticks until the next command becomes due.
    pub delay: u32,
}

/// The downstream real-time pulse generator. It runs its own thread; the
/// planner only talks to it through this interface.
pub trait PulseSink: Send + Sync {
    /// Hands over one segment's commands. `stride` is the byte distance
    /// between consecutive commands, `tag` identifies the segment for
    /// cancellation, `ticks` is the segment's nominal duration.
    fn push_block(&self, commands: &[PulseCommand], stride: usize, tag: usize, ticks: u64);

    /// Blocks until the sink's buffered move time falls below `ticks`.
    fn wait_until_low_move_time(&self, ticks: u64);

    /// Blocks until the sink has executed everything pushed so far.
    fn wait_until_finished(&self);

    fn run(&self);

    fn stop(&self);

    fn reset(&self);
}
