// src/motion/ring.rs - bounded ring of move segments shared between the
// producer/planner thread and the stepping thread

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::motion::segment::MoveSegment;

struct SegmentSlot {
    /// Set while the planner is rewriting this segment. The stepping
    /// thread refuses to consume a blocked head and backs off.
    blocked: AtomicBool,
    segment: Mutex<MoveSegment>,
}

struct RingState {
    /// Next segment to execute.
    head: usize,
    /// Next slot to fill.
    write: usize,
    count: usize,
    stop: bool,
}

/// Fixed-size circular buffer of segments. Indices, the fill counter and
/// the stop flag share one mutex with a single condition; it is held only
/// around counter mutation and the blocking waits.
pub(crate) struct SegmentRing {
    slots: Box<[SegmentSlot]>,
    state: Mutex<RingState>,
    available: Condvar,
}

impl SegmentRing {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| SegmentSlot {
                blocked: AtomicBool::new(false),
                segment: Mutex::new(MoveSegment::default()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            state: Mutex::new(RingState {
                head: 0,
                write: 0,
                count: 0,
                stop: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn next_index(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    pub fn prev_index(&self, index: usize) -> usize {
        (index + self.slots.len() - 1) % self.slots.len()
    }

    pub fn segment(&self, index: usize) -> MutexGuard<'_, MoveSegment> {
        self.slots[index].segment.lock().unwrap()
    }

    pub fn block(&self, index: usize) {
        self.slots[index].blocked.store(true, Ordering::Release);
    }

    pub fn unblock(&self, index: usize) {
        self.slots[index].blocked.store(false, Ordering::Release);
    }

    pub fn is_blocked(&self, index: usize) -> bool {
        self.slots[index].blocked.load(Ordering::Acquire)
    }

    pub fn head_index(&self) -> usize {
        self.state.lock().unwrap().head
    }

    pub fn count(&self) -> usize {
        self.state.lock().unwrap().count
    }

    pub fn stopped(&self) -> bool {
        self.state.lock().unwrap().stop
    }

    /// Blocks until a slot is free, returning its index, or `None` once a
    /// stop was requested.
    pub fn wait_for_room(&self) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let state = self
            .available
            .wait_while(state, |s| s.count >= self.slots.len() && !s.stop)
            .unwrap();
        if state.stop {
            None
        } else {
            Some(state.write)
        }
    }

    /// Publishes the segment at the write index: advances the index,
    /// bumps the counter and wakes the stepping thread.
    pub fn publish(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.write = (state.write + 1) % self.slots.len();
            state.count += 1;
        }
        self.available.notify_all();
    }

    /// Blocks until a segment is queued, returning the head index, or
    /// `None` once a stop was requested.
    pub fn wait_for_work(&self) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let state = self
            .available
            .wait_while(state, |s| s.count == 0 && !s.stop)
            .unwrap();
        if state.stop {
            None
        } else {
            Some(state.head)
        }
    }

    /// Lookahead fill-up: while the ring is under half full and the head
    /// move opted in, wait up to `wait` for more segments, as long as the
    /// count keeps growing. Fill-up mode re-arms once the ring drains to a
    /// single segment.
    pub fn fill_up_wait(&self, head_waits: bool, wait: Duration, refill: &mut bool) {
        let mut state = self.state.lock().unwrap();
        let half = self.slots.len() / 2;
        if state.count < half && head_waits && *refill {
            loop {
                let last_count = state.count;
                tracing::debug!(count = last_count, "waiting for the move buffer to fill up");
                let (guard, _timeout) = self
                    .available
                    .wait_timeout_while(state, wait, |s| s.count <= last_count && !s.stop)
                    .unwrap();
                state = guard;
                if !(last_count < state.count && state.count < half && !state.stop) {
                    break;
                }
            }
            *refill = false;
        }
        if state.count <= 1 {
            *refill = true;
        }
    }

    /// Retires the head segment after its block was pushed to the sink.
    pub fn complete_head(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.head = (state.head + 1) % self.slots.len();
            state.count -= 1;
        }
        self.available.notify_all();
    }

    pub fn wait_until_drained(&self) {
        let state = self.state.lock().unwrap();
        let _state = self
            .available
            .wait_while(state, |s| s.count != 0 && !s.stop)
            .unwrap();
    }

    pub fn request_stop(&self) {
        self.state.lock().unwrap().stop = true;
        self.available.notify_all();
    }

    pub fn clear_stop(&self) {
        self.state.lock().unwrap().stop = false;
    }
}
