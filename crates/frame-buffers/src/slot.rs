use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

struct SlotState<T> {
    frame: Option<T>,
    dropped: u64,
}

/// Single-frame slot with drop-oldest semantics.
///
/// `put_nowait` always succeeds and replaces any frame the consumer has not
/// taken yet. `get` waits on a condition variable until a frame is present.
/// A single mutex guards both sides; the critical sections only move an
/// `Option`.
pub struct FrameSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T: Clone> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                frame: None,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    /// Store `frame`, discarding any unconsumed predecessor. Never blocks on
    /// the consumer.
    pub fn put_nowait(&self, frame: T) {
        let mut state = self.state.lock();
        if state.frame.replace(frame).is_some() {
            state.dropped += 1;
            trace!(dropped = state.dropped, "frame slot overwrote unconsumed frame");
        }
        drop(state);
        self.ready.notify_all();
    }

    /// Take the current frame, waiting up to `timeout` for one to arrive.
    ///
    /// `None` as timeout waits indefinitely. Returns `None` if the wait timed
    /// out with the slot still empty.
    pub fn get(&self, timeout: Option<Duration>) -> Option<T> {
        let mut state = self.state.lock();
        wait_for_frame(&self.ready, &mut state, timeout, |s| s.frame.is_some());
        state.frame.take()
    }

    /// Peek at the current frame without removing it.
    ///
    /// A slow consumer that re-reads the same frame does not fall back into
    /// the blocking wait path.
    pub fn get_nowait(&self) -> Option<T> {
        self.state.lock().frame.clone()
    }

    /// Drop any pending frame.
    pub fn clear(&self) {
        self.state.lock().frame = None;
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().frame.is_none()
    }

    /// Number of frames overwritten before a consumer took them.
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

impl<T: Clone> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Block on `cond` until `ready(state)` holds or the timeout elapses.
pub(crate) fn wait_for_frame<S>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, S>,
    timeout: Option<Duration>,
    ready: impl Fn(&S) -> bool,
) {
    let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
    // A timeout too large to represent as an instant degrades to an unbounded wait.
    while !ready(&**guard) {
        match deadline {
            Some(deadline) => {
                if cond.wait_until(guard, deadline).timed_out() {
                    return;
                }
            }
            None => cond.wait(guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_latest_frame_wins() {
        let slot = FrameSlot::new();
        slot.put_nowait("a");
        slot.put_nowait("b");
        assert_eq!(slot.get(Some(Duration::from_millis(10))), Some("b"));
        assert_eq!(slot.dropped(), 1);
    }

    #[test]
    fn test_get_times_out_when_empty() {
        let slot: FrameSlot<u32> = FrameSlot::new();
        let start = Instant::now();
        assert_eq!(slot.get(Some(Duration::from_millis(30))), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_get_removes_but_peek_does_not() {
        let slot = FrameSlot::new();
        slot.put_nowait(1);
        assert_eq!(slot.get_nowait(), Some(1));
        assert_eq!(slot.get_nowait(), Some(1));
        assert_eq!(slot.get(Some(Duration::ZERO)), Some(1));
        assert!(slot.is_empty());
        assert_eq!(slot.get_nowait(), None);
    }

    #[test]
    fn test_clear_empties_slot() {
        let slot = FrameSlot::new();
        slot.put_nowait(5);
        slot.clear();
        assert_eq!(slot.get_nowait(), None);
    }

    #[test]
    fn test_blocked_consumer_is_woken_by_producer() {
        let slot = Arc::new(FrameSlot::new());
        let consumer = {
            let slot = slot.clone();
            thread::spawn(move || slot.get(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        slot.put_nowait(42u64);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn test_producer_never_blocks_under_slow_consumer() {
        let slot = Arc::new(FrameSlot::new());
        let producer = {
            let slot = slot.clone();
            thread::spawn(move || {
                for i in 0..10_000u64 {
                    slot.put_nowait(i);
                }
            })
        };
        producer.join().unwrap();
        assert_eq!(slot.get(None), Some(9_999));
    }
}
