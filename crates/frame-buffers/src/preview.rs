use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::slot::wait_for_frame;

struct PreviewState<T> {
    slots: [Option<T>; 2],
    write_index: usize,
    has_data: bool,
}

impl<T> PreviewState<T> {
    fn read_index(&self) -> usize {
        1 - self.write_index
    }
}

/// Double buffer for the inference -> render handoff.
///
/// `put` writes into the current write slot and flips the write index under
/// the lock. Readers always clone from the other slot, so the slot being
/// filled next is never the one a reader holds. With `T = Arc<Frame>` no
/// pixel data is copied on either side.
pub struct PreviewBuffer<T> {
    state: Mutex<PreviewState<T>>,
    ready: Condvar,
}

impl<T: Clone> PreviewBuffer<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PreviewState {
                slots: [None, None],
                write_index: 0,
                has_data: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Publish a new frame for rendering.
    pub fn put(&self, frame: T) {
        let mut state = self.state.lock();
        let idx = state.write_index;
        state.slots[idx] = Some(frame);
        state.write_index = 1 - idx;
        state.has_data = true;
        drop(state);
        self.ready.notify_all();
    }

    /// Alias of [`PreviewBuffer::put`]; writing never blocks.
    pub fn put_nowait(&self, frame: T) {
        self.put(frame);
    }

    /// Latest published frame, waiting up to `timeout` for the first one.
    ///
    /// The frame stays in the buffer; repeated reads return it again until a
    /// newer frame is published.
    pub fn get(&self, timeout: Option<Duration>) -> Option<T> {
        let mut state = self.state.lock();
        wait_for_frame(&self.ready, &mut state, timeout, |s| s.has_data);
        if !state.has_data {
            return None;
        }
        state.slots[state.read_index()].clone()
    }

    /// Latest published frame without waiting.
    pub fn get_nowait(&self) -> Option<T> {
        let state = self.state.lock();
        if !state.has_data {
            return None;
        }
        state.slots[state.read_index()].clone()
    }

    /// Empty both slots.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.slots = [None, None];
        state.has_data = false;
    }

    pub fn has_data(&self) -> bool {
        self.state.lock().has_data
    }
}

impl<T: Clone> Default for PreviewBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Frame;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn test_reads_latest_put() {
        let buffer = PreviewBuffer::new();
        buffer.put(1);
        buffer.put(2);
        buffer.put(3);
        assert_eq!(buffer.get_nowait(), Some(3));
        assert_eq!(buffer.get(Some(Duration::ZERO)), Some(3));
    }

    #[test]
    fn test_clear_then_get_nowait_is_empty() {
        let buffer = PreviewBuffer::new();
        buffer.put("frame");
        buffer.clear();
        assert!(!buffer.has_data());
        assert_eq!(buffer.get_nowait(), None);
    }

    #[test]
    fn test_get_times_out_before_first_put() {
        let buffer: PreviewBuffer<u8> = PreviewBuffer::new();
        assert_eq!(buffer.get(Some(Duration::from_millis(20))), None);
    }

    #[test]
    fn test_concurrent_reader_never_sees_empty_frame() {
        let buffer = Arc::new(PreviewBuffer::new());
        let done = Arc::new(AtomicBool::new(false));

        buffer.put(Arc::new(Frame::new(vec![0u8; 16], 4, 4, 0)));

        let producer = {
            let buffer = buffer.clone();
            let done = done.clone();
            thread::spawn(move || {
                for seq in 1..5_000u64 {
                    buffer.put(Arc::new(Frame::new(vec![seq as u8; 16], 4, 4, seq)));
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let consumer = {
            let buffer = buffer.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut last_seq = 0;
                while !done.load(Ordering::SeqCst) {
                    let frame = buffer
                        .get(Some(Duration::from_millis(100)))
                        .expect("frame available after first put");
                    assert_eq!(frame.len(), 16);
                    assert!(frame.data.iter().all(|b| *b == frame.seq as u8));
                    assert!(frame.seq >= last_seq);
                    last_seq = frame.seq;
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
        assert_eq!(buffer.get_nowait().map(|f| f.seq), Some(4_999));
    }
}
