//! Bounded background capture of child process output.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::{Duration, Instant},
};

pub mod thread;

/// Ring of the most recent bytes read from a pipe.
#[derive(Debug)]
pub(crate) struct TailBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl TailBuffer {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
            dropped: 0,
        }
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            self.dropped += bytes.len() as u64;
            return;
        }
        let bytes = if bytes.len() > self.capacity {
            let skip = bytes.len() - self.capacity;
            self.dropped += skip as u64;
            &bytes[skip..]
        } else {
            bytes
        };
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        if overflow != 0 {
            self.data.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.data.extend(bytes);
    }
}

#[derive(Debug)]
pub struct BackgroundIoHandle {
    buf: Arc<Mutex<TailBuffer>>,
    finished: Arc<AtomicBool>,
}

impl BackgroundIoHandle {
    fn new(buf: Arc<Mutex<TailBuffer>>, finished: Arc<AtomicBool>) -> Self {
        Self { buf, finished }
    }

    /// Take the buffered bytes, leaving the buffer empty.
    pub fn current_data(&self) -> Vec<u8> {
        let mut buf = self.buf.lock().unwrap();
        buf.data.drain(..).collect()
    }

    /// Number of bytes discarded because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.buf.lock().unwrap().dropped
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Wait until the writer side is closed or `max_wait` elapsed, then take what was read.
    ///
    /// A grandchild that inherited the pipe can keep it open after the child exits,
    /// so the wait is always bounded.
    pub fn wait_finish(self, max_wait: Duration) -> Vec<u8> {
        let deadline = Instant::now() + max_wait;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                log::debug!("background reader still running after {:?}", max_wait);
                break;
            }
            sleep(Duration::from_millis(5));
        }
        self.current_data()
    }
}

impl Clone for BackgroundIoHandle {
    fn clone(&self) -> Self {
        BackgroundIoHandle {
            buf: Arc::clone(&self.buf),
            finished: Arc::clone(&self.finished),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TailBuffer;

    #[test]
    fn tail_keeps_latest_bytes() {
        let mut t = TailBuffer::with_capacity(4);
        t.extend(b"ab");
        t.extend(b"cdef");
        assert_eq!(t.data.iter().copied().collect::<Vec<_>>(), b"cdef");
        assert_eq!(t.dropped, 2);

        t.extend(b"0123456789");
        assert_eq!(t.data.iter().copied().collect::<Vec<_>>(), b"6789");
        assert_eq!(t.dropped, 12);
    }

    #[test]
    fn zero_capacity_drops_everything() {
        let mut t = TailBuffer::with_capacity(0);
        t.extend(b"abc");
        assert!(t.data.is_empty());
        assert_eq!(t.dropped, 3);
    }
}
