//! Thread-safe bounded byte queue between a pipeline consumer and the device
//! callback.
//!
//! The pipeline consumer thread performs its "device write" as a blocking push
//! here; the real-time output callback drains it without blocking. The API is
//! designed to make shutdown deterministic (`close()` + early-return
//! semantics) while keeping the callback real-time friendly.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// Bounded FIFO of raw sample bytes.
///
/// ## Design
/// - **Bounded** by `max_buffered` bytes to cap memory and latency.
/// - Uses a single [`Condvar`] as a general "state changed" signal.
/// - The `done` flag lives *under the same mutex* as the queue to avoid races.
pub(crate) struct SharedBytes {
    inner: Mutex<Inner>,
    cv: Condvar,
    max_buffered: usize,
}

struct Inner {
    queue: VecDeque<u8>,
    done: bool,
}

impl SharedBytes {
    pub(crate) fn new(max_buffered: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered,
        }
    }

    /// Mark the queue as finished and wake all waiters.
    ///
    /// Blocked pushes return early; pops keep draining whatever is buffered.
    /// Idempotent.
    pub(crate) fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        drop(g);
        self.cv.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Push bytes, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before all bytes were accepted;
    /// the remainder is dropped.
    pub(crate) fn push_blocking(&self, bytes: &[u8]) -> bool {
        let mut offset = 0;

        while offset < bytes.len() {
            let mut g = self.inner.lock().unwrap();

            while g.queue.len() >= self.max_buffered && !g.done {
                g = self.cv.wait(g).unwrap();
            }
            if g.done {
                return false;
            }

            let room = self.max_buffered - g.queue.len();
            let take = room.min(bytes.len() - offset);
            g.queue.extend(&bytes[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }

        true
    }

    /// Pop up to `max_bytes`, rounded down to a multiple of `align`, without
    /// blocking. Returns `None` when fewer than `align` bytes are buffered.
    ///
    /// `align` is the sample size, so the callback never splits a sample.
    pub(crate) fn pop_chunk(&self, max_bytes: usize, align: usize) -> Option<Vec<u8>> {
        let mut g = self.inner.lock().unwrap();

        let take = g.queue.len().min(max_bytes) / align * align;
        if take == 0 {
            return None;
        }

        let out: Vec<u8> = g.queue.drain(..take).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn pop_empty_is_none() {
        let q = SharedBytes::new(16);
        assert!(q.pop_chunk(8, 2).is_none());
    }

    #[test]
    fn pops_in_push_order_respecting_alignment() {
        let q = SharedBytes::new(64);
        assert!(q.push_blocking(&[1, 2, 3, 4, 5]));

        // 5 bytes buffered, align 2: only 4 come out.
        let out = q.pop_chunk(16, 2).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);
        assert!(q.pop_chunk(16, 2).is_none());

        // The straggler is still there for a later aligned pop.
        assert!(q.push_blocking(&[6]));
        assert_eq!(q.pop_chunk(16, 2).unwrap(), vec![5, 6]);
    }

    #[test]
    fn pop_caps_at_max_bytes() {
        let q = SharedBytes::new(64);
        assert!(q.push_blocking(&[0; 32]));
        assert_eq!(q.pop_chunk(10, 4).unwrap().len(), 8);
        assert_eq!(q.pop_chunk(64, 4).unwrap().len(), 24);
    }

    #[test]
    fn full_push_blocks_until_popped() {
        let q = Arc::new(SharedBytes::new(4));
        assert!(q.push_blocking(&[1, 2, 3, 4]));

        let q_push = q.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();
        let handle = thread::spawn(move || {
            start.wait();
            q_push.push_blocking(&[5, 6])
        });

        barrier.wait();
        assert_eq!(q.pop_chunk(4, 1).unwrap(), vec![1, 2, 3, 4]);
        assert!(handle.join().unwrap());
        assert_eq!(q.pop_chunk(4, 1).unwrap(), vec![5, 6]);
    }

    #[test]
    fn close_unblocks_full_push() {
        let q = Arc::new(SharedBytes::new(2));
        assert!(q.push_blocking(&[1, 2]));

        let q_push = q.clone();
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let start = barrier.clone();
        let handle = thread::spawn(move || {
            start.wait();
            q_push.push_blocking(&[3, 4])
        });

        barrier.wait();
        q.close();
        assert!(!handle.join().unwrap());
        assert!(q.is_closed());

        // Buffered bytes are still drainable after close.
        assert_eq!(q.pop_chunk(4, 1).unwrap(), vec![1, 2]);
    }
}
