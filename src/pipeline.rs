//! Per-connection playback pipeline: bounded queue + consumer thread.
//!
//! Decouples network arrival cadence from device write cadence. Submission
//! never blocks: when the queue is full the block is shed and accounted by a
//! rate-limited reporter. The consumer thread drains blocks in order and
//! writes them to the output sink best-effort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::device::OutputSink;

/// Most blocks buffered per connection before arrivals are shed.
pub(crate) const QUEUE_CAPACITY: usize = 10;

/// Minimum spacing between aggregated overload log lines.
const DROP_REPORT_WINDOW: Duration = Duration::from_secs(5);

/// Reduces a block to the first `out_channels` interleaved channel samples of
/// every frame. Pure truncation — no mixing, no resampling; sample width and
/// frame count are unchanged.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelChop {
    pub(crate) in_channels: usize,
    pub(crate) out_channels: usize,
    pub(crate) sample_size: usize,
}

impl ChannelChop {
    pub(crate) fn apply(&self, block: &[u8]) -> Vec<u8> {
        let in_frame = self.in_channels * self.sample_size;
        let out_frame = self.out_channels * self.sample_size;

        let mut out = Vec::with_capacity(block.len() / in_frame * out_frame);
        for frame in block.chunks_exact(in_frame) {
            out.extend_from_slice(&frame[..out_frame]);
        }
        out
    }
}

/// Accounting for shed blocks, reported at most once per
/// [`DROP_REPORT_WINDOW`] per connection.
///
/// `record` notes one drop; `flush` returns the pending count once the window
/// since the last report has elapsed. The consumer thread ticks `flush` on
/// every wake, so a pending count is emitted even when no further drop occurs.
pub(crate) struct DropReporter {
    pending: u64,
    last_report: Instant,
}

impl DropReporter {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            pending: 0,
            last_report: now,
        }
    }

    pub(crate) fn record(&mut self, now: Instant) -> Option<u64> {
        self.pending += 1;
        self.flush(now)
    }

    pub(crate) fn flush(&mut self, now: Instant) -> Option<u64> {
        if self.pending > 0 && now.duration_since(self.last_report) >= DROP_REPORT_WINDOW {
            let dropped = self.pending;
            self.pending = 0;
            self.last_report = now;
            Some(dropped)
        } else {
            None
        }
    }
}

/// Bounded queue plus its consumer thread for one connection.
///
/// Created once the stream header is negotiated; `shutdown` (or drop) stops
/// and joins the consumer. A block already handed to the sink always finishes
/// its write.
pub(crate) struct PlaybackPipeline {
    tx: Option<Sender<Vec<u8>>>,
    stop: Arc<AtomicBool>,
    consumer: Option<JoinHandle<()>>,
    drops: Arc<Mutex<DropReporter>>,
    chop: Option<ChannelChop>,
    peer: String,
}

impl PlaybackPipeline {
    /// `wait` bounds how long the consumer blocks for the next block, so it
    /// notices the stop flag shortly after a connection tears down.
    pub(crate) fn new(
        sink: Box<dyn OutputSink>,
        chop: Option<ChannelChop>,
        wait: Duration,
        peer: String,
    ) -> Self {
        let (tx, rx) = bounded::<Vec<u8>>(QUEUE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let drops = Arc::new(Mutex::new(DropReporter::new(Instant::now())));

        let consumer = thread::spawn({
            let stop = stop.clone();
            let drops = drops.clone();
            let peer = peer.clone();
            move || consumer_main(sink, rx, stop, drops, wait, peer)
        });

        Self {
            tx: Some(tx),
            stop,
            consumer: Some(consumer),
            drops,
            chop,
            peer,
        }
    }

    /// Hand one block to the consumer. Never blocks; a full queue sheds the
    /// block.
    pub(crate) fn submit(&self, block: &[u8]) {
        let owned = match &self.chop {
            Some(chop) => chop.apply(block),
            None => block.to_vec(),
        };

        let Some(tx) = &self.tx else { return };
        match tx.try_send(owned) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.drops.lock().unwrap().record(Instant::now());
                report_drops(&self.peer, dropped);
            }
            // Consumer already gone; teardown is imminent.
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Signal the consumer to stop and join it.
    pub(crate) fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Dropping the sender wakes a consumer blocked on an empty queue.
        self.tx.take();
        if let Some(handle) = self.consumer.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PlaybackPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn consumer_main(
    sink: Box<dyn OutputSink>,
    rx: Receiver<Vec<u8>>,
    stop: Arc<AtomicBool>,
    drops: Arc<Mutex<DropReporter>>,
    wait: Duration,
    peer: String,
) {
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(wait) {
            // Best-effort playback: a failed device write must never reach
            // the network side.
            Ok(block) => {
                let _ = sink.write(&block);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let dropped = drops.lock().unwrap().flush(Instant::now());
        report_drops(&peer, dropped);
    }
}

fn report_drops(peer: &str, dropped: Option<u64>) {
    if let Some(count) = dropped {
        tracing::warn!(peer = %peer, dropped = count, "dropping audio blocks, playback queue overloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockSink;
    use anyhow::Result;
    use std::sync::Condvar;

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn chop_keeps_first_channels_of_every_frame() {
        // 4 channels in, 2 out, i16 samples, frames [L1 R1 A1 B1][L2 R2 A2 B2].
        let chop = ChannelChop {
            in_channels: 4,
            out_channels: 2,
            sample_size: 2,
        };
        let block: Vec<u8> = (1u8..=16).collect();
        assert_eq!(chop.apply(&block), vec![1, 2, 3, 4, 9, 10, 11, 12]);
    }

    #[test]
    fn delivers_blocks_in_order_without_overload() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(MockSink {
            writes: writes.clone(),
        });
        let pipeline =
            PlaybackPipeline::new(sink, None, Duration::from_millis(20), "test".into());

        let blocks: Vec<Vec<u8>> = (0..5u8).map(|i| vec![i; 4]).collect();
        for block in &blocks {
            pipeline.submit(block);
        }

        wait_for(|| writes.lock().unwrap().len() == 5);
        assert_eq!(*writes.lock().unwrap(), blocks);
    }

    /// Sink that holds every write until the gate opens.
    struct GatedSink {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
        gate: Arc<(Mutex<bool>, Condvar)>,
        entered: Arc<Mutex<usize>>,
    }

    impl OutputSink for GatedSink {
        fn write(&self, block: &[u8]) -> Result<()> {
            *self.entered.lock().unwrap() += 1;
            let (lock, cv) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
            drop(open);
            self.writes.lock().unwrap().push(block.to_vec());
            Ok(())
        }
    }

    #[test]
    fn sheds_overflow_and_keeps_queued_blocks_in_order() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let entered = Arc::new(Mutex::new(0));
        let sink = Box::new(GatedSink {
            writes: writes.clone(),
            gate: gate.clone(),
            entered: entered.clone(),
        });
        let mut pipeline =
            PlaybackPipeline::new(sink, None, Duration::from_millis(20), "test".into());

        // Let the consumer pick up block 0 and stall inside the write.
        pipeline.submit(&[0u8; 4]);
        wait_for(|| *entered.lock().unwrap() == 1);

        // Fill the queue (1..=10), then submit blocks that must be shed.
        for i in 1u8..=15 {
            pipeline.submit(&[i; 4]);
        }

        let (lock, cv) = &*gate;
        *lock.lock().unwrap() = true;
        cv.notify_all();

        wait_for(|| writes.lock().unwrap().len() == 1 + QUEUE_CAPACITY);
        let expected: Vec<Vec<u8>> = (0u8..=10).map(|i| vec![i; 4]).collect();
        assert_eq!(*writes.lock().unwrap(), expected);

        // Nothing beyond the queued prefix ever plays, and nothing twice.
        pipeline.shutdown();
        assert_eq!(writes.lock().unwrap().len(), 1 + QUEUE_CAPACITY);
    }

    #[test]
    fn applies_chop_before_enqueue() {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::new(MockSink {
            writes: writes.clone(),
        });
        let chop = ChannelChop {
            in_channels: 2,
            out_channels: 1,
            sample_size: 1,
        };
        let pipeline =
            PlaybackPipeline::new(sink, Some(chop), Duration::from_millis(20), "test".into());

        pipeline.submit(&[1, 2, 3, 4, 5, 6]);
        wait_for(|| !writes.lock().unwrap().is_empty());
        assert_eq!(writes.lock().unwrap()[0], vec![1, 3, 5]);
    }

    #[test]
    fn drop_reports_aggregate_per_window() {
        let base = Instant::now();
        let mut reporter = DropReporter::new(base);

        // 50 drops inside the first second: no report yet.
        for i in 0..50 {
            assert_eq!(reporter.record(base + Duration::from_millis(i * 20)), None);
        }

        // Quiet for 6 time units; the next tick flushes exactly once.
        assert_eq!(reporter.flush(base + Duration::from_secs(6)), Some(50));
        assert_eq!(reporter.flush(base + Duration::from_secs(7)), None);
    }

    #[test]
    fn drop_report_window_spaces_consecutive_reports() {
        let base = Instant::now();
        let mut reporter = DropReporter::new(base);

        assert_eq!(reporter.record(base), None);
        // Window elapsed with drops pending: the recording itself reports.
        assert_eq!(reporter.record(base + Duration::from_secs(5)), Some(2));
        // Fresh window starts from the report.
        assert_eq!(reporter.record(base + Duration::from_secs(6)), None);
        assert_eq!(reporter.flush(base + Duration::from_secs(10)), Some(1));
    }
}
