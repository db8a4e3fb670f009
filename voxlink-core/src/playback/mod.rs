//! Gapless playback scheduling against a monotonic output clock.
//!
//! ```text
//! start    = max(cursor, sink.now)
//! cursor   = start + duration
//! interrupt: stop all, clear, cursor = sink.now
//! ```
//!
//! Chunks arriving faster than real time queue back to back; a chunk arriving
//! after the queue drained starts immediately instead of at a stale cursor.
//! Shortly before the queued audio runs out the sink is flushed, so audio it
//! holds back for a continuous conversion still plays.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::{buffering::frame::AudioFrame, error::Result};

/// Remaining queued audio (seconds) at which the sink gets flushed.
const FLUSH_LEAD_SECS: f64 = 0.1;

/// Audio output with a monotonic clock, in seconds of device time.
pub trait PlaybackSink: Send {
    /// Current output clock time.
    fn current_time(&self) -> f64;

    /// Schedule `frame` to start at `start` (output clock seconds).
    fn play_at(&mut self, id: u64, frame: &AudioFrame, start: f64) -> Result<()>;

    /// Stop a scheduled or playing entry immediately. Unknown ids are ignored.
    fn stop(&mut self, id: u64);

    /// Place any audio still held back for entries already scheduled.
    fn flush(&mut self) {}

    /// Release the output device. Idempotent.
    fn release(&mut self);
}

/// One entry in the playback queue.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub id: u64,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Owns the output sink, the playback queue and the next-start cursor.
pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    queue: VecDeque<ScheduledChunk>,
    cursor: f64,
    next_id: u64,
    /// Set by `enqueue`, cleared once the sink is flushed or interrupted.
    needs_flush: bool,
    released: bool,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>) -> Self {
        Self {
            sink,
            queue: VecDeque::new(),
            cursor: 0.0,
            next_id: 0,
            needs_flush: false,
            released: false,
        }
    }

    /// Schedule a decoded frame right after everything already queued.
    ///
    /// Empty frames are ignored and return `Ok(None)`.
    ///
    /// # Errors
    /// Propagates sink failures; the cursor is left untouched in that case.
    pub fn enqueue(&mut self, frame: &AudioFrame) -> Result<Option<ScheduledChunk>> {
        if frame.is_empty() || frame.duration_secs() <= 0.0 {
            return Ok(None);
        }
        let now = self.sink.current_time();
        let start = self.cursor.max(now);
        let id = self.next_id;
        self.sink.play_at(id, frame, start)?;
        self.next_id += 1;

        let chunk = ScheduledChunk {
            id,
            start,
            duration: frame.duration_secs(),
        };
        self.cursor = chunk.end();
        self.needs_flush = true;
        self.queue.push_back(chunk);
        debug!(
            id,
            start = format_args!("{:.3}", start),
            duration = format_args!("{:.3}", chunk.duration),
            queued = self.queue.len(),
            "audio chunk scheduled"
        );
        Ok(Some(chunk))
    }

    /// Drop entries that have finished playing and flush the sink when the
    /// queue is about to run dry. Returns how many finished.
    pub fn reap(&mut self) -> usize {
        let now = self.sink.current_time();
        if self.needs_flush && self.cursor - now <= FLUSH_LEAD_SECS {
            self.sink.flush();
            self.needs_flush = false;
        }
        let mut finished = 0;
        // Entries never overlap, so finished ones form a prefix.
        while self.queue.front().is_some_and(|c| c.end() <= now) {
            self.queue.pop_front();
            finished += 1;
        }
        finished
    }

    /// Hard-cut everything queued and rebase the cursor on the output clock.
    ///
    /// Returns the number of entries that were cut.
    pub fn interrupt(&mut self) -> usize {
        let cut = self.queue.len();
        for chunk in self.queue.drain(..) {
            self.sink.stop(chunk.id);
        }
        self.cursor = self.sink.current_time();
        self.needs_flush = false;
        if cut > 0 {
            info!(cut, "playback interrupted");
        }
        cut
    }

    /// Interrupt and release the output device. Idempotent.
    pub fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.interrupt();
        self.sink.release();
        self.released = true;
    }

    /// `true` while any entry is scheduled or playing.
    pub fn is_playing(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn queue(&self) -> &VecDeque<ScheduledChunk> {
        &self.queue
    }

    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn now(&self) -> f64 {
        self.sink.current_time()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if !self.released {
            warn!("playback scheduler dropped without shutdown");
            self.shutdown();
        }
    }
}
