use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Counters shared by the capture task and the session loop.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub frames_queued_before_open: AtomicUsize,
    pub audio_chunks_received: AtomicUsize,
    pub audio_chunks_scheduled: AtomicUsize,
    pub codec_errors: AtomicUsize,
    pub interruptions: AtomicUsize,
    pub turns_completed: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_queued_before_open: self.frames_queued_before_open.load(Ordering::Relaxed),
            audio_chunks_received: self.audio_chunks_received.load(Ordering::Relaxed),
            audio_chunks_scheduled: self.audio_chunks_scheduled.load(Ordering::Relaxed),
            codec_errors: self.codec_errors.load(Ordering::Relaxed),
            interruptions: self.interruptions.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub frames_dropped: usize,
    pub frames_queued_before_open: usize,
    pub audio_chunks_received: usize,
    pub audio_chunks_scheduled: usize,
    pub codec_errors: usize,
    pub interruptions: usize,
    pub turns_completed: usize,
}
