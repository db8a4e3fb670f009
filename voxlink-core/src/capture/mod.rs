//! Capture pipeline: ring buffer → resample → fixed frames → codec → outbound.
//!
//! ## Stages (per tick)
//!
//! ```text
//! 1. Drain the ring buffer filled by the microphone callback
//! 2. Resample device rate → capture rate (passthrough when equal)
//! 3. Slice into fixed `frame_samples` frames
//! 4. Quantize + base64 encode each frame
//! 5. try_send to the session loop; a full queue drops the frame
//! ```
//!
//! The pipeline never awaits the outbound queue: a slow network costs frames,
//! never a stalled input device.

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    audio::resample::RateConverter,
    buffering::{AudioConsumer, Consumer},
    codec::{self, EncodedChunk},
    error::Result,
    session::diagnostics::SessionDiagnostics,
};

/// Samples drained from the ring per pop.
const DRAIN_CHUNK: usize = 960;

/// Capture pipeline parameters.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate the microphone delivers at (Hz).
    pub device_rate: u32,
    /// Rate frames are emitted at (Hz). Default: 16000.
    pub target_rate: u32,
    /// Samples per emitted frame. Default: 4096 (256 ms at 16 kHz).
    pub frame_samples: usize,
    /// How often the ring is drained.
    pub poll_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_rate: 16_000,
            target_rate: 16_000,
            frame_samples: 4_096,
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Accumulates samples and yields exactly `frame_samples`-long frames.
#[derive(Debug)]
pub struct FrameSlicer {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameSlicer {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
        }
    }

    /// Append samples and return every frame completed by them, in order.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);
        let complete = self.pending.len() / self.frame_samples;
        let mut frames = Vec::with_capacity(complete);
        for _ in 0..complete {
            let rest = self.pending.split_off(self.frame_samples);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    /// Samples waiting for the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// One-shot capture pipeline. Spawn it once; stopping is irreversible.
pub struct CapturePipeline {
    config: CaptureConfig,
    consumer: AudioConsumer,
    converter: RateConverter,
    slicer: FrameSlicer,
    outbound: mpsc::Sender<EncodedChunk>,
    diagnostics: Arc<SessionDiagnostics>,
}

impl CapturePipeline {
    /// # Errors
    /// `VoiceError::Device` if the resampler cannot be built for these rates.
    pub fn new(
        config: CaptureConfig,
        consumer: AudioConsumer,
        outbound: mpsc::Sender<EncodedChunk>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Result<Self> {
        let converter = RateConverter::new(config.device_rate, config.target_rate, DRAIN_CHUNK)?;
        if !converter.is_passthrough() {
            info!(
                from = config.device_rate,
                to = config.target_rate,
                "capture resampling enabled"
            );
        }
        Ok(Self {
            slicer: FrameSlicer::new(config.frame_samples),
            config,
            consumer,
            converter,
            outbound,
            diagnostics,
        })
    }

    /// Drain whatever the microphone produced and forward complete frames.
    ///
    /// Returns the number of frames handed to the outbound queue.
    pub fn pump(&mut self) -> usize {
        let mut raw = [0f32; DRAIN_CHUNK];
        let mut forwarded = 0;
        loop {
            let n = self.consumer.pop_slice(&mut raw);
            if n == 0 {
                break;
            }
            let resampled = self.converter.process(&raw[..n]);
            for samples in self.slicer.push(&resampled) {
                if self.forward(&samples) {
                    forwarded += 1;
                }
            }
        }
        forwarded
    }

    fn forward(&mut self, samples: &[f32]) -> bool {
        self.diagnostics
            .frames_captured
            .fetch_add(1, Ordering::Relaxed);
        let chunk = codec::encode(samples, self.config.target_rate);
        match self.outbound.try_send(chunk) {
            Ok(()) => {
                debug!(samples = samples.len(), "capture frame queued");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self
                    .diagnostics
                    .frames_dropped
                    .fetch_add(1, Ordering::Relaxed)
                    + 1;
                if dropped == 1 || dropped % 50 == 0 {
                    warn!(dropped, "outbound queue full, dropping capture frame");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Run on the current runtime until stopped or the outbound side closes.
    pub fn spawn(mut self) -> CaptureHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            info!(
                frame_samples = self.config.frame_samples,
                rate = self.config.target_rate,
                "capture started"
            );
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        self.pump();
                        if self.outbound.is_closed() {
                            break;
                        }
                    }
                }
            }
            info!(
                pending = self.slicer.pending_len(),
                "capture stopped"
            );
        });
        CaptureHandle {
            stop_tx: Some(stop_tx),
            task: Some(task),
        }
    }
}

/// Handle to a running capture task.
pub struct CaptureHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Signal the task to stop. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Stop and wait for the task to exit.
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
