//! Speaker output: a sample-accurate timeline rendered by the cpal callback.
//!
//! The output clock is the number of device frames rendered so far divided by
//! the device rate. Scheduled entries are placed on that timeline at their start
//! frame; the callback mixes whatever overlaps the block it is rendering.
//!
//! Chunks scheduled back to back form one run and go through one continuous
//! rate conversion, so the converted audio has no seam where the chunks meet.
//! A run ends when a chunk does not continue it, when the scheduler flushes
//! before playback runs dry, or when an entry of the run is stopped.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    audio::{resample::RateConverter, Speaker, StreamHolder},
    buffering::frame::AudioFrame,
    error::{Result, VoiceError},
    playback::PlaybackSink,
};

/// Resampler block size for playback conversion.
const RESAMPLE_BLOCK: usize = 480;

struct TimelineEntry {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
}

impl TimelineEntry {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Shared between the sink (scheduling side) and the output callback.
pub(crate) struct OutputTimeline {
    device_rate: u32,
    rendered: AtomicU64,
    /// Blocks rendered as silence because the scheduling side held the lock.
    missed_blocks: AtomicU64,
    entries: Mutex<Vec<TimelineEntry>>,
}

impl OutputTimeline {
    pub(crate) fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            rendered: AtomicU64::new(0),
            missed_blocks: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn now_secs(&self) -> f64 {
        self.rendered.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    pub(crate) fn missed_blocks(&self) -> u64 {
        self.missed_blocks.load(Ordering::Relaxed)
    }

    fn frame_at(&self, secs: f64) -> u64 {
        (secs * self.device_rate as f64).round().max(0.0) as u64
    }

    /// Place `samples` at `start_frame`; returns the frame just past them.
    fn insert(&self, id: u64, start_frame: u64, samples: Vec<f32>) -> u64 {
        let end_frame = start_frame + samples.len() as u64;
        if !samples.is_empty() {
            self.entries.lock().push(TimelineEntry {
                id,
                start_frame,
                samples,
            });
        }
        end_frame
    }

    fn remove(&self, id: u64) {
        self.entries.lock().retain(|e| e.id != id);
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Fill an interleaved output block and advance the clock.
    ///
    /// Renders silence when the scheduling side holds the lock.
    pub(crate) fn render(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        out.fill(0.0);
        let base = self.rendered.load(Ordering::Acquire);
        let block_end = base + frames;

        match self.entries.try_lock() {
            Some(mut entries) => {
                for entry in entries.iter() {
                    let from = entry.start_frame.max(base);
                    let to = entry.end_frame().min(block_end);
                    for pos in from..to {
                        let sample = entry.samples[(pos - entry.start_frame) as usize];
                        let offset = (pos - base) as usize * channels;
                        for slot in &mut out[offset..offset + channels] {
                            *slot += sample;
                        }
                    }
                }
                entries.retain(|e| e.end_frame() > block_end);
            }
            None => {
                self.missed_blocks.fetch_add(1, Ordering::Relaxed);
            }
        }

        for slot in out.iter_mut() {
            *slot = slot.clamp(-1.0, 1.0);
        }
        self.rendered.store(block_end, Ordering::Release);
    }
}

/// Chunks converted as one continuous signal.
struct ContinuousRun {
    first_id: u64,
    last_id: u64,
    /// Start time (source clock) a chunk needs to continue this run.
    next_start: f64,
    /// Device frame the next converted sample lands on.
    write_frame: u64,
}

impl ContinuousRun {
    fn contains(&self, id: u64) -> bool {
        (self.first_id..=self.last_id).contains(&id)
    }
}

/// Resamples scheduled chunks to the device rate and places them on the
/// timeline.
pub(crate) struct TimelineWriter {
    timeline: Arc<OutputTimeline>,
    converter: RateConverter,
    source_rate: u32,
    run: Option<ContinuousRun>,
}

impl TimelineWriter {
    pub(crate) fn new(timeline: Arc<OutputTimeline>, source_rate: u32) -> Result<Self> {
        let converter = RateConverter::new(source_rate, timeline.device_rate, RESAMPLE_BLOCK)?;
        Ok(Self {
            timeline,
            converter,
            source_rate,
            run: None,
        })
    }

    pub(crate) fn place(&mut self, id: u64, frame: &AudioFrame, start: f64) -> Result<()> {
        if frame.sample_rate() != self.source_rate {
            self.flush();
            self.converter =
                RateConverter::new(frame.sample_rate(), self.timeline.device_rate, RESAMPLE_BLOCK)?;
            self.source_rate = frame.sample_rate();
        }

        let tolerance = 0.5 / self.source_rate as f64;
        let mut run = match self.run.take() {
            Some(run) if (start - run.next_start).abs() < tolerance => run,
            previous => {
                if let Some(previous) = previous {
                    self.finish_run(previous);
                }
                ContinuousRun {
                    first_id: id,
                    last_id: id,
                    next_start: start,
                    write_frame: self.timeline.frame_at(start),
                }
            }
        };

        let samples = self.converter.process(&frame.to_f32());
        debug!(id, device_samples = samples.len(), "placing chunk on timeline");
        run.last_id = id;
        run.next_start = start + frame.duration_secs();
        run.write_frame = self.timeline.insert(id, run.write_frame, samples);
        self.run = Some(run);
        Ok(())
    }

    /// End the current run, placing the audio the converter still holds.
    pub(crate) fn flush(&mut self) {
        if let Some(run) = self.run.take() {
            self.finish_run(run);
        }
    }

    pub(crate) fn stop(&mut self, id: u64) {
        self.timeline.remove(id);
        if self.run.as_ref().is_some_and(|run| run.contains(id)) {
            self.run = None;
            self.converter.reset();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.run = None;
        self.converter.reset();
        self.timeline.clear();
    }

    fn finish_run(&mut self, run: ContinuousRun) {
        let tail = self.converter.finish();
        self.timeline.insert(run.last_id, run.write_frame, tail);
    }
}

/// cpal-backed speaker factory.
pub struct CpalSpeaker {
    preferred_device: Option<String>,
}

impl CpalSpeaker {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self { preferred_device }
    }
}

impl Speaker for CpalSpeaker {
    fn open(&mut self, source_rate: u32) -> Result<Box<dyn PlaybackSink>> {
        let preferred = self.preferred_device.clone();
        let (holder, timeline) = StreamHolder::spawn("voxlink-speaker", move |_running| {
            open_output_stream(preferred.as_deref())
        })?;
        info!(
            source_rate,
            device_rate = timeline.device_rate,
            "speaker opened"
        );
        Ok(Box::new(CpalPlaybackSink {
            writer: TimelineWriter::new(Arc::clone(&timeline), source_rate)?,
            timeline,
            holder: Some(holder),
        }))
    }
}

/// Playback sink over a live cpal output stream.
pub struct CpalPlaybackSink {
    timeline: Arc<OutputTimeline>,
    writer: TimelineWriter,
    holder: Option<StreamHolder>,
}

impl CpalPlaybackSink {
    /// Output blocks rendered silent because scheduling held the timeline.
    pub fn missed_blocks(&self) -> u64 {
        self.timeline.missed_blocks()
    }
}

impl PlaybackSink for CpalPlaybackSink {
    fn current_time(&self) -> f64 {
        self.timeline.now_secs()
    }

    fn play_at(&mut self, id: u64, frame: &AudioFrame, start: f64) -> Result<()> {
        if self.holder.is_none() {
            return Err(VoiceError::Device("speaker already released".into()));
        }
        self.writer.place(id, frame, start)
    }

    fn stop(&mut self, id: u64) {
        self.writer.stop(id);
    }

    fn flush(&mut self) {
        self.writer.flush();
    }

    fn release(&mut self) {
        self.writer.clear();
        if let Some(mut holder) = self.holder.take() {
            holder.stop();
            let missed = self.timeline.missed_blocks();
            if missed > 0 {
                warn!(missed, "output blocks rendered silent under contention");
            }
            info!("speaker released");
        }
    }
}

impl Drop for CpalPlaybackSink {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "audio-cpal")]
fn open_output_stream(preferred: Option<&str>) -> Result<(Stream, Arc<OutputTimeline>)> {
    let device = crate::audio::device::resolve_output_device(preferred)?;
    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );
    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::Device(e.to_string()))?;
    let config: StreamConfig = supported.config();
    let timeline = Arc::new(OutputTimeline::new(config.sample_rate.0));

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output::<f32>(&device, &config, Arc::clone(&timeline)),
        SampleFormat::I16 => build_output::<i16>(&device, &config, Arc::clone(&timeline)),
        SampleFormat::U16 => build_output::<u16>(&device, &config, Arc::clone(&timeline)),
        fmt => {
            return Err(VoiceError::Device(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;
    stream
        .play()
        .map_err(|e| VoiceError::Device(e.to_string()))?;
    Ok((stream, timeline))
}

#[cfg(feature = "audio-cpal")]
fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    timeline: Arc<OutputTimeline>,
) -> Result<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info| {
                scratch.resize(data.len(), 0.0);
                timeline.render(&mut scratch, channels);
                for (out, &s) in data.iter_mut().zip(scratch.iter()) {
                    *out = T::from_sample(s);
                }
            },
            |err| tracing::error!("output stream error: {err}"),
            None,
        )
        .map_err(|e| VoiceError::Device(e.to_string()))
}

#[cfg(not(feature = "audio-cpal"))]
fn open_output_stream(_preferred: Option<&str>) -> Result<((), Arc<OutputTimeline>)> {
    Err(VoiceError::Device(
        "compiled without audio-cpal feature".into(),
    ))
}
