//! Device boundary: microphone capture and speaker output via cpal.
//!
//! # Design constraints
//!
//! cpal callbacks run on OS audio threads at elevated priority. They must not
//! block on a mutex or perform I/O. Capture writes into an SPSC ring buffer
//! producer whose `push_slice` is lock-free; playback reads a timeline it only
//! ever `try_lock`s, rendering silence when contended.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each stream therefore lives on its own holder thread that opens it,
//! reports the outcome over a sync channel, parks until released, and drops the
//! stream on that same thread.

pub mod device;
pub mod output;
pub mod resample;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc,
};
use std::thread::JoinHandle;
use std::time::Duration;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig,
};
use tracing::{info, warn};

use crate::{
    buffering::{AudioProducer, Producer},
    error::{Result, VoiceError},
    playback::PlaybackSink,
};

/// Exclusive microphone handle owned by a voice session.
pub trait Microphone: Send {
    /// Start pushing mono f32 samples into `producer`.
    ///
    /// Returns the device sample rate; resampling is the caller's job.
    ///
    /// # Errors
    /// `VoiceError::NoInputDevice` / `VoiceError::Device` when the device is
    /// missing, busy or permission is denied.
    fn acquire(&mut self, producer: AudioProducer) -> Result<u32>;

    /// Stop capture and release the device. Idempotent.
    fn release(&mut self);
}

/// Factory for the audio output sink of a voice session.
pub trait Speaker: Send {
    /// Open the output device for audio produced at `source_rate`.
    fn open(&mut self, source_rate: u32) -> Result<Box<dyn PlaybackSink>>;
}

/// The capture/output pair handed to a session at construction.
///
/// Nothing here is process-global: a session acquires both on activation and
/// releases both when it closes.
pub struct AudioDevices {
    pub microphone: Box<dyn Microphone>,
    pub speaker: Box<dyn Speaker>,
}

impl AudioDevices {
    pub fn new(microphone: impl Microphone + 'static, speaker: impl Speaker + 'static) -> Self {
        Self {
            microphone: Box::new(microphone),
            speaker: Box::new(speaker),
        }
    }

    /// Default cpal input and output, optionally preferring named devices.
    pub fn system(
        preferred_input: Option<String>,
        preferred_output: Option<String>,
    ) -> Self {
        Self::new(
            CpalMicrophone::new(preferred_input),
            output::CpalSpeaker::new(preferred_output),
        )
    }
}

impl std::fmt::Debug for AudioDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDevices").finish_non_exhaustive()
    }
}

/// Keeps a `!Send` stream alive on a dedicated thread until released.
pub(crate) struct StreamHolder {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamHolder {
    /// Run `open` on a fresh thread and wait for it to report.
    ///
    /// `open` builds and starts the stream and returns it with a value that is
    /// sent back to the caller (typically the device sample rate).
    pub(crate) fn spawn<S, T, F>(name: &str, open: F) -> Result<(Self, T)>
    where
        S: 'static,
        T: Send + 'static,
        F: FnOnce(Arc<AtomicBool>) -> Result<(S, T)> + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        let (open_tx, open_rx) = mpsc::channel::<Result<T>>();

        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match open(Arc::clone(&thread_running)) {
                    Ok((stream, value)) => {
                        let _ = open_tx.send(Ok(value));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                while thread_running.load(Ordering::Acquire) {
                    std::thread::park_timeout(Duration::from_millis(100));
                }
                // Stream drops here, on the thread that created it.
                drop(stream);
            })?;

        match open_rx.recv() {
            Ok(Ok(value)) => Ok((
                Self {
                    running,
                    thread: Some(thread),
                },
                value,
            )),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoiceError::Device(format!("{name} thread died before opening")))
            }
        }
    }

    pub(crate) fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("audio holder thread panicked");
            }
        }
    }
}

impl Drop for StreamHolder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// cpal-backed microphone. Down-mixes to mono inside the callback.
pub struct CpalMicrophone {
    preferred_device: Option<String>,
    holder: Option<StreamHolder>,
    dropped_samples: Arc<AtomicUsize>,
}

impl CpalMicrophone {
    pub fn new(preferred_device: Option<String>) -> Self {
        Self {
            preferred_device,
            holder: None,
            dropped_samples: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Samples the callback could not push because the ring was full.
    pub fn dropped_samples(&self) -> usize {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}

impl Microphone for CpalMicrophone {
    fn acquire(&mut self, producer: AudioProducer) -> Result<u32> {
        if self.holder.is_some() {
            return Err(VoiceError::Device("microphone already acquired".into()));
        }
        let preferred = self.preferred_device.clone();
        let dropped = Arc::clone(&self.dropped_samples);
        let (holder, sample_rate) = StreamHolder::spawn("voxlink-mic", move |running| {
            open_input_stream(producer, running, dropped, preferred.as_deref())
        })?;
        self.holder = Some(holder);
        Ok(sample_rate)
    }

    fn release(&mut self) {
        if let Some(mut holder) = self.holder.take() {
            holder.stop();
            info!("microphone released");
        }
    }
}

impl Drop for CpalMicrophone {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(feature = "audio-cpal")]
fn open_input_stream(
    producer: AudioProducer,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
    preferred_device_name: Option<&str>,
) -> Result<(Stream, u32)> {
    let device = device::resolve_input_device(preferred_device_name)?;
    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    let supported = device
        .default_input_config()
        .map_err(|e| VoiceError::Device(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let config: StreamConfig = supported.config();
    info!(sample_rate, channels = config.channels, "input config selected");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_input::<f32>(&device, &config, producer, running, dropped),
        SampleFormat::I16 => build_input::<i16>(&device, &config, producer, running, dropped),
        SampleFormat::U16 => build_input::<u16>(&device, &config, producer, running, dropped),
        SampleFormat::U8 => build_input::<u8>(&device, &config, producer, running, dropped),
        fmt => {
            return Err(VoiceError::Device(format!(
                "unsupported input sample format: {fmt:?}"
            )))
        }
    }?;

    stream
        .play()
        .map_err(|e| VoiceError::Device(e.to_string()))?;
    Ok((stream, sample_rate))
}

#[cfg(feature = "audio-cpal")]
fn build_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicUsize>,
) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                for (out, frame) in mono.iter_mut().zip(data.chunks_exact(channels)) {
                    let sum: f32 = frame.iter().map(|&s| f32::from_sample(s)).sum();
                    *out = sum / channels as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    dropped.fetch_add(mono.len() - written, Ordering::Relaxed);
                }
            },
            |err| tracing::error!("input stream error: {err}"),
            None,
        )
        .map_err(|e| VoiceError::Device(e.to_string()))
}

#[cfg(not(feature = "audio-cpal"))]
fn open_input_stream(
    _producer: AudioProducer,
    _running: Arc<AtomicBool>,
    _dropped: Arc<AtomicUsize>,
    _preferred_device_name: Option<&str>,
) -> Result<((), u32)> {
    Err(VoiceError::Device(
        "compiled without audio-cpal feature".into(),
    ))
}
