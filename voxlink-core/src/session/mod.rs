//! `VoiceSession`: the duplex realtime voice lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceSession::new()                          status = Idle
//!     └─► activate(language)                   status = Connecting
//!           devices acquired, transport opening
//!         └─► open resolved                    status = Listening, capture running
//!             ├─► audio scheduled              status = Speaking
//!             └─► playback drained / interrupt status = Listening
//!         └─► deactivate() / transport end / device failure
//!                                              status = Idle, SessionClosedEvent
//! ```
//!
//! Closing is terminal. A new activation needs a new `VoiceSession`.
//!
//! ## Threading
//!
//! Everything that changes per session (playback queue, cursor, transcript,
//! transport handle) is owned by one tokio task, the session loop, which
//! multiplexes commands, the open handshake, captured frames, inbound events
//! and a playback reap tick with `select!`. The `VoiceSession` handle only
//! holds snapshots and broadcast senders, so it is `Send + Sync` and can be
//! shared behind an `Arc`.

pub mod diagnostics;
pub mod persona;
pub mod transcript;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    audio::AudioDevices,
    buffering::{create_audio_ring, AudioConsumer},
    capture::{CaptureConfig, CaptureHandle, CapturePipeline},
    codec::{self, EncodedChunk},
    error::{Result, VoiceError},
    ipc::events::{
        CloseReason, SessionClosedEvent, SessionStatus, SessionStatusEvent, TranscriptEvent,
    },
    playback::PlaybackScheduler,
    transport::{
        Connector, OpenRequest, ResponseModality, SendOutcome, ServerEvent, TransportSession,
    },
};

use self::{
    diagnostics::{DiagnosticsSnapshot, SessionDiagnostics},
    transcript::TranscriptBuffer,
};

/// Broadcast channel capacity for status / transcript subscribers.
const BROADCAST_CAP: usize = 256;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Kore";
pub const DEFAULT_PERSONA: &str = persona::CYBERBUDDY;

/// Configuration for `VoiceSession`.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rate captured audio is sent at (Hz). Default: 16000.
    pub capture_rate: u32,
    /// Samples per outbound frame. Default: 4096 (256 ms at 16 kHz).
    pub frame_samples: usize,
    /// How often the capture ring is drained. Default: 20 ms.
    pub capture_poll_interval: Duration,
    /// Rate of synthesized audio when the server does not tag it. Default: 24000.
    pub playback_rate: u32,
    /// Encoded frames buffered between capture and the session loop.
    /// When full, capture drops frames instead of waiting. Default: 32.
    pub outbound_queue_depth: usize,
    /// Frames held while the transport is still opening. Default: 64.
    pub pre_open_queue_depth: usize,
    /// How often finished playback entries are reaped. Default: 50 ms.
    pub reap_interval: Duration,
    pub model: String,
    /// Prebuilt voice name. `None` leaves the server default.
    pub voice: Option<String>,
    /// Behavioral prompt; the language instruction is appended per activation.
    pub persona: String,
    /// Ask the server for transcripts of its speech. Default: true.
    pub output_transcription: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_rate: 16_000,
            frame_samples: 4_096,
            capture_poll_interval: Duration::from_millis(20),
            playback_rate: 24_000,
            outbound_queue_depth: 32,
            pre_open_queue_depth: 64,
            reap_interval: Duration::from_millis(50),
            model: DEFAULT_MODEL.to_string(),
            voice: Some(DEFAULT_VOICE.to_string()),
            persona: DEFAULT_PERSONA.to_string(),
            output_transcription: true,
        }
    }
}

impl SessionConfig {
    /// Build the open handshake for a conversation in `language`.
    pub fn open_request(&self, language: &str) -> OpenRequest {
        OpenRequest {
            model: self.model.clone(),
            system_instruction: format!(
                "{}\n\nYou are in VOICE MODE. Be concise. The user is speaking in {}. \
                 Respond in the same language.",
                self.persona, language
            ),
            response_modality: ResponseModality::Audio,
            output_transcription: self.output_transcription,
            voice: self.voice.clone(),
        }
    }
}

enum Command {
    Deactivate,
}

/// State readable from outside the session loop.
struct Shared {
    status: Mutex<SessionStatus>,
    transcript: Mutex<String>,
    close_reason: Mutex<Option<CloseReason>>,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    transcript_tx: broadcast::Sender<TranscriptEvent>,
    closed_tx: broadcast::Sender<SessionClosedEvent>,
    seq: AtomicU64,
    diagnostics: Arc<SessionDiagnostics>,
}

impl Shared {
    fn set_status(&self, status: SessionStatus, detail: Option<String>) {
        {
            let mut current = self.status.lock();
            if *current == status && detail.is_none() {
                return;
            }
            *current = status;
        }
        info!(%status, "session status");
        let _ = self.status_tx.send(SessionStatusEvent { status, detail });
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    fn publish_transcript(&self, text: &str) {
        *self.transcript.lock() = text.to_string();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.transcript_tx.send(TranscriptEvent {
            seq,
            text: text.to_string(),
        });
    }

    /// Record the terminal state. Only the first call publishes.
    fn mark_closed(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
        }
        self.transcript.lock().clear();
        self.set_status(SessionStatus::Idle, reason.detail().map(str::to_string));
        if reason.is_error() {
            warn!(?reason, "voice session closed");
        } else {
            info!("voice session closed");
        }
        let _ = self.closed_tx.send(SessionClosedEvent { reason });
    }
}

/// The voice session handle.
///
/// `VoiceSession` is `Send + Sync`. Exactly two commands change it:
/// [`activate`](Self::activate) and [`deactivate`](Self::deactivate).
pub struct VoiceSession {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    devices: Mutex<Option<AudioDevices>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl VoiceSession {
    /// Create an idle session. Nothing is opened until `activate()`.
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>, devices: AudioDevices) -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (transcript_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (closed_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            config,
            connector,
            devices: Mutex::new(Some(devices)),
            commands: Mutex::new(None),
            task: Mutex::new(None),
            shared: Arc::new(Shared {
                status: Mutex::new(SessionStatus::Idle),
                transcript: Mutex::new(String::new()),
                close_reason: Mutex::new(None),
                status_tx,
                transcript_tx,
                closed_tx,
                seq: AtomicU64::new(0),
                diagnostics: Arc::new(SessionDiagnostics::default()),
            }),
        }
    }

    /// Acquire devices and open the transport for a conversation in
    /// `language`. Returns once the session loop is spawned; progress is
    /// reported through status events.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// - `VoiceError::SessionClosed` if the session already closed.
    /// - `VoiceError::AlreadyActive` if `activate()` was already called.
    pub fn activate(&self, language: &str) -> Result<()> {
        if self.is_closed() {
            return Err(VoiceError::SessionClosed);
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VoiceError::Other(anyhow::anyhow!("no tokio runtime: {e}")))?;
        let devices = self
            .devices
            .lock()
            .take()
            .ok_or(VoiceError::AlreadyActive)?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.commands.lock() = Some(command_tx);
        self.shared.set_status(SessionStatus::Connecting, None);
        info!(language, "voice session activating");

        let session_loop = SessionLoop {
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            devices: Some(devices),
            transport: TransportSession::new(self.config.pre_open_queue_depth),
            scheduler: None,
            capture: None,
            transcript: TranscriptBuffer::new(),
        };
        let span = info_span!("voice_session", language = %language);
        let task = runtime.spawn(
            session_loop
                .run(Arc::clone(&self.connector), language.to_string(), command_rx)
                .instrument(span),
        );
        *self.task.lock() = Some(task);
        Ok(())
    }

    /// Close the session. Idempotent; safe in every state, including while
    /// the transport is still opening.
    pub fn deactivate(&self) {
        if let Some(tx) = self.commands.lock().take() {
            if tx.send(Command::Deactivate).is_ok() {
                debug!("deactivate requested");
            }
            return;
        }
        // Never activated: drop the devices unused and close in place.
        if self.devices.lock().take().is_some() {
            self.shared.mark_closed(CloseReason::UserRequested);
        }
    }

    /// Wait until the session loop has released every resource.
    /// Returns immediately if it never ran or was already joined.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("session loop panicked: {e}");
                self.shared
                    .mark_closed(CloseReason::TransportFailure("session loop panicked".into()));
            }
        }
    }

    /// Current status (snapshot).
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Current transcript of the model's turn (snapshot).
    pub fn transcript(&self) -> String {
        self.shared.transcript.lock().clone()
    }

    /// `Some` once the session reached its terminal state.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close_reason.lock().is_some()
    }

    /// Subscribe to status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.status_tx.subscribe()
    }

    /// Subscribe to live transcript events.
    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.shared.transcript_tx.subscribe()
    }

    /// Subscribe to the one-shot close notification.
    pub fn subscribe_closed(&self) -> broadcast::Receiver<SessionClosedEvent> {
        self.shared.closed_tx.subscribe()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }
}

impl Drop for VoiceSession {
    fn drop(&mut self) {
        self.deactivate();
    }
}

/// What the transport handle produced this turn of the loop.
enum TransportStep {
    Opened(Result<usize>),
    Event(ServerEvent),
}

async fn next_transport_step(transport: &mut TransportSession) -> TransportStep {
    if transport.is_opening() {
        TransportStep::Opened(transport.opened().await)
    } else {
        TransportStep::Event(transport.next_event().await)
    }
}

/// Non-blocking check for a deactivate issued while the loop was not polling.
fn close_requested(commands: &mut mpsc::UnboundedReceiver<Command>) -> bool {
    !matches!(
        commands.try_recv(),
        Err(mpsc::error::TryRecvError::Empty)
    )
}

/// State owned exclusively by the session task.
struct SessionLoop {
    config: SessionConfig,
    shared: Arc<Shared>,
    devices: Option<AudioDevices>,
    transport: TransportSession,
    scheduler: Option<PlaybackScheduler>,
    capture: Option<CaptureHandle>,
    transcript: TranscriptBuffer,
}

impl SessionLoop {
    async fn run(
        mut self,
        connector: Arc<dyn Connector>,
        language: String,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let reason = self.drive(connector.as_ref(), &language, &mut commands).await;
        self.teardown(reason).await;
    }

    async fn drive(
        &mut self,
        connector: &dyn Connector,
        language: &str,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> CloseReason {
        if close_requested(commands) {
            return CloseReason::UserRequested;
        }
        let (consumer, device_rate) = match self.acquire_devices().await {
            Ok(acquired) => acquired,
            Err(e) => return CloseReason::DeviceFailure(e.to_string()),
        };
        let mut consumer = Some(consumer);

        // Acquisition cannot be cancelled midway; apply a close that arrived
        // meanwhile before anything reaches the network.
        if close_requested(commands) {
            info!("closed during device acquisition; not connecting");
            return CloseReason::UserRequested;
        }

        if let Err(e) = self
            .transport
            .open(connector, self.config.open_request(language))
        {
            return CloseReason::OpenFailed(e.to_string());
        }

        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<EncodedChunk>(self.config.outbound_queue_depth.max(1));
        let mut outbound_tx = Some(outbound_tx);

        let mut reap = tokio::time::interval(self.config.reap_interval);
        reap.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                cmd = commands.recv() => match cmd {
                    Some(Command::Deactivate) | None => return CloseReason::UserRequested,
                },

                // Ahead of inbound events so a burst from the server cannot
                // back up capture into dropping frames.
                Some(chunk) = outbound_rx.recv() => self.forward(chunk),

                step = next_transport_step(&mut self.transport) => match step {
                    TransportStep::Opened(Ok(flushed)) => {
                        info!(flushed, "transport open; starting capture");
                        self.shared.set_status(SessionStatus::Listening, None);
                        let (Some(consumer), Some(tx)) = (consumer.take(), outbound_tx.take()) else {
                            continue;
                        };
                        if let Err(e) = self.start_capture(consumer, device_rate, tx) {
                            return CloseReason::DeviceFailure(e.to_string());
                        }
                    }
                    TransportStep::Opened(Err(e)) => {
                        return CloseReason::OpenFailed(e.to_string());
                    }
                    TransportStep::Event(event) => {
                        if let Some(reason) = self.handle_event(event) {
                            return reason;
                        }
                    }
                },

                _ = reap.tick() => self.reap(),
            }
        }
    }

    /// Acquire microphone then speaker on a blocking thread.
    async fn acquire_devices(&mut self) -> Result<(AudioConsumer, u32)> {
        let mut devices = self
            .devices
            .take()
            .ok_or_else(|| VoiceError::Device("audio devices already taken".into()))?;
        let playback_rate = self.config.playback_rate;

        let (devices, acquired) = tokio::task::spawn_blocking(move || {
            let result = (|| {
                let (producer, consumer) = create_audio_ring();
                let device_rate = devices.microphone.acquire(producer)?;
                let sink = devices.speaker.open(playback_rate)?;
                Ok::<_, VoiceError>((consumer, device_rate, sink))
            })();
            (devices, result)
        })
        .await
        .map_err(|e| VoiceError::Device(format!("device task failed: {e}")))?;

        self.devices = Some(devices);
        let (consumer, device_rate, sink) = acquired?;
        info!(device_rate, "audio devices acquired");
        self.scheduler = Some(PlaybackScheduler::new(sink));
        Ok((consumer, device_rate))
    }

    fn start_capture(
        &mut self,
        consumer: AudioConsumer,
        device_rate: u32,
        outbound: mpsc::Sender<EncodedChunk>,
    ) -> Result<()> {
        let config = CaptureConfig {
            device_rate,
            target_rate: self.config.capture_rate,
            frame_samples: self.config.frame_samples,
            poll_interval: self.config.capture_poll_interval,
        };
        let pipeline = CapturePipeline::new(
            config,
            consumer,
            outbound,
            Arc::clone(&self.shared.diagnostics),
        )?;
        self.capture = Some(pipeline.spawn());
        Ok(())
    }

    fn forward(&mut self, chunk: EncodedChunk) {
        let diagnostics = &self.shared.diagnostics;
        match self.transport.send(chunk) {
            SendOutcome::Sent => {
                diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::Queued => {
                diagnostics
                    .frames_queued_before_open
                    .fetch_add(1, Ordering::Relaxed);
            }
            SendOutcome::Dropped => {
                diagnostics.frames_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Apply one inbound event. Returns `Some` when it ends the session.
    fn handle_event(&mut self, event: ServerEvent) -> Option<CloseReason> {
        let diagnostics = Arc::clone(&self.shared.diagnostics);
        match event {
            ServerEvent::TranscriptDelta(delta) => {
                let before = self.transcript.as_str().len();
                let text = self.transcript.append(&delta);
                // Blank deltas leave the text as it was; nothing to publish.
                if text.len() != before {
                    let text = text.to_string();
                    self.shared.publish_transcript(&text);
                }
            }
            ServerEvent::AudioDelta(chunk) => {
                diagnostics
                    .audio_chunks_received
                    .fetch_add(1, Ordering::Relaxed);
                return self.schedule_audio(&chunk);
            }
            ServerEvent::Interrupted => {
                diagnostics.interruptions.fetch_add(1, Ordering::Relaxed);
                if let Some(scheduler) = self.scheduler.as_mut() {
                    scheduler.interrupt();
                }
                info!("server interrupted the turn");
                self.shared.set_status(SessionStatus::Listening, None);
            }
            ServerEvent::TurnComplete => {
                diagnostics.turns_completed.fetch_add(1, Ordering::Relaxed);
                self.transcript.clear();
                self.shared.publish_transcript("");
                debug!("turn complete");
            }
            ServerEvent::Closed { reason } => {
                let err = VoiceError::TransportRuntime(
                    reason.unwrap_or_else(|| "connection closed by server".into()),
                );
                info!("{err}");
                return Some(CloseReason::TransportFailure(err.to_string()));
            }
            ServerEvent::Error(message) => {
                let err = VoiceError::TransportRuntime(message);
                error!("{err}");
                return Some(CloseReason::TransportFailure(err.to_string()));
            }
        }
        None
    }

    fn schedule_audio(&mut self, chunk: &EncodedChunk) -> Option<CloseReason> {
        let frame = match codec::decode_or(chunk, self.config.playback_rate) {
            Ok(frame) => frame,
            Err(e) => {
                self.shared
                    .diagnostics
                    .codec_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!("dropping undecodable audio chunk: {e}");
                return None;
            }
        };
        let scheduler = self.scheduler.as_mut()?;
        match scheduler.enqueue(&frame) {
            Ok(Some(_)) => {
                self.shared
                    .diagnostics
                    .audio_chunks_scheduled
                    .fetch_add(1, Ordering::Relaxed);
                self.shared.set_status(SessionStatus::Speaking, None);
                None
            }
            Ok(None) => None,
            Err(e) if e.is_fatal() => Some(CloseReason::DeviceFailure(e.to_string())),
            Err(e) => {
                warn!("dropping unplayable audio chunk: {e}");
                None
            }
        }
    }

    fn reap(&mut self) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        let finished = scheduler.reap();
        if finished > 0 {
            debug!(finished, "playback entries finished");
        }
        if !scheduler.is_playing() && self.shared.status() == SessionStatus::Speaking {
            self.shared.set_status(SessionStatus::Listening, None);
        }
    }

    /// Release everything in reverse order of acquisition.
    async fn teardown(&mut self, reason: CloseReason) {
        if let Some(capture) = self.capture.take() {
            capture.join().await;
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(devices) = self.devices.as_mut() {
            devices.microphone.release();
        }
        self.transport.close();
        self.transcript.clear();
        self.shared.mark_closed(reason);
    }
}
