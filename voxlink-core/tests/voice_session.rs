use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

use voxlink_core::buffering::{frame::AudioFrame, AudioProducer, Producer};
use voxlink_core::codec;
use voxlink_core::transport::{LinkPeer, OpenFuture, SessionLink};
use voxlink_core::{
    AudioDevices, CloseReason, Connector, Microphone, OpenRequest, PlaybackSink, ServerEvent,
    SessionConfig, SessionStatus, SessionStatusEvent, Speaker, TranscriptEvent, VoiceError,
    VoiceSession,
};

const WAIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Connector whose links are driven by the test through their `LinkPeer`.
struct ScriptedConnector {
    gate: Mutex<Option<oneshot::Receiver<voxlink_core::Result<()>>>>,
    peers: mpsc::UnboundedSender<LinkPeer>,
    requests: Arc<Mutex<Vec<OpenRequest>>>,
}

impl ScriptedConnector {
    /// Opens as soon as it is polled.
    fn immediate() -> (Arc<Self>, mpsc::UnboundedReceiver<LinkPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                gate: Mutex::new(None),
                peers,
                requests: Arc::new(Mutex::new(Vec::new())),
            }),
            rx,
        )
    }

    /// Opens (or fails) only when the returned sender fires.
    fn gated() -> (
        Arc<Self>,
        oneshot::Sender<voxlink_core::Result<()>>,
        mpsc::UnboundedReceiver<LinkPeer>,
    ) {
        let (gate_tx, gate_rx) = oneshot::channel();
        let (peers, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                gate: Mutex::new(Some(gate_rx)),
                peers,
                requests: Arc::new(Mutex::new(Vec::new())),
            }),
            gate_tx,
            rx,
        )
    }

    fn connect_calls(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self, request: OpenRequest) -> OpenFuture {
        self.requests.lock().push(request);
        let gate = self.gate.lock().take();
        let peers = self.peers.clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.await
                    .map_err(|_| VoiceError::TransportOpen("gate dropped".into()))??;
            }
            let (link, peer) = SessionLink::channel();
            let _ = peers.send(peer);
            Ok(link)
        })
    }
}

/// Microphone that preloads samples into the ring on acquire.
struct FakeMic {
    rate: u32,
    preload: Vec<f32>,
    fail: bool,
    producer: Option<AudioProducer>,
    released: Arc<AtomicBool>,
}

impl FakeMic {
    fn new(rate: u32, preload: Vec<f32>) -> (Self, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        (
            Self {
                rate,
                preload,
                fail: false,
                producer: None,
                released: Arc::clone(&released),
            },
            released,
        )
    }

    fn failing() -> Self {
        let (mut mic, _) = Self::new(16_000, Vec::new());
        mic.fail = true;
        mic
    }
}

impl Microphone for FakeMic {
    fn acquire(&mut self, mut producer: AudioProducer) -> voxlink_core::Result<u32> {
        if self.fail {
            return Err(VoiceError::Device("permission denied".into()));
        }
        producer.push_slice(&self.preload);
        self.producer = Some(producer);
        Ok(self.rate)
    }

    fn release(&mut self) {
        self.producer = None;
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Microphone whose acquisition blocks for a while, like a permission prompt.
struct SlowMic {
    delay: Duration,
    acquiring: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
    producer: Option<AudioProducer>,
}

impl Microphone for SlowMic {
    fn acquire(&mut self, producer: AudioProducer) -> voxlink_core::Result<u32> {
        self.acquiring.store(true, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.producer = Some(producer);
        Ok(16_000)
    }

    fn release(&mut self) {
        self.producer = None;
        self.released.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct SinkState {
    now: f64,
    /// (id, start, samples)
    played: Vec<(u64, f64, usize)>,
    stopped: Vec<u64>,
    released: bool,
}

/// Speaker whose clock only moves when the test moves it.
struct ManualSpeaker {
    state: Arc<Mutex<SinkState>>,
}

struct ManualSink {
    state: Arc<Mutex<SinkState>>,
}

impl Speaker for ManualSpeaker {
    fn open(&mut self, _source_rate: u32) -> voxlink_core::Result<Box<dyn PlaybackSink>> {
        Ok(Box::new(ManualSink {
            state: Arc::clone(&self.state),
        }))
    }
}

impl PlaybackSink for ManualSink {
    fn current_time(&self) -> f64 {
        self.state.lock().now
    }

    fn play_at(&mut self, id: u64, frame: &AudioFrame, start: f64) -> voxlink_core::Result<()> {
        self.state.lock().played.push((id, start, frame.len()));
        Ok(())
    }

    fn stop(&mut self, id: u64) {
        self.state.lock().stopped.push(id);
    }

    fn release(&mut self) {
        self.state.lock().released = true;
    }
}

struct Harness {
    session: VoiceSession,
    sink: Arc<Mutex<SinkState>>,
    mic_released: Arc<AtomicBool>,
    status_rx: broadcast::Receiver<SessionStatusEvent>,
}

fn harness(connector: Arc<ScriptedConnector>, preload: Vec<f32>) -> Harness {
    let (mic, mic_released) = FakeMic::new(16_000, preload);
    let sink = Arc::new(Mutex::new(SinkState::default()));
    let speaker = ManualSpeaker {
        state: Arc::clone(&sink),
    };
    let config = SessionConfig {
        reap_interval: Duration::from_millis(10),
        capture_poll_interval: Duration::from_millis(5),
        ..SessionConfig::default()
    };
    let session = VoiceSession::new(config, connector, AudioDevices::new(mic, speaker));
    let status_rx = session.subscribe_status();
    Harness {
        session,
        sink,
        mic_released,
        status_rx,
    }
}

async fn next_status(rx: &mut broadcast::Receiver<SessionStatusEvent>) -> SessionStatus {
    timeout(WAIT, rx.recv())
        .await
        .expect("status event in time")
        .expect("status channel open")
        .status
}

async fn next_peer(rx: &mut mpsc::UnboundedReceiver<LinkPeer>) -> LinkPeer {
    timeout(WAIT, rx.recv())
        .await
        .expect("link opened in time")
        .expect("connector alive")
}

async fn next_transcript(rx: &mut broadcast::Receiver<TranscriptEvent>) -> TranscriptEvent {
    timeout(WAIT, rx.recv())
        .await
        .expect("transcript event in time")
        .expect("transcript channel open")
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

fn model_audio(samples: usize) -> ServerEvent {
    ServerEvent::AudioDelta(codec::encode(&vec![0.1; samples], 24_000))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_follows_open_and_playback_occupancy() {
    let (connector, mut peers) = ScriptedConnector::immediate();
    let mut h = harness(Arc::clone(&connector), Vec::new());

    assert_eq!(h.session.status(), SessionStatus::Idle);
    h.session.activate("Spanish").expect("activate");
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Connecting);

    let peer = next_peer(&mut peers).await;
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Listening);

    let request = connector.requests.lock()[0].clone();
    assert!(request
        .system_instruction
        .ends_with("The user is speaking in Spanish. Respond in the same language."));
    assert!(request.output_transcription);

    // 2400 samples at 24 kHz = 100 ms.
    peer.events.send(model_audio(2400)).expect("send audio");
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Speaking);
    assert_eq!(h.sink.lock().played, vec![(0, 0.0, 2400)]);

    h.sink.lock().now = 1.0;
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Listening);

    h.session.deactivate();
    h.session.join().await;
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Idle);
    assert_eq!(h.session.close_reason(), Some(CloseReason::UserRequested));

    let snapshot = h.session.diagnostics();
    assert_eq!(snapshot.audio_chunks_received, 1);
    assert_eq!(snapshot.audio_chunks_scheduled, 1);
}

#[tokio::test]
async fn transcript_accumulates_and_resets_on_turn_complete() {
    let (connector, mut peers) = ScriptedConnector::immediate();
    let h = harness(connector, Vec::new());
    let mut transcripts = h.session.subscribe_transcript();

    h.session.activate("English").expect("activate");
    let peer = next_peer(&mut peers).await;

    for event in [
        ServerEvent::TranscriptDelta("Hel".into()),
        ServerEvent::TranscriptDelta("lo ".into()),
        ServerEvent::TurnComplete,
        ServerEvent::TranscriptDelta("Hi".into()),
    ] {
        peer.events.send(event).expect("send event");
    }

    let mut texts = Vec::new();
    let mut last_seq = None;
    for _ in 0..4 {
        let event = next_transcript(&mut transcripts).await;
        if let Some(prev) = last_seq {
            assert!(event.seq > prev);
        }
        last_seq = Some(event.seq);
        texts.push(event.text);
    }
    assert_eq!(texts, ["Hel", "Hel lo", "", "Hi"]);
    assert_eq!(h.session.transcript(), "Hi");
    assert_eq!(h.session.diagnostics().turns_completed, 1);

    h.session.deactivate();
    h.session.join().await;
    assert_eq!(h.session.transcript(), "");
}

#[tokio::test]
async fn interruption_cuts_queue_and_rebases_cursor() {
    let (connector, mut peers) = ScriptedConnector::immediate();
    let mut h = harness(connector, Vec::new());

    h.session.activate("English").expect("activate");
    let peer = next_peer(&mut peers).await;
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Connecting);
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Listening);

    h.sink.lock().now = 0.05;
    peer.events.send(model_audio(2400)).expect("first chunk");
    peer.events.send(model_audio(2400)).expect("second chunk");
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Speaking);
    wait_until(|| h.sink.lock().played.len() == 2).await;
    {
        let sink = h.sink.lock();
        approx::assert_abs_diff_eq!(sink.played[0].1, 0.05, epsilon = 1e-9);
        approx::assert_abs_diff_eq!(sink.played[1].1, 0.15, epsilon = 1e-9);
    }

    h.sink.lock().now = 0.08;
    peer.events.send(ServerEvent::Interrupted).expect("interrupt");
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Listening);
    assert_eq!(h.sink.lock().stopped, vec![0, 1]);

    // The next chunk starts at the current clock, not after the cut queue.
    peer.events.send(model_audio(2400)).expect("third chunk");
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Speaking);
    wait_until(|| h.sink.lock().played.len() == 3).await;
    approx::assert_abs_diff_eq!(h.sink.lock().played[2].1, 0.08, epsilon = 1e-9);
    assert_eq!(h.session.diagnostics().interruptions, 1);

    h.session.deactivate();
    h.session.join().await;
}

#[tokio::test]
async fn captured_frame_is_sent_with_rate_tag() {
    let (connector, mut peers) = ScriptedConnector::immediate();
    let h = harness(connector, vec![0.25; 4096]);

    h.session.activate("English").expect("activate");
    let mut peer = next_peer(&mut peers).await;

    let chunk = timeout(WAIT, peer.outbound.recv())
        .await
        .expect("frame sent in time")
        .expect("link alive");
    assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
    let frame = codec::decode(&chunk).expect("decode");
    assert_eq!(frame.len(), 4096);
    assert_eq!(frame.sample_rate(), 16_000);
    assert!(frame.samples().iter().all(|&s| s == codec::quantize(0.25)));

    // Exactly one frame's worth was captured.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(peer.outbound.try_recv().is_err());
    wait_until(|| h.session.diagnostics().frames_sent == 1).await;

    h.session.deactivate();
    h.session.join().await;
}

#[tokio::test]
async fn close_before_open_is_idempotent_and_releases_everything() {
    let (connector, gate, mut peers) = ScriptedConnector::gated();
    let h = harness(Arc::clone(&connector), Vec::new());
    let mut closed = h.session.subscribe_closed();

    h.session.activate("English").expect("activate");
    wait_until(|| connector.connect_calls() == 1).await;

    h.session.deactivate();
    h.session.deactivate();
    h.session.join().await;

    assert!(h.session.is_closed());
    assert_eq!(h.session.status(), SessionStatus::Idle);
    assert!(h.mic_released.load(Ordering::SeqCst));
    assert!(h.sink.lock().released);
    let event = timeout(WAIT, closed.recv())
        .await
        .expect("closed in time")
        .expect("closed event");
    assert_eq!(event.reason, CloseReason::UserRequested);
    assert!(closed.try_recv().is_err(), "closed must be published once");

    // The handshake settles after close; its link is closed immediately.
    gate.send(Ok(())).expect("release gate");
    let mut peer = next_peer(&mut peers).await;
    timeout(WAIT, &mut peer.shutdown)
        .await
        .expect("late link closed in time")
        .expect("shutdown signalled");

    assert!(matches!(
        h.session.activate("English"),
        Err(VoiceError::SessionClosed)
    ));
}

#[tokio::test]
async fn open_failure_closes_session() {
    let (connector, gate, _peers) = ScriptedConnector::gated();
    let h = harness(Arc::clone(&connector), Vec::new());
    let mut closed = h.session.subscribe_closed();

    h.session.activate("English").expect("activate");
    wait_until(|| connector.connect_calls() == 1).await;
    gate.send(Err(VoiceError::TransportOpen("401 unauthorized".into())))
        .expect("release gate");

    let event = timeout(WAIT, closed.recv())
        .await
        .expect("closed in time")
        .expect("closed event");
    match event.reason {
        CloseReason::OpenFailed(message) => assert!(message.contains("401")),
        other => panic!("unexpected close reason: {other:?}"),
    }
    h.session.join().await;
    assert!(h.mic_released.load(Ordering::SeqCst));
    assert_eq!(h.session.status(), SessionStatus::Idle);
}

#[tokio::test]
async fn device_failure_closes_without_connecting() {
    let (connector, _peers) = ScriptedConnector::immediate();
    let speaker = ManualSpeaker {
        state: Arc::new(Mutex::new(SinkState::default())),
    };
    let session = VoiceSession::new(
        SessionConfig::default(),
        Arc::clone(&connector) as Arc<dyn Connector>,
        AudioDevices::new(FakeMic::failing(), speaker),
    );
    let mut closed = session.subscribe_closed();

    session.activate("English").expect("activate");
    let event = timeout(WAIT, closed.recv())
        .await
        .expect("closed in time")
        .expect("closed event");
    assert!(matches!(event.reason, CloseReason::DeviceFailure(_)));
    session.join().await;
    assert_eq!(connector.connect_calls(), 0);
}

#[tokio::test]
async fn transport_error_ends_session_and_discards_transcript() {
    let (connector, mut peers) = ScriptedConnector::immediate();
    let h = harness(connector, Vec::new());
    let mut closed = h.session.subscribe_closed();
    let mut transcripts = h.session.subscribe_transcript();

    h.session.activate("English").expect("activate");
    let peer = next_peer(&mut peers).await;
    peer.events
        .send(ServerEvent::TranscriptDelta("partial".into()))
        .expect("send delta");
    assert_eq!(next_transcript(&mut transcripts).await.text, "partial");

    peer.events
        .send(ServerEvent::Error("socket reset".into()))
        .expect("send error");
    let event = timeout(WAIT, closed.recv())
        .await
        .expect("closed in time")
        .expect("closed event");
    assert!(matches!(event.reason, CloseReason::TransportFailure(_)));
    assert_eq!(event.reason.detail().map(|d| d.contains("socket reset")), Some(true));

    h.session.join().await;
    assert_eq!(h.session.transcript(), "");
    assert!(h.sink.lock().released);
}

#[tokio::test]
async fn undecodable_audio_is_dropped_and_counted() {
    let (connector, mut peers) = ScriptedConnector::immediate();
    let mut h = harness(connector, Vec::new());

    h.session.activate("English").expect("activate");
    let peer = next_peer(&mut peers).await;
    peer.events
        .send(ServerEvent::AudioDelta(voxlink_core::EncodedChunk::new(
            "not base64!",
            "audio/pcm;rate=24000",
        )))
        .expect("send bad chunk");
    peer.events.send(model_audio(240)).expect("send good chunk");

    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Connecting);
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Listening);
    assert_eq!(next_status(&mut h.status_rx).await, SessionStatus::Speaking);

    let snapshot = h.session.diagnostics();
    assert_eq!(snapshot.codec_errors, 1);
    assert_eq!(snapshot.audio_chunks_scheduled, 1);
    assert!(!h.session.is_closed());

    h.session.deactivate();
    h.session.join().await;
}

#[tokio::test]
async fn second_activation_is_rejected() {
    let (connector, _peers) = ScriptedConnector::immediate();
    let h = harness(connector, Vec::new());
    h.session.activate("English").expect("activate");
    assert!(matches!(
        h.session.activate("English"),
        Err(VoiceError::AlreadyActive)
    ));
    h.session.deactivate();
    h.session.join().await;
}

#[tokio::test]
async fn deactivate_before_activate_closes_once() {
    let (connector, _peers) = ScriptedConnector::immediate();
    let h = harness(Arc::clone(&connector), Vec::new());
    let mut closed = h.session.subscribe_closed();

    h.session.deactivate();
    h.session.deactivate();
    h.session.join().await;

    let event = timeout(WAIT, closed.recv())
        .await
        .expect("closed in time")
        .expect("closed event");
    assert_eq!(event.reason, CloseReason::UserRequested);
    assert!(closed.try_recv().is_err(), "closed must be published once");
    assert_eq!(h.session.status(), SessionStatus::Idle);

    assert!(matches!(
        h.session.activate("English"),
        Err(VoiceError::SessionClosed)
    ));
    assert_eq!(connector.connect_calls(), 0);
    assert!(h.sink.lock().played.is_empty());
}

#[tokio::test]
async fn deactivate_during_device_acquisition_never_connects() {
    let (connector, _peers) = ScriptedConnector::immediate();
    let acquiring = Arc::new(AtomicBool::new(false));
    let mic_released = Arc::new(AtomicBool::new(false));
    let mic = SlowMic {
        delay: Duration::from_millis(200),
        acquiring: Arc::clone(&acquiring),
        released: Arc::clone(&mic_released),
        producer: None,
    };
    let sink = Arc::new(Mutex::new(SinkState::default()));
    let speaker = ManualSpeaker {
        state: Arc::clone(&sink),
    };
    let session = VoiceSession::new(
        SessionConfig::default(),
        Arc::clone(&connector) as Arc<dyn Connector>,
        AudioDevices::new(mic, speaker),
    );
    let mut closed = session.subscribe_closed();

    session.activate("English").expect("activate");
    wait_until(|| acquiring.load(Ordering::SeqCst)).await;
    session.deactivate();
    session.join().await;

    assert_eq!(connector.connect_calls(), 0, "no remote session after close");
    assert_eq!(session.close_reason(), Some(CloseReason::UserRequested));
    assert!(mic_released.load(Ordering::SeqCst));
    assert!(sink.lock().released);
    let event = timeout(WAIT, closed.recv())
        .await
        .expect("closed in time")
        .expect("closed event");
    assert_eq!(event.reason, CloseReason::UserRequested);
    assert!(closed.try_recv().is_err());
}

#[tokio::test]
async fn blank_transcript_delta_is_not_republished() {
    let (connector, mut peers) = ScriptedConnector::immediate();
    let h = harness(connector, Vec::new());
    let mut transcripts = h.session.subscribe_transcript();

    h.session.activate("English").expect("activate");
    let peer = next_peer(&mut peers).await;
    for delta in ["ok", "  ", "", "go"] {
        peer.events
            .send(ServerEvent::TranscriptDelta(delta.into()))
            .expect("send delta");
    }

    let first = next_transcript(&mut transcripts).await;
    let second = next_transcript(&mut transcripts).await;
    assert_eq!(first.text, "ok");
    assert_eq!(second.text, "ok go");
    assert_eq!(second.seq, first.seq + 1);

    h.session.deactivate();
    h.session.join().await;
}

#[tokio::test]
async fn captured_audio_is_forwarded_during_an_inbound_burst() {
    const BURST: usize = 20_000;
    let (connector, mut peers) = ScriptedConnector::immediate();
    let h = harness(connector, vec![0.25; 4096]);

    h.session.activate("English").expect("activate");
    let mut peer = next_peer(&mut peers).await;
    for _ in 0..BURST {
        peer.events
            .send(ServerEvent::TurnComplete)
            .expect("send event");
    }

    timeout(WAIT, peer.outbound.recv())
        .await
        .expect("frame sent in time")
        .expect("link alive");
    let handled = h.session.diagnostics().turns_completed;
    assert!(
        handled < BURST,
        "frame waited for the whole burst ({handled} events handled first)"
    );

    h.session.deactivate();
    h.session.join().await;
}
