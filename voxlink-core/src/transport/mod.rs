//! Bidirectional transport to the remote speech model.
//!
//! ## Handle states
//!
//! ```text
//! Unopened ──open()──► Opening(pending) ──opened()──► Open(link) ──close()──► Closed
//!     │                      │                                                  ▲
//!     └──────────────────────┴──────────────────close()─────────────────────────┘
//! ```
//!
//! Chunks sent while `Unopened`/`Opening` wait in a bounded queue and are flushed
//! in order once the link is up. Closing while `Opening` leaves the handshake to
//! settle in the background and closes whatever link it produces.
//!
//! A [`Connector`] produces a [`SessionLink`]: two ordered channels plus a
//! shutdown signal. The concrete wire protocol lives behind it (see
//! [`gemini`]), so the session loop and its tests never touch a socket.

pub mod gemini;
pub mod messages;

use std::collections::VecDeque;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{
    codec::EncodedChunk,
    error::{Result, VoiceError},
};

/// Inbound events, delivered in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Partial transcript of the model's speech.
    TranscriptDelta(String),
    /// One chunk of synthesized speech.
    AudioDelta(EncodedChunk),
    /// The server abandoned its in-flight turn (barge-in).
    Interrupted,
    /// The server finished one response turn.
    TurnComplete,
    /// The connection ended. Terminal.
    Closed { reason: Option<String> },
    /// The connection failed. Terminal.
    Error(String),
}

impl ServerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::Closed { .. } | ServerEvent::Error(_))
    }
}

/// Output modality requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseModality {
    Audio,
    Text,
}

impl ResponseModality {
    pub fn as_wire(self) -> &'static str {
        match self {
            ResponseModality::Audio => "AUDIO",
            ResponseModality::Text => "TEXT",
        }
    }
}

/// Everything the open handshake carries.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub model: String,
    /// Behavioral prompt plus the declared response language.
    pub system_instruction: String,
    pub response_modality: ResponseModality,
    /// Ask the server to stream transcripts of its own speech.
    pub output_transcription: bool,
    pub voice: Option<String>,
}

/// Client side of an established connection.
pub struct SessionLink {
    outbound: mpsc::UnboundedSender<EncodedChunk>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

/// Connector side of a [`SessionLink`], driven by the connection's I/O task.
pub struct LinkPeer {
    pub outbound: mpsc::UnboundedReceiver<EncodedChunk>,
    pub events: mpsc::UnboundedSender<ServerEvent>,
    /// Resolves when the client closes or drops its link.
    pub shutdown: oneshot::Receiver<()>,
}

impl SessionLink {
    pub fn channel() -> (SessionLink, LinkPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (shut_tx, shut_rx) = oneshot::channel();
        (
            SessionLink {
                outbound: out_tx,
                events: ev_rx,
                shutdown: Some(shut_tx),
            },
            LinkPeer {
                outbound: out_rx,
                events: ev_tx,
                shutdown: shut_rx,
            },
        )
    }

    /// Fire-and-forget. Returns `false` if the connection is already gone.
    pub fn send(&self, chunk: EncodedChunk) -> bool {
        self.outbound.send(chunk).is_ok()
    }

    /// Next inbound event; a vanished peer reads as `Closed`.
    pub async fn recv(&mut self) -> ServerEvent {
        self.events
            .recv()
            .await
            .unwrap_or(ServerEvent::Closed { reason: None })
    }

    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

/// Pending open handshake.
pub type OpenFuture = BoxFuture<'static, Result<SessionLink>>;

/// Opens connections to a remote model.
pub trait Connector: Send + Sync {
    /// Start the open handshake. Resolves once the remote accepted the setup.
    fn connect(&self, request: OpenRequest) -> OpenFuture;
}

enum LinkState {
    Unopened,
    Opening(OpenFuture),
    Open(SessionLink),
    Closed,
}

/// What happened to a chunk handed to [`TransportSession::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Held until the open handshake settles.
    Queued,
    /// Closed session, dead link, or an evicted pre-open chunk.
    Dropped,
}

/// The single connection handle a voice session owns.
pub struct TransportSession {
    state: LinkState,
    pending: VecDeque<EncodedChunk>,
    pending_limit: usize,
}

impl TransportSession {
    pub fn new(pending_limit: usize) -> Self {
        Self {
            state: LinkState::Unopened,
            pending: VecDeque::new(),
            pending_limit,
        }
    }

    /// Begin the handshake.
    ///
    /// # Errors
    /// `VoiceError::SessionClosed` unless the handle is still `Unopened`.
    pub fn open(&mut self, connector: &dyn Connector, request: OpenRequest) -> Result<()> {
        match self.state {
            LinkState::Unopened => {
                info!(model = %request.model, "opening transport");
                self.state = LinkState::Opening(connector.connect(request));
                Ok(())
            }
            _ => Err(VoiceError::SessionClosed),
        }
    }

    /// Wait for the pending handshake. Never resolves outside `Opening`.
    ///
    /// Cancel-safe: the handshake lives in the handle, so dropping this
    /// future (e.g. in `select!`) loses no progress.
    ///
    /// On success flushes queued chunks and returns how many were sent.
    ///
    /// # Errors
    /// `VoiceError::TransportOpen`; the handle is `Closed` afterwards.
    pub async fn opened(&mut self) -> Result<usize> {
        let LinkState::Opening(pending) = &mut self.state else {
            return std::future::pending().await;
        };
        match pending.await {
            Ok(link) => {
                let mut flushed = 0;
                for chunk in self.pending.drain(..) {
                    if link.send(chunk) {
                        flushed += 1;
                    }
                }
                self.state = LinkState::Open(link);
                info!(flushed, "transport open");
                Ok(flushed)
            }
            Err(e) => {
                self.pending.clear();
                self.state = LinkState::Closed;
                Err(match e {
                    VoiceError::TransportOpen(_) => e,
                    other => VoiceError::TransportOpen(other.to_string()),
                })
            }
        }
    }

    /// Submit a chunk in capture order. Never blocks.
    pub fn send(&mut self, chunk: EncodedChunk) -> SendOutcome {
        match &self.state {
            LinkState::Open(link) => {
                if link.send(chunk) {
                    SendOutcome::Sent
                } else {
                    debug!("outbound chunk dropped: link gone");
                    SendOutcome::Dropped
                }
            }
            LinkState::Unopened | LinkState::Opening(_) => {
                self.pending.push_back(chunk);
                if self.pending.len() > self.pending_limit {
                    self.pending.pop_front();
                    return SendOutcome::Dropped;
                }
                SendOutcome::Queued
            }
            LinkState::Closed => SendOutcome::Dropped,
        }
    }

    /// Next inbound event. Never resolves unless `Open`.
    pub async fn next_event(&mut self) -> ServerEvent {
        match &mut self.state {
            LinkState::Open(link) => link.recv().await,
            _ => std::future::pending().await,
        }
    }

    /// Release the connection. Idempotent; safe in every state.
    pub fn close(&mut self) {
        self.pending.clear();
        match std::mem::replace(&mut self.state, LinkState::Closed) {
            LinkState::Open(mut link) => {
                link.close();
                info!("transport closed");
            }
            LinkState::Opening(pending) => settle_and_close(pending),
            LinkState::Unopened | LinkState::Closed => {}
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, LinkState::Open(_))
    }

    pub fn is_opening(&self) -> bool {
        matches!(self.state, LinkState::Opening(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, LinkState::Closed)
    }

    /// Chunks waiting for the handshake.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Let an abandoned handshake finish, then close what it produced.
fn settle_and_close(pending: OpenFuture) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            info!("close requested while opening; closing once the handshake settles");
            handle.spawn(async move {
                match pending.await {
                    Ok(mut link) => {
                        link.close();
                        info!("late transport link closed");
                    }
                    Err(e) => debug!("abandoned handshake failed: {e}"),
                }
            });
        }
        Err(_) => {
            warn!("no runtime to settle abandoned handshake; dropping it");
            drop(pending);
        }
    }
}
