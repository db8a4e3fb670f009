//! # voxlink-core
//!
//! Duplex realtime voice session SDK.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → SPSC RingBuffer → CapturePipeline (resample, 4096-sample frames)
//!                                        │ codec::encode, try_send
//!                                        ▼
//!                          VoiceSession loop ──► TransportSession ──► remote model
//!                                        ▲                               │
//!                        ServerEvent ────┴───────────────────────────────┘
//!                              │
//!              ┌───────────────┼──────────────────┐
//!      codec::decode   TranscriptBuffer     Interrupted
//!              │               │                  │
//!     PlaybackScheduler   broadcast::Sender   scheduler.interrupt()
//!              │          <TranscriptEvent>
//!        PlaybackSink (output timeline)
//! ```
//!
//! Audio callbacks never block. All per-session state lives on one tokio task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod capture;
pub mod codec;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod session;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{AudioDevices, Microphone, Speaker};
pub use codec::EncodedChunk;
pub use error::{Result, VoiceError};
pub use ipc::events::{
    CloseReason, SessionClosedEvent, SessionStatus, SessionStatusEvent, TranscriptEvent,
};
pub use playback::PlaybackSink;
pub use session::{diagnostics::DiagnosticsSnapshot, SessionConfig, VoiceSession};
pub use transport::{
    gemini::{GeminiLiveConfig, GeminiLiveConnector},
    Connector, OpenRequest, ServerEvent,
};
