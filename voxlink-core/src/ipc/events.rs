//! Events a voice session publishes to its UI collaborator.
//!
//! | Event | Subscription |
//! |-------|--------------|
//! | `SessionStatusEvent` | `VoiceSession::subscribe_status` |
//! | `TranscriptEvent` | `VoiceSession::subscribe_transcript` |
//! | `SessionClosedEvent` | `VoiceSession::subscribe_closed` |

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// What the voice overlay should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Not activated, or closed.
    Idle,
    /// Devices being acquired / transport handshake in flight.
    Connecting,
    /// Open, microphone streaming, nothing playing.
    Listening,
    /// Model audio scheduled or playing.
    Speaking,
}

impl SessionStatus {
    pub fn is_active(self) -> bool {
        matches!(self, SessionStatus::Listening | SessionStatus::Speaking)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Listening => "listening",
            SessionStatus::Speaking => "speaking",
        };
        f.write_str(s)
    }
}

/// Published whenever the status changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. why the session went idle).
    pub detail: Option<String>,
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

/// Full transcript text of the current turn. Empty text marks a turn boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Why a session reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "message")]
pub enum CloseReason {
    /// `deactivate()` was called.
    UserRequested,
    /// Microphone or speaker could not be acquired.
    DeviceFailure(String),
    /// The transport handshake failed.
    OpenFailed(String),
    /// The transport failed or was closed by the remote after opening.
    TransportFailure(String),
}

impl CloseReason {
    /// Whether the overlay should be dismissed as a failure.
    pub fn is_error(&self) -> bool {
        !matches!(self, CloseReason::UserRequested)
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            CloseReason::UserRequested => None,
            CloseReason::DeviceFailure(m)
            | CloseReason::OpenFailed(m)
            | CloseReason::TransportFailure(m) => Some(m),
        }
    }
}

/// Published exactly once when the session closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClosedEvent {
    pub reason: CloseReason,
}
