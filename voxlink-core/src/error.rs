use thiserror::Error;

/// All errors produced by voxlink-core.
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("audio device error: {0}")]
    Device(String),

    #[error("no input device found")]
    NoInputDevice,

    #[error("no output device found")]
    NoOutputDevice,

    #[error("transport open failed: {0}")]
    TransportOpen(String),

    #[error("transport error: {0}")]
    TransportRuntime(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("voice session is already active")]
    AlreadyActive,

    #[error("voice session is closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoiceError {
    /// Whether this error ends the session it occurred in.
    ///
    /// Codec errors only cost the offending frame.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, VoiceError::Codec(_))
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
