//! Error types for the Aurora voice pipeline

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice pipeline.
///
/// Device and playback-channel errors are fatal for a capture session. STT, TTS and
/// LLM errors are handled by the stage that raised them: skip the unit, drop the turn
/// or fall back. A cancelled turn is not an error.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("VAD initialization failed: {0}")]
    VadInit(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Audio codec error: {0}")]
    Codec(String),

    #[error("Language model error: {0}")]
    Llm(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Errors that end the capture session; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VoiceError::AudioDevice(_)
                | VoiceError::AudioStream(_)
                | VoiceError::Playback(_)
                | VoiceError::ChannelClosed(_)
        )
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        match err {
            hound::Error::IoError(e) => VoiceError::Io(e),
            other => VoiceError::Codec(other.to_string()),
        }
    }
}
