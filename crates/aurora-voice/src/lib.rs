//! # Aurora Voice - Duplex Safety Voice Assistant
//!
//! Real-time voice loop for a hands-busy field worker: the microphone is segmented into
//! utterances, each utterance is transcribed, answered by a language model with safety
//! guidance, and spoken back sentence by sentence so the first sentence plays while the
//! rest is still being synthesized.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          VoiceOrchestrator                           │
//! │  ┌────────────┐   ┌────────────┐   ┌──────────────┐                  │
//! │  │  Capture   │ → │ Classifier │ → │  Segmenter   │ ── Utterance ─┐  │
//! │  │  (cpal)    │   │ (webrtc-vad│   │ (silence gap)│               │  │
//! │  │ drop-oldest│   │  thread)   │   └──────────────┘               ↓  │
//! │  └────────────┘   └────────────┘                  ┌──────────────────┐│
//! │                                                   │  VoicePipeline   ││
//! │  ┌────────────┐   ┌────────────┐   ┌──────────┐   │ STT → LLM → tags ││
//! │  │  Playback  │ ← │  Reorder   │ ← │ Streaming│ ← │ → sentence units ││
//! │  │  (rodio)   │   │  window    │   │ TTS (N)  │   └──────────────────┘│
//! │  └────────────┘   └────────────┘   └──────────┘                       │
//! │        ↑ interrupt (barge-in)                                         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod playback;
pub mod responder;
pub mod segmenter;
pub mod sentence;
pub mod streaming;
pub mod stt;
pub mod tags;
pub mod tts;
pub mod vad;

pub use audio::{AudioCapture, AudioFrame, AudioSource, FrameRing, SourceEvent};
pub use config::{
    AudioSettings, AuroraConfig, BargeInPolicy, LlmSettings, PipelineSettings,
    SegmenterSettings, SttSettings, TtsSettings, VadKind,
};
pub use error::{VoiceError, VoiceResult};
pub use history::{
    ConversationHistory, ConversationTurn, CriticalAlert, Role, Session, SessionStore,
    SessionSummary,
};
pub use llm::{ChatCompletionsModel, CompletionRequest, LanguageModel};
pub use orchestrator::VoiceOrchestrator;
pub use pipeline::{Spoken, TurnOutcome, VoicePipeline};
pub use playback::{
    AudioBuffer, AudioOutput, PlaybackEvent, PlaybackHandle, PlaybackItem, PlaybackSink,
    ReorderWindow, ResponseId, RodioOutput,
};
pub use responder::{GeneratedResponse, ResponseGenerator};
pub use segmenter::{SegmenterEvent, Utterance, UtteranceSegmenter};
pub use sentence::{prepare_units, split_sentences, ResponseUnit};
pub use streaming::{CancelFlag, StreamingSynthesizer, SynthesisReport};
pub use stt::{create_stt, transcribe_utterance, HttpStt, PlaceholderStt, SttBackend};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tags::{parse_reply, TaggedReply, Urgency};
pub use tts::{create_tts, HttpTts, SilentTts, SynthesizedAudio, TtsBackend};
pub use vad::{create_classifier, EnergyVad, VoiceActivity, WebRtcVad};
