//! Pipeline configuration: `.env` → optional `aurora.toml` → `AURORA_*` environment overrides.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | AURORA_CONFIG | ./aurora.toml | TOML file with any subset of the sections below. |
//! | AURORA_SAMPLE_RATE | 16000 | Capture sample rate (Hz). |
//! | AURORA_FRAME_MS | 30 | Frame duration; WebRTC VAD accepts 10, 20 or 30. |
//! | AURORA_VAD | webrtc | `webrtc` \| `energy` frame classifier. |
//! | AURORA_VAD_MODE | 2 | WebRTC aggressiveness 0-3. |
//! | AURORA_SILENCE_MS | 800 | Trailing silence that finalizes an utterance. |
//! | AURORA_LLM_URL / AURORA_LLM_MODEL | Cerebras / llama-3.3-70b | Chat completions endpoint. |
//! | LLM_API_KEY, CEREBRAS_API_KEY | — | Language model key (first non-empty wins). |
//! | STT_API_KEY, TTS_API_KEY, OPENAI_API_KEY | — | Speech keys; OPENAI_API_KEY is the shared fallback. |
//! | AURORA_BARGE_IN | interrupt | `interrupt` \| `queue` \| `discard`. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which frame classifier the capture thread runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VadKind {
    #[default]
    WebRtc,
    Energy,
}

/// What happens when the worker finishes speaking a new utterance while a response is
/// still being generated or played.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BargeInPolicy {
    /// Cancel in-flight synthesis, flush playback, answer the new utterance.
    #[default]
    Interrupt,
    /// Keep the latest utterance and answer it once the current response has played.
    Queue,
    /// Drop utterances that arrive while a response is active.
    Discard,
}

impl BargeInPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "interrupt" => Some(Self::Interrupt),
            "queue" => Some(Self::Queue),
            "discard" => Some(Self::Discard),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub vad: VadKind,
    /// WebRTC VAD mode (0-3, where 3 is most aggressive)
    pub vad_mode: u8,
    /// RMS level (i16 scale) above which the energy classifier reports speech
    pub energy_threshold: f32,
    /// Raw frames buffered between the capture callback and the classifier (drop-oldest)
    pub ring_capacity: usize,
    /// Classified frames buffered for the orchestrator
    pub frame_queue_capacity: usize,
    /// Synthesized buffers buffered for the playback thread
    pub playback_queue_capacity: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
            vad: VadKind::WebRtc,
            vad_mode: 2,
            energy_threshold: 500.0,
            ring_capacity: 64,
            frame_queue_capacity: 64,
            playback_queue_capacity: 16,
        }
    }
}

impl AudioSettings {
    /// Samples per frame (480 for 30ms at 16kHz).
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    pub silence_ms: u32,
    /// Force-finalize an utterance that never pauses (0 disables)
    pub max_utterance_ms: u32,
    /// Discard finalized utterances with less speech than this (0 disables)
    pub min_speech_ms: u32,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            silence_ms: 800,
            max_utterance_ms: 30_000,
            min_speech_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    /// Local ggml Whisper model (used when built with `--features whisper`)
    pub whisper_model_path: Option<PathBuf>,
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            timeout_secs: 30,
            whisper_model_path: None,
        }
    }
}

fn default_urgency_keywords() -> Vec<String> {
    [
        "gas", "leak", "fire", "injured", "emergency", "help", "danger", "smoke", "bleeding",
        "explosion",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub default_max_tokens: u32,
    /// Budget used when the input contains an urgency keyword (short, immediate instructions)
    pub urgent_max_tokens: u32,
    pub timeout_ms: u64,
    /// Turns kept after the preamble (sliding window)
    pub history_cap: usize,
    pub urgency_keywords: Vec<String>,
    /// Replaces the built-in preamble when set
    pub system_prompt: Option<String>,
    /// Site information (zones, contacts, procedures) appended to the preamble
    pub knowledge_path: Option<PathBuf>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.cerebras.ai/v1".to_string(),
            api_key: None,
            model: "llama-3.3-70b".to_string(),
            temperature: 0.2,
            default_max_tokens: 250,
            urgent_max_tokens: 150,
            timeout_ms: 15_000,
            history_cap: 20,
            urgency_keywords: default_urgency_keywords(),
            system_prompt: None,
            knowledge_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub voice: String,
    pub speed: f32,
    pub timeout_secs: u64,
    pub max_unit_chars: usize,
    /// Sentence units synthesized at the same time
    pub concurrency: usize,
    /// Out-of-order buffers held by playback before a missing unit is declared lost
    pub reorder_window: usize,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "nova".to_string(),
            speed: 1.4,
            timeout_secs: 30,
            max_unit_chars: 300,
            concurrency: 2,
            reorder_window: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Transcripts shorter than this (after trim) are dropped without a response
    pub min_transcript_chars: usize,
    /// Worker turns per session before the closing message is spoken and the session ends
    pub max_exchanges: usize,
    pub barge_in: BargeInPolicy,
    pub greeting: Option<String>,
    pub closing_message: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_transcript_chars: 3,
            max_exchanges: 20,
            barge_in: BargeInPolicy::Interrupt,
            greeting: Some(
                "Aurora emergency assistant. Describe your situation clearly. Speak now."
                    .to_string(),
            ),
            closing_message: "Maximum conversation length reached. Please start again if you need further assistance. Stay safe."
                .to_string(),
        }
    }
}

/// Full configuration for one Aurora voice deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuroraConfig {
    pub audio: AudioSettings,
    pub segmenter: SegmenterSettings,
    pub stt: SttSettings,
    pub llm: LlmSettings,
    pub tts: TtsSettings,
    pub pipeline: PipelineSettings,
}

impl AuroraConfig {
    /// Default path for the TOML file
    pub fn default_path() -> PathBuf {
        std::env::var("AURORA_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("aurora.toml"))
    }

    /// Load `.env`, then the TOML file if it exists, then environment overrides; validate.
    pub fn load() -> VoiceResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!(error = %e, ".env not loaded (using system environment)");
        }
        let path = Self::default_path();
        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.apply_env_with(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; absent sections keep their defaults.
    pub fn from_file(path: &Path) -> VoiceResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> VoiceResult<Self> {
        toml::from_str(content).map_err(|e| VoiceError::Config(format!("invalid TOML: {}", e)))
    }

    /// Apply environment overrides through `lookup` (injectable for tests).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };

        if let Some(v) = get("AURORA_SAMPLE_RATE").and_then(|v| v.parse().ok()) {
            self.audio.sample_rate = v;
        }
        if let Some(v) = get("AURORA_FRAME_MS").and_then(|v| v.parse().ok()) {
            self.audio.frame_ms = v;
        }
        if let Some(v) = get("AURORA_VAD") {
            match v.to_lowercase().as_str() {
                "webrtc" => self.audio.vad = VadKind::WebRtc,
                "energy" => self.audio.vad = VadKind::Energy,
                other => tracing::warn!(value = other, "unknown AURORA_VAD, keeping default"),
            }
        }
        if let Some(v) = get("AURORA_VAD_MODE").and_then(|v| v.parse().ok()) {
            self.audio.vad_mode = v;
        }
        if let Some(v) = get("AURORA_SILENCE_MS").and_then(|v| v.parse().ok()) {
            self.segmenter.silence_ms = v;
        }

        if let Some(v) = get("AURORA_LLM_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("AURORA_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("LLM_API_KEY").or_else(|| get("CEREBRAS_API_KEY")) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("AURORA_HISTORY_CAP").and_then(|v| v.parse().ok()) {
            self.llm.history_cap = v;
        }
        if let Some(v) = get("AURORA_KNOWLEDGE_PATH") {
            self.llm.knowledge_path = Some(PathBuf::from(v));
        }

        if let Some(v) = get("AURORA_STT_URL") {
            self.stt.base_url = v;
        }
        if let Some(v) = get("AURORA_STT_MODEL") {
            self.stt.model = v;
        }
        if let Some(v) = get("STT_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.stt.api_key = Some(v);
        }
        if let Some(v) = get("AURORA_WHISPER_MODEL_PATH") {
            self.stt.whisper_model_path = Some(PathBuf::from(v));
        }

        if let Some(v) = get("AURORA_TTS_URL") {
            self.tts.base_url = v;
        }
        if let Some(v) = get("AURORA_TTS_MODEL") {
            self.tts.model = v;
        }
        if let Some(v) = get("AURORA_TTS_VOICE") {
            self.tts.voice = v;
        }
        if let Some(v) = get("AURORA_TTS_SPEED").and_then(|v| v.parse().ok()) {
            self.tts.speed = v;
        }
        if let Some(v) = get("TTS_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.tts.api_key = Some(v);
        }

        if let Some(v) = get("AURORA_MAX_EXCHANGES").and_then(|v| v.parse().ok()) {
            self.pipeline.max_exchanges = v;
        }
        if let Some(v) = get("AURORA_BARGE_IN") {
            match BargeInPolicy::parse(&v) {
                Some(p) => self.pipeline.barge_in = p,
                None => tracing::warn!(value = %v, "unknown AURORA_BARGE_IN, keeping default"),
            }
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> VoiceResult<()> {
        let a = &self.audio;
        if a.frame_ms == 0 || a.sample_rate == 0 {
            return Err(VoiceError::Config(
                "sample_rate and frame_ms must be non-zero".to_string(),
            ));
        }
        if a.vad == VadKind::WebRtc {
            if !matches!(a.sample_rate, 8000 | 16000 | 32000 | 48000) {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    a.sample_rate
                )));
            }
            if !matches!(a.frame_ms, 10 | 20 | 30) {
                return Err(VoiceError::Config(format!(
                    "WebRTC VAD requires 10, 20 or 30 ms frames, got {}",
                    a.frame_ms
                )));
            }
            if a.vad_mode > 3 {
                return Err(VoiceError::Config(format!(
                    "VAD mode must be 0-3, got {}",
                    a.vad_mode
                )));
            }
        }
        if a.ring_capacity == 0 || a.frame_queue_capacity == 0 || a.playback_queue_capacity == 0 {
            return Err(VoiceError::Config("queue capacities must be non-zero".to_string()));
        }
        if self.segmenter.silence_ms == 0 {
            return Err(VoiceError::Config("silence_ms must be non-zero".to_string()));
        }
        if self.llm.history_cap == 0 {
            return Err(VoiceError::Config("history_cap must be non-zero".to_string()));
        }
        if self.tts.concurrency == 0 || self.tts.reorder_window == 0 {
            return Err(VoiceError::Config(
                "tts concurrency and reorder_window must be non-zero".to_string(),
            ));
        }
        if self.tts.concurrency > self.tts.reorder_window {
            return Err(VoiceError::Config(format!(
                "tts concurrency ({}) must not exceed reorder_window ({})",
                self.tts.concurrency, self.tts.reorder_window
            )));
        }
        if self.pipeline.max_exchanges == 0 {
            return Err(VoiceError::Config("max_exchanges must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn defaults_are_valid() {
        let config = AuroraConfig::default();
        assert_ok!(config.validate());
        assert_eq!(config.audio.frame_samples(), 480);
        assert_eq!(config.llm.default_max_tokens, 250);
        assert_eq!(config.llm.urgent_max_tokens, 150);
        assert_eq!(config.pipeline.barge_in, BargeInPolicy::Interrupt);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = AuroraConfig::from_toml_str(
            r#"
            [segmenter]
            silence_ms = 600

            [pipeline]
            barge_in = "queue"
            "#,
        )
        .unwrap();
        assert_eq!(config.segmenter.silence_ms, 600);
        assert_eq!(config.segmenter.max_utterance_ms, 30_000);
        assert_eq!(config.pipeline.barge_in, BargeInPolicy::Queue);
        assert_eq!(config.audio.sample_rate, 16000);
    }

    #[test]
    fn env_overrides_and_key_fallbacks() {
        let env: HashMap<&str, &str> = [
            ("AURORA_SILENCE_MS", "500"),
            ("CEREBRAS_API_KEY", "csk-123"),
            ("OPENAI_API_KEY", "sk-shared"),
            ("TTS_API_KEY", "  "),
            ("AURORA_BARGE_IN", "discard"),
            ("AURORA_VAD", "energy"),
        ]
        .into_iter()
        .collect();

        let mut config = AuroraConfig::default();
        config.apply_env_with(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.segmenter.silence_ms, 500);
        assert_eq!(config.llm.api_key.as_deref(), Some("csk-123"));
        assert_eq!(config.stt.api_key.as_deref(), Some("sk-shared"));
        // blank TTS_API_KEY falls through to the shared key
        assert_eq!(config.tts.api_key.as_deref(), Some("sk-shared"));
        assert_eq!(config.pipeline.barge_in, BargeInPolicy::Discard);
        assert_eq!(config.audio.vad, VadKind::Energy);
    }

    #[test]
    fn webrtc_constraints_are_enforced() {
        let mut config = AuroraConfig::default();
        config.audio.sample_rate = 44100;
        assert!(config.validate().is_err());

        config.audio.vad = VadKind::Energy;
        assert!(config.validate().is_ok());

        let mut config = AuroraConfig::default();
        config.audio.frame_ms = 25;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_caps_rejected() {
        let mut config = AuroraConfig::default();
        config.llm.history_cap = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn synthesis_lookahead_must_fit_the_reorder_window() {
        let mut config = AuroraConfig::default();
        config.tts.concurrency = 8;
        config.tts.reorder_window = 8;
        assert_ok!(config.validate());

        config.tts.concurrency = 9;
        let err = assert_err!(config.validate());
        assert!(err.to_string().contains("reorder_window"));
    }
}
