//! **Speech-to-Text** — turn a finalized `Utterance` into text.
//!
//! Backends are blocking; `transcribe_utterance` runs them on tokio's blocking pool so
//! the orchestrator loop and the capture thread never wait on a transcription.

use crate::config::SttSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::segmenter::Utterance;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Backend for converting 16-bit mono PCM to text.
pub trait SttBackend: Send + Sync {
    /// Return an empty string when nothing intelligible was heard.
    fn transcribe(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String>;
}

/// Encode 16-bit mono PCM as WAV bytes for API upload.
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample(s)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Placeholder STT: returns a fixed string. Use for testing the voice loop without Whisper/API.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl SttBackend for PlaceholderStt {
    fn transcribe(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        let secs = samples.len() as f32 / sample_rate.max(1) as f32;
        Ok(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            samples.len(),
            secs
        ))
    }
}

/// OpenAI-compatible transcription API (`POST {base_url}/audio/transcriptions`).
#[derive(Debug, Clone)]
pub struct HttpStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// whisper-1, gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::blocking::Client,
}

impl HttpStt {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Build from settings; requires an API key.
    pub fn from_settings(settings: &SttSettings) -> VoiceResult<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            VoiceError::Config("STT requires STT_API_KEY or OPENAI_API_KEY".to_string())
        })?;
        Self::new(
            settings.base_url.clone(),
            api_key,
            settings.model.clone(),
            Duration::from_secs(settings.timeout_secs),
        )
    }
}

impl SttBackend for HttpStt {
    fn transcribe(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", "en");
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        Ok(text)
    }
}

#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use std::sync::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper STT on a ggml model (e.g. ggml-base.en.bin). Expects 16 kHz input.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let params = WhisperContextParameters::default();
            let context = WhisperContext::new_with_params(model_path, params)
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                context,
                state: Mutex::new(state),
            })
        }
    }

    impl SttBackend for WhisperStt {
        fn transcribe(&self, samples: &[i16], sample_rate: u32) -> VoiceResult<String> {
            if samples.is_empty() {
                return Ok(String::new());
            }
            if sample_rate != 16000 {
                return Err(VoiceError::Stt(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    sample_rate
                )));
            }
            let audio: Vec<f32> = samples.iter().map(|&s| s as f32 / 32768.0).collect();

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some("en"));

            let mut state = self
                .state
                .lock()
                .map_err(|e| VoiceError::Stt(format!("Whisper lock poisoned: {}", e)))?;
            state
                .full(params, &audio)
                .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
            let text = state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok())
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string();
            Ok(text)
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Pick a backend: local Whisper when built with `whisper` and a model path is configured,
/// then the HTTP API when a key is present, else the placeholder.
pub fn create_stt(settings: &SttSettings) -> Arc<dyn SttBackend> {
    #[cfg(feature = "whisper")]
    {
        if let Some(path) = settings.whisper_model_path.as_ref().and_then(|p| p.to_str()) {
            match whisper_stt::WhisperStt::new(path) {
                Ok(w) => {
                    info!(model = path, "🗣️ Using local Whisper STT");
                    return Arc::new(w);
                }
                Err(e) => warn!(error = %e, "Whisper model failed to load, trying HTTP STT"),
            }
        }
    }
    match HttpStt::from_settings(settings) {
        Ok(http) => {
            info!(model = %http.model, "🗣️ Using HTTP STT");
            Arc::new(http)
        }
        Err(e) => {
            warn!(error = %e, "No STT backend configured, using placeholder");
            Arc::new(PlaceholderStt::new())
        }
    }
}

/// Transcribe on the blocking pool. The utterance is consumed here.
pub async fn transcribe_utterance(
    backend: Arc<dyn SttBackend>,
    utterance: Utterance,
) -> VoiceResult<String> {
    let started = std::time::Instant::now();
    let text = tokio::task::spawn_blocking(move || {
        backend.transcribe(&utterance.samples, utterance.sample_rate)
    })
    .await
    .map_err(|e| VoiceError::Stt(format!("transcription task failed: {}", e)))??;
    debug!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        chars = text.len(),
        "transcription complete"
    );
    Ok(text)
}
