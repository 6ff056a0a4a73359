//! **Text-to-Speech** — one sentence unit in, PCM out.

use crate::config::TtsSettings;
use crate::error::{VoiceError, VoiceResult};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Decoded speech for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesizedAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SynthesizedAudio {
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() as u64 / u64::from(self.channels.max(1));
        Duration::from_micros(frames * 1_000_000 / u64::from(self.sample_rate.max(1)))
    }
}

/// Backend that turns text into PCM. Blocking; the synthesizer runs it on the blocking pool.
pub trait TtsBackend: Send + Sync {
    fn synthesize(&self, text: &str) -> VoiceResult<SynthesizedAudio>;
}

/// Decode WAV bytes to 16-bit PCM, converting float and wider integer formats.
pub fn decode_wav(bytes: &[u8]) -> VoiceResult<SynthesizedAudio> {
    let reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, bits) if bits <= 32 => {
            let shift = bits.saturating_sub(16);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| (v >> shift).clamp(i16::MIN as i32, i16::MAX as i32) as i16))
                .collect::<Result<_, _>>()?
        }
        (hound::SampleFormat::Float, _) => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * 32767.0) as i16))
            .collect::<Result<_, _>>()?,
        (_, bits) => {
            return Err(VoiceError::Codec(format!(
                "unsupported WAV sample width {}",
                bits
            )))
        }
    };
    Ok(SynthesizedAudio {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

/// OpenAI-compatible speech API (`POST {base_url}/audio/speech`), WAV response.
#[derive(Debug, Clone)]
pub struct HttpTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    api_key: String,
    /// tts-1 (fast) or tts-1-hd (higher quality)
    pub model: String,
    pub voice: String,
    pub speed: f32,
    client: reqwest::blocking::Client,
}

impl HttpTts {
    pub fn from_settings(settings: &TtsSettings) -> VoiceResult<Self> {
        let api_key = settings.api_key.clone().ok_or_else(|| {
            VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string())
        })?;
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: settings.base_url.clone(),
            api_key,
            model: settings.model.clone(),
            voice: settings.voice.clone(),
            speed: settings.speed,
            client,
        })
    }

    /// Set a fixed voice (alloy, echo, fable, onyx, nova, shimmer, ...).
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

impl TtsBackend for HttpTts {
    fn synthesize(&self, text: &str) -> VoiceResult<SynthesizedAudio> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Tts("empty input".to_string()));
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "speed": self.speed,
            "response_format": "wav",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        decode_wav(&bytes)
    }
}

/// Placeholder TTS: silence whose length follows the text, so timing and ordering can be
/// exercised without a speech service.
#[derive(Debug, Clone)]
pub struct SilentTts {
    pub sample_rate: u32,
    pub ms_per_char: u32,
}

impl Default for SilentTts {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            ms_per_char: 10,
        }
    }
}

impl TtsBackend for SilentTts {
    fn synthesize(&self, text: &str) -> VoiceResult<SynthesizedAudio> {
        let ms = text.chars().count() as u64 * u64::from(self.ms_per_char);
        let len = (u64::from(self.sample_rate) * ms / 1000) as usize;
        Ok(SynthesizedAudio {
            samples: vec![0; len],
            sample_rate: self.sample_rate,
            channels: 1,
        })
    }
}

/// HTTP TTS when a key is configured, otherwise silence.
pub fn create_tts(settings: &TtsSettings) -> Arc<dyn TtsBackend> {
    match HttpTts::from_settings(settings) {
        Ok(tts) => {
            info!(model = %tts.model, voice = %tts.voice, speed = tts.speed, "🔊 Using HTTP TTS");
            Arc::new(tts)
        }
        Err(e) => {
            warn!(error = %e, "No TTS backend configured, responses will be silent");
            Arc::new(SilentTts::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::pcm_to_wav;

    #[test]
    fn silent_tts_scales_with_text() {
        let tts = SilentTts::default();
        let short = tts.synthesize("Go.").unwrap();
        let long = tts.synthesize("Leave the building now.").unwrap();
        assert_eq!(short.samples.len(), 480);
        assert!(long.samples.len() > short.samples.len());
        assert_eq!(short.duration(), Duration::from_millis(30));
    }

    #[test]
    fn decodes_16_bit_wav() {
        let wav = pcm_to_wav(&[1, -2, 300], 24000).unwrap();
        let audio = decode_wav(&wav).unwrap();
        assert_eq!(audio.samples, vec![1, -2, 300]);
        assert_eq!(audio.sample_rate, 24000);
        assert_eq!(audio.channels, 1);
    }

    #[test]
    fn decodes_float_wav() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0.5f32).unwrap();
            writer.write_sample(-1.0f32).unwrap();
            writer.finalize().unwrap();
        }
        let audio = decode_wav(&cursor.into_inner()).unwrap();
        assert_eq!(audio.samples, vec![16383, -32767]);
    }

    #[test]
    fn garbage_is_a_codec_error() {
        assert!(decode_wav(b"not a wav file at all").is_err());
    }

    #[test]
    fn http_tts_requires_key() {
        assert!(HttpTts::from_settings(&TtsSettings::default()).is_err());
        let settings = TtsSettings {
            api_key: Some("sk-test".to_string()),
            ..TtsSettings::default()
        };
        let tts = HttpTts::from_settings(&settings).unwrap().with_voice("onyx");
        assert_eq!(tts.voice, "onyx");
        assert!((tts.speed - 1.4).abs() < f32::EPSILON);
    }
}
