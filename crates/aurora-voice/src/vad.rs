//! Per-frame voice activity classification.
//!
//! The segmenter only consumes booleans, so the classifier is pluggable: `WebRtcVad`
//! wraps the WebRTC detector, `EnergyVad` is a plain RMS gate for sample rates or
//! frame sizes WebRTC does not accept.

use crate::config::{AudioSettings, VadKind};
use crate::error::{VoiceError, VoiceResult};
use tracing::info;
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Classifies one fixed-size PCM frame as speech or non-speech.
///
/// Implementations may hold non-`Send` state; the capture pipeline constructs them
/// on the thread that uses them.
pub trait VoiceActivity {
    fn classify(&mut self, frame: &[i16]) -> VoiceResult<bool>;

    /// Clear any adaptive state between sessions.
    fn reset(&mut self) -> VoiceResult<()> {
        Ok(())
    }
}

/// Voice Activity Detector using WebRTC VAD
pub struct WebRtcVad {
    vad: Vad,
    sample_rate: u32,
    mode: u8,
    frame_samples: usize,
}

impl WebRtcVad {
    pub fn new(sample_rate: u32, frame_ms: u32, mode: u8) -> VoiceResult<Self> {
        info!(sample_rate, mode, frame_ms, "🎙️ Initializing WebRTC VAD");

        if !matches!(frame_ms, 10 | 20 | 30) {
            return Err(VoiceError::VadInit(format!(
                "WebRTC VAD requires 10, 20 or 30 ms frames, got {}",
                frame_ms
            )));
        }
        if mode > 3 {
            return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {}", mode)));
        }
        let vad = build_vad(sample_rate, mode)?;

        Ok(Self {
            vad,
            sample_rate,
            mode,
            frame_samples: (sample_rate as usize * frame_ms as usize) / 1000,
        })
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

fn build_vad(sample_rate: u32, mode: u8) -> VoiceResult<Vad> {
    let rate = match sample_rate {
        8000 => SampleRate::Rate8kHz,
        16000 => SampleRate::Rate16kHz,
        32000 => SampleRate::Rate32kHz,
        48000 => SampleRate::Rate48kHz,
        other => {
            return Err(VoiceError::VadInit(format!(
                "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                other
            )))
        }
    };
    let vad_mode = match mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    };
    Ok(Vad::new_with_rate_and_mode(rate, vad_mode))
}

impl VoiceActivity for WebRtcVad {
    fn classify(&mut self, frame: &[i16]) -> VoiceResult<bool> {
        if frame.len() != self.frame_samples {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.frame_samples,
                frame.len()
            )));
        }
        self.vad
            .is_voice_segment(frame)
            .map_err(|_| VoiceError::VadProcessing("VAD rejected frame".to_string()))
    }

    fn reset(&mut self) -> VoiceResult<()> {
        // WebRTC VAD doesn't have explicit reset, recreate it
        self.vad = build_vad(self.sample_rate, self.mode)?;
        Ok(())
    }
}

/// RMS gate: speech when the frame's root-mean-square level exceeds `threshold`.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    threshold: f32,
}

impl EnergyVad {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl VoiceActivity for EnergyVad {
    fn classify(&mut self, frame: &[i16]) -> VoiceResult<bool> {
        if frame.is_empty() {
            return Ok(false);
        }
        let sum: f64 = frame.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
        let rms = (sum / frame.len() as f64).sqrt();
        Ok(rms > f64::from(self.threshold))
    }
}

/// Build the classifier selected in `settings`.
pub fn create_classifier(settings: &AudioSettings) -> VoiceResult<Box<dyn VoiceActivity>> {
    match settings.vad {
        VadKind::WebRtc => Ok(Box::new(WebRtcVad::new(
            settings.sample_rate,
            settings.frame_ms,
            settings.vad_mode,
        )?)),
        VadKind::Energy => Ok(Box::new(EnergyVad::new(settings.energy_threshold))),
    }
}
