//! Utterance segmentation: IDLE / ACCUMULATING over classified frames.
//!
//! The segmenter counts frames rather than reading a clock, so its output depends only on
//! the frame sequence. An utterance is finalized when `ceil(silence_ms / frame_ms)`
//! consecutive silence frames follow speech. Trailing silence below that threshold is kept
//! in the utterance; the frame that reaches it is not.

use crate::audio::AudioFrame;
use crate::config::SegmenterSettings;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One complete spoken turn, owned by the segmenter until finalized.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub speech_frames: usize,
    /// Silence frames retained after the last speech frame
    pub trailing_silence_frames: usize,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl Utterance {
    fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
            speech_frames: 0,
            trailing_silence_frames: 0,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    fn append(&mut self, frame: &[i16]) {
        self.samples.extend_from_slice(frame);
        self.duration = Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64);
    }
}

/// Output of feeding one frame to the segmenter.
#[derive(Debug, Clone)]
pub enum SegmenterEvent {
    /// IDLE → ACCUMULATING
    SpeechStarted,
    /// Utterance complete; hand to the transcriber
    Finalized(Utterance),
    /// Utterance closed but shorter than the minimum speech duration
    Discarded { speech_frames: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterState {
    Idle,
    Accumulating,
}

pub struct UtteranceSegmenter {
    sample_rate: u32,
    frame_ms: u32,
    silence_threshold: usize,
    max_frames: Option<usize>,
    min_speech_frames: usize,
    current: Option<Utterance>,
    silence_count: usize,
}

fn frames_for(ms: u32, frame_ms: u32) -> usize {
    (ms as usize).div_ceil(frame_ms.max(1) as usize)
}

impl UtteranceSegmenter {
    pub fn new(settings: &SegmenterSettings, sample_rate: u32, frame_ms: u32) -> Self {
        let silence_threshold = frames_for(settings.silence_ms, frame_ms).max(1);
        let max_frames = (settings.max_utterance_ms > 0)
            .then(|| frames_for(settings.max_utterance_ms, frame_ms).max(1));
        let min_speech_frames = frames_for(settings.min_speech_ms, frame_ms);

        debug!(
            silence_threshold,
            ?max_frames,
            min_speech_frames,
            "utterance segmenter configured"
        );

        Self {
            sample_rate,
            frame_ms,
            silence_threshold,
            max_frames,
            min_speech_frames,
            current: None,
            silence_count: 0,
        }
    }

    pub fn state(&self) -> SegmenterState {
        if self.current.is_some() {
            SegmenterState::Accumulating
        } else {
            SegmenterState::Idle
        }
    }

    /// Silence frames needed to finalize an utterance
    pub fn silence_threshold(&self) -> usize {
        self.silence_threshold
    }

    /// Feed one classified frame.
    pub fn push(&mut self, frame: AudioFrame) -> Option<SegmenterEvent> {
        match (self.current.is_some(), frame.is_speech) {
            (false, true) => {
                info!(seq = frame.seq, "🎤 Speech started");
                let mut utterance = Utterance::new(self.sample_rate);
                utterance.append(&frame.samples);
                utterance.speech_frames = 1;
                self.current = Some(utterance);
                self.silence_count = 0;
                if self.max_frames == Some(1) {
                    return self.close("max utterance length");
                }
                Some(SegmenterEvent::SpeechStarted)
            }
            (true, true) => {
                let utterance = self.current.as_mut()?;
                utterance.append(&frame.samples);
                utterance.speech_frames += 1;
                // retained silence before this frame is now interior, not trailing
                utterance.trailing_silence_frames = 0;
                self.silence_count = 0;
                self.check_max_length()
            }
            (true, false) => {
                self.silence_count += 1;
                if self.silence_count >= self.silence_threshold {
                    return self.close("silence threshold");
                }
                let utterance = self.current.as_mut()?;
                utterance.append(&frame.samples);
                utterance.trailing_silence_frames += 1;
                self.check_max_length()
            }
            (false, false) => None,
        }
    }

    fn check_max_length(&mut self) -> Option<SegmenterEvent> {
        let max = self.max_frames?;
        let held = self.current.as_ref().map(|u| u.samples.len()).unwrap_or(0);
        let frame_samples = (self.sample_rate as usize * self.frame_ms as usize / 1000).max(1);
        if held / frame_samples >= max {
            warn!(max_frames = max, "⏱️ Max utterance duration reached, finalizing");
            return self.close("max utterance length");
        }
        None
    }

    /// Finalize any open utterance (end of stream).
    pub fn flush(&mut self) -> Option<SegmenterEvent> {
        if self.current.is_some() {
            self.close("flush")
        } else {
            None
        }
    }

    /// Drop any open utterance without emitting it.
    pub fn reset(&mut self) {
        if self.current.take().is_some() {
            debug!("open utterance dropped by reset");
        }
        self.silence_count = 0;
    }

    fn close(&mut self, reason: &str) -> Option<SegmenterEvent> {
        let utterance = self.current.take()?;
        self.silence_count = 0;

        if utterance.speech_frames == 0 {
            return None;
        }
        if utterance.speech_frames < self.min_speech_frames {
            debug!(
                speech_frames = utterance.speech_frames,
                min = self.min_speech_frames,
                "⏭️ Speech too short, discarding"
            );
            return Some(SegmenterEvent::Discarded {
                speech_frames: utterance.speech_frames,
            });
        }

        info!(
            reason,
            speech_frames = utterance.speech_frames,
            trailing_silence = utterance.trailing_silence_frames,
            duration_ms = utterance.duration.as_millis() as u64,
            "✅ Utterance finalized"
        );
        Some(SegmenterEvent::Finalized(utterance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 480;

    fn frame(seq: u64, speech: bool) -> AudioFrame {
        let value = if speech { seq as i16 } else { 0 };
        AudioFrame {
            seq,
            samples: vec![value; FRAME],
            is_speech: speech,
        }
    }

    fn segmenter(silence_ms: u32) -> UtteranceSegmenter {
        let settings = SegmenterSettings {
            silence_ms,
            max_utterance_ms: 0,
            min_speech_ms: 0,
        };
        UtteranceSegmenter::new(&settings, 16000, 30)
    }

    fn feed(seg: &mut UtteranceSegmenter, pattern: &[bool]) -> Vec<SegmenterEvent> {
        pattern
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| seg.push(frame(i as u64 + 1, s)))
            .collect()
    }

    fn finalized(events: &[SegmenterEvent]) -> Vec<&Utterance> {
        events
            .iter()
            .filter_map(|e| match e {
                SegmenterEvent::Finalized(u) => Some(u),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn threshold_rounds_up() {
        assert_eq!(segmenter(800).silence_threshold(), 27);
        assert_eq!(segmenter(810).silence_threshold(), 27);
        assert_eq!(segmenter(90).silence_threshold(), 3);
        assert_eq!(segmenter(1).silence_threshold(), 1);
    }

    #[test]
    fn silence_alone_never_finalizes() {
        let mut seg = segmenter(90);
        let events = feed(&mut seg, &[false; 50]);
        assert!(events.is_empty());
        assert_eq!(seg.state(), SegmenterState::Idle);
        assert!(seg.flush().is_none());
    }

    #[test]
    fn five_speech_frames_then_silence() {
        let mut seg = segmenter(90);
        let mut pattern = vec![true; 5];
        pattern.extend([false; 3]);
        let events = feed(&mut seg, &pattern);

        assert!(matches!(events[0], SegmenterEvent::SpeechStarted));
        let utterances = finalized(&events);
        assert_eq!(utterances.len(), 1);
        let u = utterances[0];
        assert_eq!(u.speech_frames, 5);
        // threshold 3: the first two silence frames are retained, the third finalizes
        assert_eq!(u.trailing_silence_frames, 2);
        assert_eq!(u.samples.len(), 7 * FRAME);
        for (i, chunk) in u.samples.chunks(FRAME).take(5).enumerate() {
            assert!(chunk.iter().all(|&s| s == i as i16 + 1));
        }
        assert_eq!(seg.state(), SegmenterState::Idle);
    }

    #[test]
    fn short_pause_does_not_split() {
        let mut seg = segmenter(90);
        let events = feed(
            &mut seg,
            &[true, true, false, false, true, false, false, false],
        );
        let utterances = finalized(&events);
        assert_eq!(utterances.len(), 1);
        assert_eq!(utterances[0].speech_frames, 3);
        assert_eq!(utterances[0].trailing_silence_frames, 2);
        // interior pause is kept
        assert_eq!(utterances[0].samples.len(), 7 * FRAME);
    }

    #[test]
    fn insufficient_silence_keeps_accumulating() {
        let mut seg = segmenter(90);
        let events = feed(&mut seg, &[true, false, false]);
        assert!(finalized(&events).is_empty());
        assert_eq!(seg.state(), SegmenterState::Accumulating);

        match seg.flush() {
            Some(SegmenterEvent::Finalized(u)) => assert_eq!(u.speech_frames, 1),
            other => panic!("expected flush to finalize, got {:?}", other),
        }
    }

    #[test]
    fn two_utterances_in_sequence() {
        let mut seg = segmenter(60);
        let events = feed(
            &mut seg,
            &[true, false, false, false, true, true, false, false],
        );
        let utterances = finalized(&events);
        assert_eq!(utterances.len(), 2);
        assert_eq!(utterances[0].speech_frames, 1);
        assert_eq!(utterances[1].speech_frames, 2);
    }

    #[test]
    fn max_length_forces_finalize() {
        let settings = SegmenterSettings {
            silence_ms: 900,
            max_utterance_ms: 150,
            min_speech_ms: 0,
        };
        let mut seg = UtteranceSegmenter::new(&settings, 16000, 30);
        let events = feed(&mut seg, &[true; 7]);
        let utterances = finalized(&events);
        assert_eq!(utterances.len(), 1);
        assert_eq!(utterances[0].speech_frames, 5);
        // the 6th frame opened a new utterance
        assert_eq!(seg.state(), SegmenterState::Accumulating);
    }

    #[test]
    fn short_speech_is_discarded() {
        let settings = SegmenterSettings {
            silence_ms: 60,
            max_utterance_ms: 0,
            min_speech_ms: 90,
        };
        let mut seg = UtteranceSegmenter::new(&settings, 16000, 30);
        let events = feed(&mut seg, &[true, true, false, false]);
        assert!(finalized(&events).is_empty());
        assert!(matches!(
            events.last(),
            Some(SegmenterEvent::Discarded { speech_frames: 2 })
        ));
    }

    #[test]
    fn reset_drops_open_utterance() {
        let mut seg = segmenter(90);
        feed(&mut seg, &[true, true]);
        seg.reset();
        assert_eq!(seg.state(), SegmenterState::Idle);
        assert!(seg.flush().is_none());
    }
}
