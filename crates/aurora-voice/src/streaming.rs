//! **StreamingSynthesizer** — sentence-level synthesis that feeds playback as it goes.
//!
//! Units are synthesized on the blocking pool with bounded concurrency and handed to
//! playback in sentence order, each as soon as it and every unit before it are done.
//! Lookahead never exceeds `concurrency`, so a slow first sentence holds back at most
//! that many finished units.

use crate::config::TtsSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::{AudioBuffer, PlaybackHandle, PlaybackItem, ResponseId};
use crate::sentence::prepare_units;
use crate::tts::TtsBackend;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shared cancellation signal for one response.
#[derive(Clone)]
pub struct CancelFlag {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // sender lives as long as any clone of self, so this is unreachable in practice
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynthesisReport {
    /// Units after splitting and sanitizing
    pub units: usize,
    pub synthesized: usize,
    pub failed: usize,
    pub cancelled: bool,
}

pub struct StreamingSynthesizer {
    tts: Arc<dyn TtsBackend>,
    concurrency: usize,
    max_unit_chars: usize,
}

impl StreamingSynthesizer {
    pub fn new(tts: Arc<dyn TtsBackend>, settings: &TtsSettings) -> Self {
        Self {
            tts,
            concurrency: settings.concurrency.max(1),
            max_unit_chars: settings.max_unit_chars,
        }
    }

    /// Synthesize `text` unit by unit into `playback` under `response`.
    ///
    /// A failed unit is sent as `Skip` and the rest continue. Ends with `EndOfResponse`
    /// unless cancelled. Errors only when playback has gone away.
    pub async fn synthesize_streaming(
        &self,
        text: &str,
        response: ResponseId,
        playback: &PlaybackHandle,
        cancel: &CancelFlag,
    ) -> VoiceResult<SynthesisReport> {
        let units = prepare_units(text, self.max_unit_chars);
        let mut report = SynthesisReport {
            units: units.len(),
            ..SynthesisReport::default()
        };
        debug!(response, units = report.units, "🗣️ Streaming synthesis started");

        let mut results = stream::iter(units.into_iter().map(|unit| {
            let tts = Arc::clone(&self.tts);
            async move {
                let seq = unit.seq;
                let result = tokio::task::spawn_blocking(move || tts.synthesize(&unit.text))
                    .await
                    .map_err(|e| VoiceError::Tts(format!("synthesis task failed: {}", e)))
                    .and_then(|r| r);
                (seq, result)
            }
        }))
        .buffered(self.concurrency);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = results.next() => Some(next),
            };
            let (seq, result) = match next {
                None => {
                    report.cancelled = true;
                    break;
                }
                Some(None) => break,
                Some(Some(done)) => done,
            };

            let item = match result {
                Ok(audio) if !audio.samples.is_empty() => {
                    report.synthesized += 1;
                    PlaybackItem::Audio {
                        response,
                        buffer: AudioBuffer::from_synthesized(seq, audio),
                    }
                }
                Ok(_) => {
                    report.failed += 1;
                    warn!(response, seq, "synthesis returned no audio, skipping unit");
                    PlaybackItem::Skip { response, seq }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(response, seq, error = %e, "synthesis failed, skipping unit");
                    PlaybackItem::Skip { response, seq }
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                sent = playback.send(item) => sent?,
            }
        }

        if report.cancelled {
            info!(response, synthesized = report.synthesized, "⏹️ Synthesis cancelled");
            return Ok(report);
        }

        playback
            .send(PlaybackItem::EndOfResponse {
                response,
                units: report.units,
            })
            .await?;
        debug!(
            response,
            synthesized = report.synthesized,
            failed = report.failed,
            "synthesis complete"
        );
        Ok(report)
    }
}
