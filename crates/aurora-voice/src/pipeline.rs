//! Turn processing shared by every transport.
//!
//! `respond_text` is the text-in/text-out contract: a telephony bridge or chat adapter
//! calls it directly, the microphone orchestrator calls it through `handle_utterance`.

use crate::config::{AuroraConfig, PipelineSettings};
use crate::error::VoiceResult;
use crate::history::{CriticalAlert, SessionStore, SessionSummary};
use crate::llm::LanguageModel;
use crate::playback::{PlaybackHandle, ResponseId};
use crate::responder::{build_preamble, GeneratedResponse, ResponseGenerator};
use crate::segmenter::Utterance;
use crate::streaming::{CancelFlag, StreamingSynthesizer, SynthesisReport};
use crate::stt::{transcribe_utterance, SttBackend};
use crate::tts::TtsBackend;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Speech queued on the playback thread for one response.
#[derive(Debug, Clone, PartialEq)]
pub struct Spoken {
    pub response_id: ResponseId,
    pub report: SynthesisReport,
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Answered {
        session_id: String,
        input: String,
        response: GeneratedResponse,
        /// None when the pipeline has no playback (text transports)
        spoken: Option<Spoken>,
    },
    /// The exchange cap was reached; the closing message was spoken and the session evicted.
    SessionClosed {
        summary: SessionSummary,
        spoken: Option<Spoken>,
    },
}

impl TurnOutcome {
    pub fn spoken(&self) -> Option<&Spoken> {
        match self {
            TurnOutcome::Answered { spoken, .. } | TurnOutcome::SessionClosed { spoken, .. } => {
                spoken.as_ref()
            }
        }
    }
}

pub struct VoicePipeline {
    sessions: Arc<SessionStore>,
    stt: Arc<dyn SttBackend>,
    generator: ResponseGenerator,
    synthesizer: StreamingSynthesizer,
    playback: Option<PlaybackHandle>,
    settings: PipelineSettings,
}

impl VoicePipeline {
    pub fn new(
        config: &AuroraConfig,
        stt: Arc<dyn SttBackend>,
        model: Arc<dyn LanguageModel>,
        tts: Arc<dyn TtsBackend>,
        playback: Option<PlaybackHandle>,
    ) -> VoiceResult<Self> {
        let preamble = build_preamble(&config.llm)?;
        Ok(Self {
            sessions: Arc::new(SessionStore::new(preamble, config.llm.history_cap)),
            stt,
            generator: ResponseGenerator::new(model, &config.llm),
            synthesizer: StreamingSynthesizer::new(tts, &config.tts),
            playback,
            settings: config.pipeline.clone(),
        })
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn playback(&self) -> Option<&PlaybackHandle> {
        self.playback.as_ref()
    }

    /// Synthesize and queue `text` for playback. No-op without playback.
    pub async fn speak(&self, text: &str, cancel: &CancelFlag) -> VoiceResult<Option<Spoken>> {
        let Some(playback) = &self.playback else {
            return Ok(None);
        };
        let response_id = playback.begin_response();
        let report = self
            .synthesizer
            .synthesize_streaming(text, response_id, playback, cancel)
            .await?;
        Ok(Some(Spoken {
            response_id,
            report,
        }))
    }

    /// Speak the configured greeting, if any.
    pub async fn greet(&self, cancel: &CancelFlag) -> VoiceResult<Option<Spoken>> {
        match self.settings.greeting.as_deref() {
            Some(greeting) if !greeting.trim().is_empty() => self.speak(greeting, cancel).await,
            _ => Ok(None),
        }
    }

    /// Answer one worker turn. Returns `None` when the input is too short to act on or
    /// the turn was cancelled before anything was recorded.
    pub async fn respond_text(
        &self,
        session_id: &str,
        text: &str,
        cancel: &CancelFlag,
    ) -> VoiceResult<Option<TurnOutcome>> {
        let input = text.trim();
        let chars = input.chars().count();
        if chars < self.settings.min_transcript_chars {
            debug!(session = session_id, chars, "⏭️ Transcript too short, dropping turn");
            return Ok(None);
        }

        let handle = self.sessions.open(session_id);
        let mut session = handle.lock().await;

        if session.exchanges >= self.settings.max_exchanges {
            info!(session = session_id, exchanges = session.exchanges, "Exchange cap reached");
            drop(session);
            let spoken = self.speak(&self.settings.closing_message, cancel).await?;
            return Ok(self
                .sessions
                .end(session_id)
                .await
                .map(|summary| TurnOutcome::SessionClosed { summary, spoken }));
        }

        info!(session = session_id, input, "👷 Worker");
        let response = self.generator.generate(&session.history, input).await;
        if cancel.is_cancelled() {
            debug!(session = session_id, "turn cancelled before it was answered");
            return Ok(None);
        }

        session.record_exchange(input, &response.text);
        if response.urgency.is_alert() {
            session.record_alert(CriticalAlert {
                timestamp: Utc::now(),
                urgency: response.urgency,
                input: input.to_string(),
                response: response.text.clone(),
                sources: response.sources.clone(),
            });
        }
        drop(session);

        info!(
            session = session_id,
            urgency = %response.urgency,
            sources = ?response.sources,
            "🤖 Aurora: {}",
            response.text
        );

        let spoken = self.speak(&response.text, cancel).await?;
        Ok(Some(TurnOutcome::Answered {
            session_id: session_id.to_string(),
            input: input.to_string(),
            response,
            spoken,
        }))
    }

    /// Transcribe a finalized utterance and answer it. Transcription failures drop the turn.
    pub async fn handle_utterance(
        &self,
        session_id: &str,
        utterance: Utterance,
        cancel: &CancelFlag,
    ) -> VoiceResult<Option<TurnOutcome>> {
        let text = match transcribe_utterance(Arc::clone(&self.stt), utterance).await {
            Ok(t) => t,
            Err(e) => {
                warn!(session = session_id, error = %e, "transcription failed, dropping turn");
                return Ok(None);
            }
        };
        if cancel.is_cancelled() {
            return Ok(None);
        }
        self.respond_text(session_id, &text, cancel).await
    }

    pub async fn end_session(&self, session_id: &str) -> Option<SessionSummary> {
        self.sessions.end(session_id).await
    }
}
