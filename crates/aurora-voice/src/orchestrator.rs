//! **VoiceOrchestrator** — the microphone session's event loop.
//!
//! The loop owns the segmenter and waits on four sources: classified frames, the active
//! worker task, playback completion and shutdown. Finalized utterances are handed to a
//! spawned task (transcribe → generate → synthesize), so the loop itself never waits on
//! remote I/O. At most one response is in flight; what happens to an utterance that
//! finishes while a response is active is decided by `BargeInPolicy`.

use crate::audio::SourceEvent;
use crate::config::{AuroraConfig, BargeInPolicy};
use crate::error::{VoiceError, VoiceResult};
use crate::history::SessionSummary;
use crate::pipeline::{Spoken, TurnOutcome, VoicePipeline};
use crate::playback::{PlaybackEvent, ResponseId};
use crate::segmenter::{SegmenterEvent, Utterance, UtteranceSegmenter};
use crate::streaming::CancelFlag;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

enum WorkerOutput {
    Greeting(Option<Spoken>),
    Turn(Option<TurnOutcome>),
}

struct ActiveTurn {
    task: JoinHandle<VoiceResult<WorkerOutput>>,
    cancel: CancelFlag,
}

/// Loop state that outlives a single select iteration.
#[derive(Default)]
struct LoopState {
    active: Option<ActiveTurn>,
    /// Response currently queued on playback
    speaking: Option<ResponseId>,
    /// Highest response id playback has reported finished
    finished_through: ResponseId,
    /// Utterance waiting for the active response (Queue policy)
    pending: Option<Utterance>,
}

impl LoopState {
    fn is_busy(&self) -> bool {
        self.active.is_some() || self.speaking.is_some()
    }

    fn is_idle(&self) -> bool {
        !self.is_busy() && self.pending.is_none()
    }
}

pub struct VoiceOrchestrator {
    pipeline: Arc<VoicePipeline>,
    segmenter: UtteranceSegmenter,
    policy: BargeInPolicy,
    session_id: String,
    playback_events: Option<mpsc::UnboundedReceiver<PlaybackEvent>>,
}

fn new_session_id() -> String {
    format!("mic-{}", Uuid::new_v4())
}

async fn join_active(active: &mut Option<ActiveTurn>) -> Result<VoiceResult<WorkerOutput>, JoinError> {
    match active {
        Some(turn) => (&mut turn.task).await,
        None => std::future::pending().await,
    }
}

async fn next_playback_event(
    events: &mut Option<mpsc::UnboundedReceiver<PlaybackEvent>>,
) -> Option<PlaybackEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl VoiceOrchestrator {
    pub fn new(
        pipeline: Arc<VoicePipeline>,
        config: &AuroraConfig,
        playback_events: Option<mpsc::UnboundedReceiver<PlaybackEvent>>,
    ) -> Self {
        Self {
            pipeline,
            segmenter: UtteranceSegmenter::new(
                &config.segmenter,
                config.audio.sample_rate,
                config.audio.frame_ms,
            ),
            policy: config.pipeline.barge_in,
            session_id: new_session_id(),
            playback_events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run until `shutdown` resolves, the frame channel closes and all work has drained,
    /// or the audio device or playback fails. Returns the summary of the session that was open.
    pub async fn run<S>(
        &mut self,
        mut frames: mpsc::Receiver<SourceEvent>,
        shutdown: S,
    ) -> VoiceResult<Option<SessionSummary>>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut state = LoopState::default();
        let mut frames_closed = false;

        info!(session = %self.session_id, policy = ?self.policy, "🎧 Voice session started");
        state.active = Some(self.spawn_greeting());

        loop {
            if frames_closed && state.is_idle() {
                info!("frame source closed and all responses finished");
                break;
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("🛑 Shutdown requested");
                    break;
                }

                event = frames.recv(), if !frames_closed => match event {
                    Some(SourceEvent::Frame(frame)) => {
                        if let Some(ev) = self.segmenter.push(frame) {
                            self.on_segment(ev, &mut state);
                        }
                    }
                    Some(SourceEvent::DeviceError(msg)) => {
                        error!(error = %msg, "❌ Audio device failed, ending session");
                        self.interrupt(&mut state);
                        self.pipeline.end_session(&self.session_id).await;
                        return Err(VoiceError::AudioDevice(msg));
                    }
                    None => {
                        frames_closed = true;
                        if let Some(ev) = self.segmenter.flush() {
                            self.on_segment(ev, &mut state);
                        }
                    }
                },

                joined = join_active(&mut state.active) => {
                    let cancelled = state
                        .active
                        .take()
                        .map(|t| t.cancel.is_cancelled())
                        .unwrap_or(false);
                    if let Err(e) = self.on_worker_done(joined, cancelled, &mut state) {
                        self.pipeline.end_session(&self.session_id).await;
                        return Err(e);
                    }
                }

                event = next_playback_event(&mut self.playback_events) => match event {
                    Some(PlaybackEvent::ResponseFinished { response, interrupted, .. }) => {
                        state.finished_through = state.finished_through.max(response);
                        if state.speaking == Some(response) {
                            debug!(response, interrupted, "response finished playing");
                            state.speaking = None;
                        }
                    }
                    None => {
                        warn!("playback event channel closed");
                        self.playback_events = None;
                        state.speaking = None;
                    }
                },
            }

            if !state.is_busy() {
                if let Some(utterance) = state.pending.take() {
                    info!("▶️ Answering queued utterance");
                    state.active = Some(self.spawn_turn(utterance));
                }
            }
        }

        self.interrupt(&mut state);
        Ok(self.pipeline.end_session(&self.session_id).await)
    }

    fn on_segment(&self, event: SegmenterEvent, state: &mut LoopState) {
        let utterance = match event {
            SegmenterEvent::Finalized(u) => u,
            SegmenterEvent::SpeechStarted => return,
            SegmenterEvent::Discarded { speech_frames } => {
                debug!(speech_frames, "utterance discarded");
                return;
            }
        };

        if !state.is_busy() {
            state.active = Some(self.spawn_turn(utterance));
            return;
        }

        match self.policy {
            BargeInPolicy::Interrupt => {
                info!("✋ Barge-in: interrupting current response");
                self.interrupt(state);
                state.active = Some(self.spawn_turn(utterance));
            }
            BargeInPolicy::Queue => {
                if state.pending.replace(utterance).is_some() {
                    debug!("queued utterance replaced by a newer one");
                }
            }
            BargeInPolicy::Discard => {
                info!("utterance discarded while a response is active");
            }
        }
    }

    fn on_worker_done(
        &mut self,
        joined: Result<VoiceResult<WorkerOutput>, JoinError>,
        cancelled: bool,
        state: &mut LoopState,
    ) -> VoiceResult<()> {
        let output = match joined {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.is_fatal() => {
                error!(error = %e, "❌ Response failed fatally, ending session");
                self.interrupt(state);
                return Err(e);
            }
            Ok(Err(e)) => {
                error!(error = %e, "turn failed");
                return Ok(());
            }
            Err(e) if e.is_cancelled() || cancelled => return Ok(()),
            Err(e) => {
                error!(error = %e, "worker task panicked");
                return Ok(());
            }
        };

        let spoken = match output {
            WorkerOutput::Greeting(spoken) => spoken,
            WorkerOutput::Turn(None) => None,
            WorkerOutput::Turn(Some(TurnOutcome::Answered { spoken, .. })) => spoken,
            WorkerOutput::Turn(Some(TurnOutcome::SessionClosed { summary, spoken })) => {
                info!(
                    session = %summary.session_id,
                    exchanges = summary.exchanges,
                    critical_alerts = summary.critical_alerts.len(),
                    "Session closed after exchange cap"
                );
                self.session_id = new_session_id();
                spoken
            }
        };

        state.speaking = spoken
            .filter(|s| !s.report.cancelled && s.response_id > state.finished_through)
            .map(|s| s.response_id);
        Ok(())
    }

    /// Cancel the worker, flush playback, forget queued work.
    fn interrupt(&self, state: &mut LoopState) {
        if let Some(turn) = state.active.take() {
            turn.cancel.cancel();
            turn.task.abort();
        }
        if state.speaking.take().is_some() || state.pending.is_some() {
            debug!("active response dropped");
        }
        state.pending = None;
        if let Some(playback) = self.pipeline.playback() {
            playback.interrupt();
        }
    }

    fn spawn_turn(&self, utterance: Utterance) -> ActiveTurn {
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let session = self.session_id.clone();
        let task = tokio::spawn(async move {
            pipeline
                .handle_utterance(&session, utterance, &worker_cancel)
                .await
                .map(WorkerOutput::Turn)
        });
        ActiveTurn { task, cancel }
    }

    fn spawn_greeting(&self) -> ActiveTurn {
        let cancel = CancelFlag::new();
        let worker_cancel = cancel.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let task = tokio::spawn(async move {
            pipeline
                .greet(&worker_cancel)
                .await
                .map(WorkerOutput::Greeting)
        });
        ActiveTurn { task, cancel }
    }
}
