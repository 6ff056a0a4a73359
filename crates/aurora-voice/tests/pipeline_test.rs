//! End-to-end tests for the voice pipeline, driven by in-process fakes.
//!
//! No microphone, speaker or network is needed: frames are fed through a channel, the
//! language model is scripted, and playback records which unit it was handed.

use async_trait::async_trait;
use aurora_voice::{
    AudioBuffer, AudioFrame, AudioOutput, AuroraConfig, BargeInPolicy, CancelFlag,
    CompletionRequest, LanguageModel, PlaybackEvent, PlaybackHandle, PlaybackSink, Role,
    SegmenterEvent, SourceEvent, SttBackend, SynthesizedAudio, TtsBackend, TurnOutcome,
    UtteranceSegmenter, Urgency, VoiceError, VoiceOrchestrator, VoicePipeline, VoiceResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const FRAME: usize = 480;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn test_config() -> AuroraConfig {
    let mut config = AuroraConfig::default();
    config.pipeline.greeting = None;
    config
}

/// Transcribes by utterance length so tests can tell utterances apart.
struct LengthStt;

impl SttBackend for LengthStt {
    fn transcribe(&self, samples: &[i16], _sample_rate: u32) -> VoiceResult<String> {
        if samples.len() < 33 * FRAME {
            Ok("first question".to_string())
        } else {
            Ok("second question".to_string())
        }
    }
}

struct ScriptedModel {
    reply: Option<String>,
    delay: Duration,
    seen: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn slow(reply: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Some(reply.to_string()),
            delay,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn last_request(&self) -> CompletionRequest {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> VoiceResult<String> {
        self.seen.lock().unwrap().push(request);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.reply
            .clone()
            .ok_or_else(|| VoiceError::Llm("connection refused".to_string()))
    }
}

/// Encodes the first letter of each unit into its samples. Earlier units are slower, so
/// completion order is the reverse of sentence order.
struct LetterTts {
    fail_on: Option<&'static str>,
}

impl TtsBackend for LetterTts {
    fn synthesize(&self, text: &str) -> VoiceResult<SynthesizedAudio> {
        if Some(text) == self.fail_on {
            return Err(VoiceError::Tts("voice service unavailable".to_string()));
        }
        let letter = text.chars().next().unwrap_or(' ');
        let delay = match letter {
            'A' => 60,
            'B' => 30,
            _ => 0,
        };
        std::thread::sleep(Duration::from_millis(delay));
        Ok(SynthesizedAudio {
            samples: vec![letter as i16; 16],
            sample_rate: 16000,
            channels: 1,
        })
    }
}

struct RecordingOutput(Arc<Mutex<Vec<char>>>);

impl AudioOutput for RecordingOutput {
    fn play(&mut self, buffer: AudioBuffer, _stop: &dyn Fn() -> bool) -> VoiceResult<()> {
        let letter = buffer
            .samples
            .first()
            .and_then(|&s| char::from_u32(s as u32))
            .unwrap_or('?');
        self.0.lock().unwrap().push(letter);
        Ok(())
    }

    fn stop(&mut self) {}
}

struct Speaker {
    sink: PlaybackSink,
    handle: PlaybackHandle,
    events: mpsc::UnboundedReceiver<PlaybackEvent>,
    played: Arc<Mutex<Vec<char>>>,
}

fn speaker() -> Speaker {
    let played = Arc::new(Mutex::new(Vec::new()));
    let output = RecordingOutput(Arc::clone(&played));
    let (sink, handle, events) =
        PlaybackSink::spawn(move || Ok(Box::new(output) as Box<dyn AudioOutput>), 16, 8).unwrap();
    Speaker {
        sink,
        handle,
        events,
        played,
    }
}

fn frame(seq: u64, is_speech: bool) -> AudioFrame {
    AudioFrame {
        seq,
        samples: vec![if is_speech { 1000 } else { 0 }; FRAME],
        is_speech,
    }
}

/// `speech` speech frames followed by enough silence to finalize (27 frames at 800ms/30ms).
fn utterance_frames(start: u64, speech: usize) -> Vec<AudioFrame> {
    (0..speech + 27)
        .map(|i| frame(start + i as u64, i < speech))
        .collect()
}

async fn feed(frames: Vec<AudioFrame>) -> mpsc::Receiver<SourceEvent> {
    let (tx, rx) = mpsc::channel(frames.len().max(1));
    for f in frames {
        tx.send(SourceEvent::Frame(f)).await.unwrap();
    }
    rx
}

fn user_inputs(turns: &[aurora_voice::ConversationTurn]) -> Vec<String> {
    turns
        .iter()
        .filter(|t| t.role == Role::User)
        .map(|t| t.content.clone())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reply_sentences_play_in_order() {
    init_tracing();
    let mut speaker = speaker();
    let model = ScriptedModel::replying("A. B. C.\n[URGENCY: normal]\n[SOURCES: Site Manual]");
    let pipeline = VoicePipeline::new(
        &test_config(),
        Arc::new(LengthStt),
        model,
        Arc::new(LetterTts { fail_on: None }),
        Some(speaker.handle.clone()),
    )
    .unwrap();

    let outcome = pipeline
        .respond_text("worker-1", "What do I do next?", &CancelFlag::new())
        .await
        .unwrap()
        .unwrap();
    let TurnOutcome::Answered { response, spoken, .. } = outcome else {
        panic!("expected an answered turn");
    };
    assert_eq!(response.text, "A. B. C.");
    assert_eq!(response.urgency, Urgency::Normal);
    assert_eq!(response.sources, vec!["Site Manual".to_string()]);
    assert_eq!(spoken.unwrap().report.synthesized, 3);

    let PlaybackEvent::ResponseFinished { played, skipped, interrupted, .. } =
        speaker.events.recv().await.unwrap();
    assert_eq!((played, skipped, interrupted), (3, 0, false));
    assert_eq!(*speaker.played.lock().unwrap(), vec!['A', 'B', 'C']);

    speaker.handle.shutdown().await;
    speaker.sink.join();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_unit_is_skipped_and_the_rest_play_in_order() {
    let mut speaker = speaker();
    let pipeline = VoicePipeline::new(
        &test_config(),
        Arc::new(LengthStt),
        ScriptedModel::replying("A. B. C. [URGENCY: assistive]"),
        Arc::new(LetterTts { fail_on: Some("B.") }),
        Some(speaker.handle.clone()),
    )
    .unwrap();

    let outcome = pipeline
        .respond_text("worker-1", "How do I restart the pump?", &CancelFlag::new())
        .await
        .unwrap()
        .unwrap();
    let report = outcome.spoken().unwrap().report.clone();
    assert_eq!((report.synthesized, report.failed), (2, 1));

    let PlaybackEvent::ResponseFinished { played, skipped, .. } =
        speaker.events.recv().await.unwrap();
    assert_eq!((played, skipped), (2, 1));
    assert_eq!(*speaker.played.lock().unwrap(), vec!['A', 'C']);

    speaker.handle.shutdown().await;
    speaker.sink.join();
}

#[test]
fn five_speech_frames_then_silence_make_one_utterance() {
    let config = AuroraConfig::default();
    let mut segmenter = UtteranceSegmenter::new(&config.segmenter, 16000, 30);
    let finalized: Vec<_> = utterance_frames(0, 5)
        .into_iter()
        .filter_map(|f| segmenter.push(f))
        .filter_map(|ev| match ev {
            SegmenterEvent::Finalized(u) => Some(u),
            _ => None,
        })
        .collect();
    assert_eq!(finalized.len(), 1);
    assert_eq!(finalized[0].speech_frames, 5);
    assert_eq!(finalized[0].trailing_silence_frames, 26);
}

#[tokio::test]
async fn model_failure_gives_fallback_and_records_alert() {
    let pipeline = VoicePipeline::new(
        &test_config(),
        Arc::new(LengthStt),
        ScriptedModel::failing(),
        Arc::new(LetterTts { fail_on: None }),
        None,
    )
    .unwrap();

    let outcome = pipeline
        .respond_text("worker-7", "The conveyor is making a noise", &CancelFlag::new())
        .await
        .unwrap()
        .unwrap();
    let TurnOutcome::Answered { response, spoken, .. } = outcome else {
        panic!("expected an answered turn");
    };
    assert_eq!(response.urgency, Urgency::Critical);
    assert!(response.text.contains("supervisor"));
    assert!(spoken.is_none());

    let session = pipeline.sessions().get("worker-7").unwrap();
    let session = session.lock().await;
    assert_eq!(session.exchanges, 1);
    assert_eq!(session.critical_alerts.len(), 1);
    assert_eq!(session.critical_alerts[0].urgency, Urgency::Critical);
}

#[tokio::test]
async fn urgent_keyword_shortens_the_token_budget() {
    let model = ScriptedModel::replying("Leave the area now. [URGENCY: critical]");
    let pipeline = VoicePipeline::new(
        &test_config(),
        Arc::new(LengthStt),
        model.clone(),
        Arc::new(LetterTts { fail_on: None }),
        None,
    )
    .unwrap();
    let cancel = CancelFlag::new();

    pipeline
        .respond_text("worker-2", "There is smoke near bay four", &cancel)
        .await
        .unwrap();
    assert_eq!(model.last_request().max_tokens, 150);

    pipeline
        .respond_text("worker-2", "Where do I log my hours?", &cancel)
        .await
        .unwrap();
    assert_eq!(model.last_request().max_tokens, 250);
}

#[tokio::test]
async fn model_sees_preamble_plus_capped_history() {
    let mut config = test_config();
    config.llm.history_cap = 4;
    let model = ScriptedModel::replying("Understood. [URGENCY: normal]");
    let pipeline = VoicePipeline::new(
        &config,
        Arc::new(LengthStt),
        model.clone(),
        Arc::new(LetterTts { fail_on: None }),
        None,
    )
    .unwrap();
    let cancel = CancelFlag::new();

    for i in 0..5 {
        pipeline
            .respond_text("worker-3", &format!("status update {}", i), &cancel)
            .await
            .unwrap();
    }
    pipeline
        .respond_text("worker-3", "status update 5", &cancel)
        .await
        .unwrap();

    let request = model.last_request();
    // preamble + 4 retained turns + the new input
    assert_eq!(request.messages.len(), 6);
    assert_eq!(request.messages[0].role, Role::System);
    assert_eq!(request.messages[1].content, "status update 3");
    assert_eq!(request.messages[5].content, "status update 5");
}

#[tokio::test]
async fn exchange_cap_closes_the_session() {
    let mut config = test_config();
    config.pipeline.max_exchanges = 2;
    let model = ScriptedModel::replying("Okay. [URGENCY: normal]");
    let pipeline = VoicePipeline::new(
        &config,
        Arc::new(LengthStt),
        model.clone(),
        Arc::new(LetterTts { fail_on: None }),
        None,
    )
    .unwrap();
    let cancel = CancelFlag::new();

    for input in ["first check", "second check"] {
        let outcome = pipeline.respond_text("worker-4", input, &cancel).await.unwrap();
        assert!(matches!(outcome, Some(TurnOutcome::Answered { .. })));
    }
    let outcome = pipeline
        .respond_text("worker-4", "third check", &cancel)
        .await
        .unwrap();
    let Some(TurnOutcome::SessionClosed { summary, .. }) = outcome else {
        panic!("expected the session to close");
    };
    assert_eq!(summary.exchanges, 2);
    assert_eq!(user_inputs(&summary.turns), vec!["first check", "second check"]);
    assert_eq!(model.calls(), 2);
    assert!(pipeline.sessions().is_empty());
}

#[tokio::test]
async fn short_transcripts_are_dropped() {
    let model = ScriptedModel::replying("Okay. [URGENCY: normal]");
    let pipeline = VoicePipeline::new(
        &test_config(),
        Arc::new(LengthStt),
        model.clone(),
        Arc::new(LetterTts { fail_on: None }),
        None,
    )
    .unwrap();
    let outcome = pipeline
        .respond_text("worker-5", "  uh ", &CancelFlag::new())
        .await
        .unwrap();
    assert!(outcome.is_none());

    // two characters, three bytes
    let outcome = pipeline
        .respond_text("worker-5", "né", &CancelFlag::new())
        .await
        .unwrap();
    assert!(outcome.is_none());
    assert_eq!(model.calls(), 0);
    assert!(pipeline.sessions().is_empty());

    let outcome = pipeline
        .respond_text("worker-5", "été", &CancelFlag::new())
        .await
        .unwrap();
    assert!(matches!(outcome, Some(TurnOutcome::Answered { .. })));
    assert_eq!(model.calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn spoken_utterance_is_answered_and_played() {
    init_tracing();
    let config = test_config();
    let mut speaker = speaker();
    let model = ScriptedModel::replying("A. C. [URGENCY: normal]");
    let pipeline = Arc::new(
        VoicePipeline::new(
            &config,
            Arc::new(LengthStt),
            model.clone(),
            Arc::new(LetterTts { fail_on: None }),
            Some(speaker.handle.clone()),
        )
        .unwrap(),
    );
    let events = std::mem::replace(&mut speaker.events, mpsc::unbounded_channel().1);
    let mut orchestrator = VoiceOrchestrator::new(Arc::clone(&pipeline), &config, Some(events));

    let frames = feed(utterance_frames(0, 5)).await;
    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(frames, std::future::pending()),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();

    assert_eq!(summary.exchanges, 1);
    assert_eq!(user_inputs(&summary.turns), vec!["first question"]);
    assert_eq!(*speaker.played.lock().unwrap(), vec!['A', 'C']);

    speaker.handle.shutdown().await;
    speaker.sink.join();
}

async fn run_two_overlapping_utterances(policy: BargeInPolicy) -> Vec<String> {
    let mut config = test_config();
    config.pipeline.barge_in = policy;
    let model = ScriptedModel::slow("Noted. [URGENCY: normal]", Duration::from_millis(300));
    let pipeline = Arc::new(
        VoicePipeline::new(
            &config,
            Arc::new(LengthStt),
            model,
            Arc::new(LetterTts { fail_on: None }),
            None,
        )
        .unwrap(),
    );
    let mut orchestrator = VoiceOrchestrator::new(pipeline, &config, None);

    // 5 then 10 speech frames: the second utterance finalizes while the first is being answered
    let mut frames = utterance_frames(0, 5);
    frames.extend(utterance_frames(100, 10));
    let rx = feed(frames).await;

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(rx, std::future::pending()),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    user_inputs(&summary.turns)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_interrupt_answers_only_the_newest_utterance() {
    let inputs = run_two_overlapping_utterances(BargeInPolicy::Interrupt).await;
    assert_eq!(inputs, vec!["second question"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_queue_answers_both_in_order() {
    let inputs = run_two_overlapping_utterances(BargeInPolicy::Queue).await;
    assert_eq!(inputs, vec!["first question", "second question"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_discard_drops_the_late_utterance() {
    let inputs = run_two_overlapping_utterances(BargeInPolicy::Discard).await;
    assert_eq!(inputs, vec!["first question"]);
}

#[tokio::test]
async fn device_error_ends_the_run() {
    let config = test_config();
    let pipeline = Arc::new(
        VoicePipeline::new(
            &config,
            Arc::new(LengthStt),
            ScriptedModel::replying("Okay. [URGENCY: normal]"),
            Arc::new(LetterTts { fail_on: None }),
            None,
        )
        .unwrap(),
    );
    let mut orchestrator = VoiceOrchestrator::new(pipeline, &config, None);

    let (tx, rx) = mpsc::channel(4);
    tx.send(SourceEvent::DeviceError("device unplugged".to_string()))
        .await
        .unwrap();
    let result = orchestrator.run(rx, std::future::pending()).await;
    assert!(matches!(result, Err(VoiceError::AudioDevice(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_playback_ends_the_run() {
    init_tracing();
    let config = test_config();
    let speaker = speaker();
    speaker.handle.shutdown().await;
    speaker.sink.join();

    let pipeline = Arc::new(
        VoicePipeline::new(
            &config,
            Arc::new(LengthStt),
            ScriptedModel::replying("A. [URGENCY: normal]"),
            Arc::new(LetterTts { fail_on: None }),
            Some(speaker.handle.clone()),
        )
        .unwrap(),
    );
    let mut orchestrator = VoiceOrchestrator::new(Arc::clone(&pipeline), &config, None);

    let frames = feed(utterance_frames(0, 5)).await;
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.run(frames, std::future::pending()),
    )
    .await
    .unwrap();
    let err = result.unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(err, VoiceError::ChannelClosed(_)));
    assert!(pipeline.sessions().is_empty());
}

#[tokio::test]
async fn shutdown_stops_an_idle_session() {
    let config = test_config();
    let pipeline = Arc::new(
        VoicePipeline::new(
            &config,
            Arc::new(LengthStt),
            ScriptedModel::replying("Okay. [URGENCY: normal]"),
            Arc::new(LetterTts { fail_on: None }),
            None,
        )
        .unwrap(),
    );
    let mut orchestrator = VoiceOrchestrator::new(pipeline, &config, None);

    let (_tx, rx) = mpsc::channel(4);
    let summary = orchestrator
        .run(rx, tokio::time::sleep(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(summary.is_none());
}
