//! Aurora voice assistant.
//!
//! ```text
//! aurora                 microphone session on the default devices, until Ctrl-C
//! aurora --text          console exchange: one line in, guidance out (no audio)
//! aurora --list-devices  print input devices and exit
//! ```

use anyhow::{bail, Context};
use aurora_voice::{
    create_stt, create_tts, AudioCapture, AudioOutput, AudioSource, AuroraConfig, CancelFlag,
    ChatCompletionsModel, PlaybackSink, RodioOutput, SessionSummary, TurnOutcome,
    VoiceOrchestrator, VoicePipeline,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

enum Mode {
    Microphone,
    Text,
    ListDevices,
}

fn parse_mode() -> anyhow::Result<Mode> {
    let mut mode = Mode::Microphone;
    for arg in std::env::args().skip(1) {
        mode = match arg.as_str() {
            "--text" => Mode::Text,
            "--list-devices" => Mode::ListDevices,
            other => bail!("unknown argument {other:?} (expected --text or --list-devices)"),
        };
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[aurora] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mode = parse_mode()?;
    if let Mode::ListDevices = mode {
        for name in AudioCapture::list_input_devices().context("enumerate input devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = AuroraConfig::load().context("load Aurora configuration")?;
    let model = ChatCompletionsModel::from_settings(&config.llm).context("language model")?;
    tracing::info!(model = model.model(), "🧠 Language model ready");
    let stt = create_stt(&config.stt);
    let tts = create_tts(&config.tts);

    match mode {
        Mode::Text => {
            let pipeline = VoicePipeline::new(&config, stt, Arc::new(model), tts, None)
                .context("build pipeline")?;
            run_text(pipeline).await
        }
        _ => {
            let (sink, playback, events) = PlaybackSink::spawn(
                || Ok(Box::new(RodioOutput::new()?) as Box<dyn AudioOutput>),
                config.audio.playback_queue_capacity,
                config.tts.reorder_window,
            )
            .context("open output device")?;
            let pipeline = Arc::new(
                VoicePipeline::new(&config, stt, Arc::new(model), tts, Some(playback.clone()))
                    .context("build pipeline")?,
            );

            let (mut source, frames) =
                AudioSource::spawn(&config.audio).context("open input device")?;
            let mut orchestrator = VoiceOrchestrator::new(pipeline, &config, Some(events));

            let shutdown = async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            };
            let result = orchestrator.run(frames, shutdown).await;

            if source.dropped_frames() > 0 {
                tracing::warn!(dropped = source.dropped_frames(), "raw frames dropped during session");
            }
            source.stop();
            playback.shutdown().await;
            sink.join();

            if let Some(summary) = result.context("voice session failed")? {
                print_summary(&summary);
            }
            Ok(())
        }
    }
}

async fn run_text(pipeline: VoicePipeline) -> anyhow::Result<()> {
    let mut session = String::from("console");
    let mut generation = 1;
    let cancel = CancelFlag::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Aurora ready. Describe your situation (Ctrl-D to finish).");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match pipeline.respond_text(&session, &line, &cancel).await? {
            Some(TurnOutcome::Answered { response, .. }) => {
                println!("[{}] {}", response.urgency, response.text);
                if !response.sources.is_empty() {
                    println!("  sources: {}", response.sources.join(", "));
                }
            }
            Some(TurnOutcome::SessionClosed { summary, .. }) => {
                println!("Session closed after {} exchanges.", summary.exchanges);
                print_summary(&summary);
                generation += 1;
                session = format!("console-{}", generation);
            }
            None => {}
        }
    }

    if let Some(summary) = pipeline.end_session(&session).await {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &SessionSummary) {
    println!(
        "\n📁 Session {}: {} exchanges in {}s, {} critical alert(s)",
        summary.session_id,
        summary.exchanges,
        summary.duration.as_secs(),
        summary.critical_alerts.len()
    );
    for alert in &summary.critical_alerts {
        println!(
            "  🚨 {} [{}] {}",
            alert.timestamp.format("%H:%M:%S"),
            alert.urgency,
            alert.input
        );
    }
}
