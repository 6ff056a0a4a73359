//! **PlaybackSink** — the single ordered consumer of synthesized audio.
//!
//! ```text
//! synthesizer ──PlaybackItem──▶ bounded mpsc ──▶ playback thread ──▶ ReorderWindow ──▶ AudioOutput
//!                                                      │
//!                                                      └──PlaybackEvent──▶ orchestrator
//! ```
//!
//! Every item carries the id of the response it belongs to. `PlaybackHandle::interrupt`
//! marks all responses issued so far as flushed: queued items for them are discarded and
//! the buffer currently playing stops, so two responses never interleave.

use crate::error::{VoiceError, VoiceResult};
use crate::tts::SynthesizedAudio;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub type ResponseId = u64;

/// Synthesized PCM for one sentence unit.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub seq: usize,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioBuffer {
    pub fn from_synthesized(seq: usize, audio: SynthesizedAudio) -> Self {
        Self {
            seq,
            samples: audio.samples,
            sample_rate: audio.sample_rate,
            channels: audio.channels,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PlaybackItem {
    Audio {
        response: ResponseId,
        buffer: AudioBuffer,
    },
    /// Unit `seq` will never arrive (synthesis failed)
    Skip { response: ResponseId, seq: usize },
    /// All items of the response have been sent
    EndOfResponse { response: ResponseId, units: usize },
}

impl PlaybackItem {
    pub fn response(&self) -> ResponseId {
        match self {
            PlaybackItem::Audio { response, .. }
            | PlaybackItem::Skip { response, .. }
            | PlaybackItem::EndOfResponse { response, .. } => *response,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    ResponseFinished {
        response: ResponseId,
        played: usize,
        skipped: usize,
        /// Flushed before every unit was played
        interrupted: bool,
    },
}

enum Command {
    Item(PlaybackItem),
    Shutdown,
}

/// Audio device abstraction so the playback thread can run against fakes.
pub trait AudioOutput {
    /// Play `buffer` to completion, returning early once `stop()` reports true.
    fn play(&mut self, buffer: AudioBuffer, stop: &dyn Fn() -> bool) -> VoiceResult<()>;

    /// Silence the device and drop anything queued on it.
    fn stop(&mut self);
}

const STOP_POLL: Duration = Duration::from_millis(10);

/// rodio output on the default device. Not `Send`: build it on the playback thread.
pub struct RodioOutput {
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sink: Sink,
}

impl RodioOutput {
    pub fn new() -> VoiceResult<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        info!("🔈 Playback sink ready");
        Ok(Self {
            _stream: stream,
            handle,
            sink,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&mut self, buffer: AudioBuffer, stop: &dyn Fn() -> bool) -> VoiceResult<()> {
        if buffer.samples.is_empty() {
            return Ok(());
        }
        self.sink.append(SamplesBuffer::new(
            buffer.channels.max(1),
            buffer.sample_rate,
            buffer.samples,
        ));
        while !self.sink.empty() {
            if stop() {
                self.stop();
                return Ok(());
            }
            thread::sleep(STOP_POLL);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.sink.stop();
        // a stopped sink is not reused
        match Sink::try_new(&self.handle) {
            Ok(sink) => self.sink = sink,
            Err(e) => warn!(error = %e, "failed to recreate playback sink"),
        }
        debug!("playback stopped");
    }
}

/// What the reorder window hands to the player, in sequence order.
#[derive(Debug, PartialEq)]
pub enum Release {
    Play(AudioBuffer),
    /// Synthesis failed for this unit
    Skipped(usize),
    /// Never arrived before the window overflowed or the response ended
    Lost(usize),
}

/// Holds out-of-order buffers until their predecessors have been released.
#[derive(Debug)]
pub struct ReorderWindow {
    next: usize,
    pending: BTreeMap<usize, Option<AudioBuffer>>,
    capacity: usize,
    total: Option<usize>,
}

impl ReorderWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
            total: None,
        }
    }

    pub fn insert(&mut self, buffer: AudioBuffer) -> Vec<Release> {
        if buffer.seq < self.next {
            warn!(seq = buffer.seq, next = self.next, "late buffer dropped");
            return Vec::new();
        }
        self.pending.insert(buffer.seq, Some(buffer));
        self.drain()
    }

    pub fn skip(&mut self, seq: usize) -> Vec<Release> {
        if seq >= self.next {
            self.pending.insert(seq, None);
        }
        self.drain()
    }

    /// The producer sent everything; release what is held and give up on gaps.
    pub fn finish(&mut self, total: usize) -> Vec<Release> {
        self.total = Some(total);
        let mut released = self.drain();
        while self.next < total {
            match self.pending.remove(&self.next) {
                Some(Some(buffer)) => released.push(Release::Play(buffer)),
                Some(None) => released.push(Release::Skipped(self.next)),
                None => {
                    warn!(seq = self.next, "unit missing at end of response");
                    released.push(Release::Lost(self.next));
                }
            }
            self.next += 1;
        }
        self.pending.clear();
        released
    }

    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|t| self.next >= t)
    }

    /// Buffers waiting on a predecessor
    pub fn held(&self) -> usize {
        self.pending.len()
    }

    fn drain(&mut self) -> Vec<Release> {
        let mut released = Vec::new();
        loop {
            while let Some(entry) = self.pending.remove(&self.next) {
                released.push(match entry {
                    Some(buffer) => Release::Play(buffer),
                    None => Release::Skipped(self.next),
                });
                self.next += 1;
            }
            if self.pending.len() <= self.capacity {
                break;
            }
            warn!(seq = self.next, held = self.pending.len(), "reorder window full, unit lost");
            released.push(Release::Lost(self.next));
            self.next += 1;
        }
        released
    }
}

struct PlaybackControl {
    /// Responses with an id at or below this are discarded
    flushed_through: AtomicU64,
    next_response: AtomicU64,
}

impl PlaybackControl {
    fn is_flushed(&self, response: ResponseId) -> bool {
        response <= self.flushed_through.load(Ordering::Acquire)
    }
}

/// Sending side of the playback thread. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackHandle {
    tx: mpsc::Sender<Command>,
    control: Arc<PlaybackControl>,
}

impl PlaybackHandle {
    /// Allocate the id for a new response. Ids increase monotonically from 1.
    pub fn begin_response(&self) -> ResponseId {
        self.control.next_response.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub async fn send(&self, item: PlaybackItem) -> VoiceResult<()> {
        self.tx
            .send(Command::Item(item))
            .await
            .map_err(|_| VoiceError::ChannelClosed("playback".to_string()))
    }

    /// Flush every response issued so far and stop the buffer that is playing.
    pub fn interrupt(&self) {
        let latest = self.control.next_response.load(Ordering::Acquire);
        self.control.flushed_through.fetch_max(latest, Ordering::AcqRel);
        info!(through = latest, "⏹️ Playback interrupted");
    }

    pub fn is_flushed(&self, response: ResponseId) -> bool {
        self.control.is_flushed(response)
    }

    /// Flush and stop the playback thread.
    pub async fn shutdown(&self) {
        self.interrupt();
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// Owns the playback thread.
pub struct PlaybackSink {
    thread: Option<JoinHandle<()>>,
}

impl PlaybackSink {
    /// Start the playback thread. `factory` runs on that thread; its error is returned here.
    pub fn spawn<F>(
        factory: F,
        queue_capacity: usize,
        reorder_window: usize,
    ) -> VoiceResult<(Self, PlaybackHandle, mpsc::UnboundedReceiver<PlaybackEvent>)>
    where
        F: FnOnce() -> VoiceResult<Box<dyn AudioOutput>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let control = Arc::new(PlaybackControl {
            flushed_through: AtomicU64::new(0),
            next_response: AtomicU64::new(0),
        });
        let (init_tx, init_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();

        let thread_control = Arc::clone(&control);
        let thread = thread::Builder::new()
            .name("aurora-playback".to_string())
            .spawn(move || {
                let output = match factory() {
                    Ok(o) => {
                        let _ = init_tx.send(Ok(()));
                        o
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                run_playback(output, rx, thread_control, event_tx, reorder_window);
            })
            .map_err(VoiceError::Io)?;

        match init_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                return Err(VoiceError::Playback(
                    "playback thread exited during init".to_string(),
                ))
            }
        }

        Ok((
            Self {
                thread: Some(thread),
            },
            PlaybackHandle { tx, control },
            event_rx,
        ))
    }

    /// Wait for the thread to exit (after `PlaybackHandle::shutdown` or once every handle is dropped).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct ActiveResponse {
    id: ResponseId,
    window: ReorderWindow,
    played: usize,
    skipped: usize,
}

impl ActiveResponse {
    fn finished(&self, interrupted: bool) -> PlaybackEvent {
        PlaybackEvent::ResponseFinished {
            response: self.id,
            played: self.played,
            skipped: self.skipped,
            interrupted,
        }
    }
}

fn run_playback(
    mut output: Box<dyn AudioOutput>,
    mut rx: mpsc::Receiver<Command>,
    control: Arc<PlaybackControl>,
    events: mpsc::UnboundedSender<PlaybackEvent>,
    reorder_window: usize,
) {
    info!("🔄 Playback thread started");
    let mut active: Option<ActiveResponse> = None;

    while let Some(command) = rx.blocking_recv() {
        let item = match command {
            Command::Item(item) => item,
            Command::Shutdown => break,
        };
        let id = item.response();

        if control.is_flushed(id) {
            if active.as_ref().is_some_and(|a| a.id == id) {
                if let Some(current) = active.take() {
                    let _ = events.send(current.finished(true));
                }
            }
            continue;
        }

        if active.as_ref().map(|a| a.id) != Some(id) {
            if let Some(previous) = active.take() {
                // superseded without an EndOfResponse
                let _ = events.send(previous.finished(true));
            }
            active = Some(ActiveResponse {
                id,
                window: ReorderWindow::new(reorder_window),
                played: 0,
                skipped: 0,
            });
        }
        let Some(current) = active.as_mut() else {
            continue;
        };

        let released = match item {
            PlaybackItem::Audio { buffer, .. } => current.window.insert(buffer),
            PlaybackItem::Skip { seq, .. } => current.window.skip(seq),
            PlaybackItem::EndOfResponse { units, .. } => current.window.finish(units),
        };

        for release in released {
            match release {
                Release::Play(buffer) => {
                    if control.is_flushed(id) {
                        break;
                    }
                    let seq = buffer.seq;
                    let stop = || control.is_flushed(id);
                    // the buffer is moved into the output and freed once played
                    match output.play(buffer, &stop) {
                        Ok(()) => {
                            current.played += 1;
                            debug!(response = id, seq, "▶️ unit played");
                        }
                        Err(e) => {
                            current.skipped += 1;
                            error!(response = id, seq, error = %e, "playback failed, skipping unit");
                        }
                    }
                }
                Release::Skipped(_) | Release::Lost(_) => current.skipped += 1,
            }
        }

        if control.is_flushed(id) {
            if let Some(current) = active.take() {
                let _ = events.send(current.finished(true));
            }
        } else if current.window.is_complete() {
            if let Some(current) = active.take() {
                info!(
                    response = id,
                    played = current.played,
                    skipped = current.skipped,
                    "✅ Response played"
                );
                let _ = events.send(current.finished(false));
            }
        }
    }

    output.stop();
    debug!("🛑 Playback thread ended");
}
