//! Microphone capture and frame classification.
//!
//! ```text
//! cpal callback ──push──▶ FrameRing (bounded, drop-oldest) ──▶ classifier thread ──▶ mpsc<SourceEvent>
//! ```
//!
//! The callback only converts samples and pushes whole frames into the ring; it never
//! waits on a consumer. If the classifier or the orchestrator falls behind, the ring
//! evicts the oldest raw frame. That is the only place captured audio is discarded.

use crate::config::AudioSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::vad::{create_classifier, VoiceActivity};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// One fixed-duration PCM frame with its speech/non-speech tag.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Capture order; gaps mean frames were dropped upstream
    pub seq: u64,
    /// 16-bit mono PCM
    pub samples: Vec<i16>,
    pub is_speech: bool,
}

/// What the capture callback hands to the classifier.
#[derive(Debug, Clone)]
pub enum CaptureItem {
    Samples(Vec<i16>),
    /// Stream error reported by the device; fatal for the session
    Error(String),
}

/// What the orchestrator receives from an `AudioSource`.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Frame(AudioFrame),
    DeviceError(String),
}

/// Result of a timed pop from a `FrameRing`.
#[derive(Debug, PartialEq)]
pub enum RingPop<T> {
    Item(T),
    Empty,
    Closed,
}

struct RingState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO that evicts the oldest element instead of blocking the producer.
pub struct FrameRing<T> {
    state: Mutex<RingState<T>>,
    ready: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T> FrameRing<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push `item`; returns true when the oldest element was evicted to make room.
    /// Pushes after `close` are ignored.
    pub fn push(&self, item: T) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.closed {
            return false;
        }
        let evicted = if state.items.len() >= self.capacity {
            state.items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
        evicted
    }

    /// Wait up to `timeout` for the next element. Remaining elements are still
    /// drained after `close`; `Closed` is returned once the ring is empty.
    pub fn pop_timeout(&self, timeout: Duration) -> RingPop<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = state.items.pop_front() {
                return RingPop::Item(item);
            }
            if state.closed {
                return RingPop::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return RingPop::Empty;
            }
            let (guard, _) = self
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .map(|s| s.items.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Elements evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Convert a normalized f32 sample to i16.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

/// Microphone capture using CPAL
pub struct AudioCapture {
    device: Device,
    stream_config: StreamConfig,
    frame_samples: usize,
}

impl AudioCapture {
    pub fn new(settings: &AudioSettings) -> VoiceResult<Self> {
        info!(
            sample_rate = settings.sample_rate,
            frame_ms = settings.frame_ms,
            "🎤 Initializing audio capture"
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
            "📱 Using input device"
        );
        let default_config = device.default_input_config()?;
        debug!(?default_config, "device default input config");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(settings.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            device,
            stream_config,
            frame_samples: settings.frame_samples(),
        })
    }

    /// Start the input stream. Each complete frame is pushed onto `ring`; device errors
    /// are pushed as `CaptureItem::Error`. Keep the returned `Stream` alive to keep capturing.
    pub fn start(self, ring: Arc<FrameRing<CaptureItem>>) -> VoiceResult<Stream> {
        let frame_samples = self.frame_samples;
        let mut pending: Vec<i16> = Vec::with_capacity(frame_samples);
        let data_ring = Arc::clone(&ring);

        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    pending.push(f32_to_i16(sample));
                    if pending.len() == frame_samples {
                        let frame =
                            std::mem::replace(&mut pending, Vec::with_capacity(frame_samples));
                        data_ring.push(CaptureItem::Samples(frame));
                    }
                }
            },
            move |err| {
                ring.push(CaptureItem::Error(err.to_string()));
            },
            None,
        )?;

        stream.play()?;
        info!("✅ Audio capture started");
        Ok(stream)
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

/// Microphone + classifier: the producer side of the pipeline.
pub struct AudioSource {
    stream: Option<Stream>,
    ring: Arc<FrameRing<CaptureItem>>,
    classifier: Option<JoinHandle<()>>,
}

impl AudioSource {
    /// Open the default input device and start classifying frames.
    pub fn spawn(settings: &AudioSettings) -> VoiceResult<(Self, mpsc::Receiver<SourceEvent>)> {
        let ring = Arc::new(FrameRing::new(settings.ring_capacity));
        let (tx, rx) = mpsc::channel(settings.frame_queue_capacity);

        let vad_settings = settings.clone();
        let classifier = spawn_classifier(
            Arc::clone(&ring),
            move || create_classifier(&vad_settings),
            settings.frame_ms,
            tx,
        )?;

        let stream = match AudioCapture::new(settings).and_then(|c| c.start(Arc::clone(&ring))) {
            Ok(s) => s,
            Err(e) => {
                ring.close();
                let _ = classifier.join();
                return Err(e);
            }
        };

        Ok((
            Self {
                stream: Some(stream),
                ring,
                classifier: Some(classifier),
            },
            rx,
        ))
    }

    /// Raw frames evicted because the classifier fell behind
    pub fn dropped_frames(&self) -> u64 {
        self.ring.dropped()
    }

    /// Stop capture and let the classifier drain and exit.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("⏹️ Audio capture stopped");
        }
        self.ring.close();
        if let Some(handle) = self.classifier.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the classifier on a dedicated thread: pop raw frames from `ring`, tag them and
/// forward them to `tx`.
///
/// The classifier is built on the new thread (WebRTC VAD is not `Send`); a build failure
/// is returned to the caller. Frames whose classification overruns the frame duration
/// are dropped.
pub fn spawn_classifier<F>(
    ring: Arc<FrameRing<CaptureItem>>,
    factory: F,
    frame_ms: u32,
    tx: mpsc::Sender<SourceEvent>,
) -> VoiceResult<JoinHandle<()>>
where
    F: FnOnce() -> VoiceResult<Box<dyn VoiceActivity>> + Send + 'static,
{
    let (init_tx, init_rx) = std::sync::mpsc::channel::<VoiceResult<()>>();
    let budget = Duration::from_millis(u64::from(frame_ms));

    let handle = thread::Builder::new()
        .name("aurora-vad".to_string())
        .spawn(move || {
            let mut vad = match factory() {
                Ok(v) => {
                    let _ = init_tx.send(Ok(()));
                    v
                }
                Err(e) => {
                    let _ = init_tx.send(Err(e));
                    return;
                }
            };
            info!("🔄 VAD classifier thread started");

            let mut seq: u64 = 0;
            let mut overruns: u64 = 0;
            loop {
                match ring.pop_timeout(Duration::from_millis(100)) {
                    RingPop::Item(CaptureItem::Samples(samples)) => {
                        seq += 1;
                        let started = Instant::now();
                        let is_speech = match vad.classify(&samples) {
                            Ok(s) => s,
                            Err(e) => {
                                debug!(seq, error = %e, "frame classification failed, skipping");
                                continue;
                            }
                        };
                        if started.elapsed() > budget {
                            overruns += 1;
                            debug!(seq, overruns, "classification overran frame budget, dropping frame");
                            continue;
                        }
                        let frame = AudioFrame {
                            seq,
                            samples,
                            is_speech,
                        };
                        if tx.blocking_send(SourceEvent::Frame(frame)).is_err() {
                            break;
                        }
                    }
                    RingPop::Item(CaptureItem::Error(msg)) => {
                        error!(error = %msg, "audio capture error");
                        let _ = tx.blocking_send(SourceEvent::DeviceError(msg));
                        break;
                    }
                    RingPop::Empty => {
                        if tx.is_closed() {
                            break;
                        }
                    }
                    RingPop::Closed => break,
                }
            }

            if ring.dropped() > 0 || overruns > 0 {
                warn!(dropped = ring.dropped(), overruns, "frames lost during capture");
            }
            debug!("🛑 VAD classifier thread ended");
        })
        .map_err(VoiceError::Io)?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(handle),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => Err(VoiceError::VadInit("classifier thread exited during init".to_string())),
    }
}
