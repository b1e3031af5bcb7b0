//! # Audio Capture Module
//!
//! Shared audio state between the capture callback and the analysis side:
//!
//! - [`AudioFeed`]: the latest captured block and its level, last writer wins
//! - [`capture_ring`]: a lock-free SPSC sample ring. The callback pushes into
//!   the [`CaptureWriter`]; the [`CaptureReader`] keeps a monotonic cursor and
//!   hands fixed-size analysis windows to the producer
//! - [`start_audio_capture`]: a CPAL input stream feeding both
//!
//! Neither structure is global. The owner creates them per capture session,
//! and the feed can be cleared between sessions.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SupportedStreamConfigRange;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::CaptureConfig;
use crate::error::{Result, TunerError};

/// Level reported for silence, in dBFS.
pub const SILENCE_DB: f32 = -100.0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding these locks cannot leave the data half-written
    // (every update is a plain assignment), so poisoning is ignored.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Root mean square of a block, 0 for an empty one.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|&s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// RMS expressed in dBFS, floored at [`SILENCE_DB`].
pub fn level_db(rms: f32) -> f32 {
    if rms <= 0.0 {
        return SILENCE_DB;
    }
    (20.0 * rms.log10()).max(SILENCE_DB)
}

/// A mono block of captured samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub rms: f32,
}

impl AudioBlock {
    pub fn level_db(&self) -> f32 {
        level_db(self.rms)
    }
}

#[derive(Debug, Default)]
struct FeedState {
    block: AudioBlock,
    generation: u64,
}

/// Thread-safe publisher of the most recent audio block.
#[derive(Debug)]
pub struct AudioFeed {
    capacity: usize,
    state: Mutex<FeedState>,
}

impl AudioFeed {
    /// Creates a feed holding at most `capacity` samples per block.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(FeedState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replaces the current block. Longer input keeps its newest samples.
    pub fn publish(&self, samples: &[f32], sample_rate: u32) {
        let start = samples.len().saturating_sub(self.capacity);
        let samples = &samples[start..];
        let level = rms(samples);

        let mut state = lock(&self.state);
        state.block.samples.clear();
        state.block.samples.extend_from_slice(samples);
        state.block.sample_rate = sample_rate;
        state.block.rms = level;
    }

    /// Copy of the latest block.
    pub fn latest(&self) -> AudioBlock {
        lock(&self.state).block.clone()
    }

    pub fn rms(&self) -> f32 {
        lock(&self.state).block.rms
    }

    pub fn level_db(&self) -> f32 {
        level_db(self.rms())
    }

    /// Drops the current block and starts a new generation.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.block = AudioBlock::default();
        state.generation += 1;
    }

    /// Incremented by every [`AudioFeed::clear`], so readers can tell a
    /// restarted capture session from the previous one.
    pub fn generation(&self) -> u64 {
        lock(&self.state).generation
    }
}

/// Where the analysis producer gets its windows from.
pub trait SampleSource: Send {
    fn sample_rate(&self) -> u32;

    /// Total number of samples received so far. Never decreases, except on
    /// an explicit reset of the source.
    fn position(&mut self) -> u64;

    /// Copies the newest `out.len()` samples, oldest first.
    ///
    /// Returns `false` without touching `out` if that many samples are not
    /// available yet.
    fn read_latest(&mut self, out: &mut [f32]) -> bool;
}

/// Samples moved out of the ring per `pop_slice` call.
const DRAIN_CHUNK: usize = 1024;

/// Creates the two halves of a capture ring holding `capacity` samples.
///
/// The [`CaptureWriter`] goes to the audio callback, the [`CaptureReader`] to
/// the analysis side. Neither half ever waits on the other.
pub fn capture_ring(capacity: usize, sample_rate: u32) -> (CaptureWriter, CaptureReader) {
    let capacity = capacity.max(1);
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
    let overruns = Arc::new(AtomicU64::new(0));

    let writer = CaptureWriter {
        producer,
        overruns: Arc::clone(&overruns),
    };
    let reader = CaptureReader {
        consumer,
        recent: VecDeque::with_capacity(capacity),
        keep: capacity,
        scratch: vec![0.0; capacity.min(DRAIN_CHUNK)],
        position: 0,
        sample_rate,
        overruns,
    };
    (writer, reader)
}

/// Callback half of the capture ring.
pub struct CaptureWriter {
    producer: HeapProd<f32>,
    overruns: Arc<AtomicU64>,
}

impl CaptureWriter {
    /// Appends `data` without blocking and returns how many samples fit.
    ///
    /// Samples that do not fit because the reader has fallen behind are
    /// discarded and counted as overruns.
    pub fn write(&mut self, data: &[f32]) -> usize {
        let pushed = self.producer.push_slice(data);
        if pushed < data.len() {
            self.overruns.fetch_add((data.len() - pushed) as u64, Ordering::Relaxed);
        }
        pushed
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Analysis half of the capture ring.
///
/// Pending samples are drained into a sliding window of the newest
/// `capacity` samples whenever the cursor or a window is requested.
pub struct CaptureReader {
    consumer: HeapCons<f32>,
    recent: VecDeque<f32>,
    keep: usize,
    scratch: Vec<f32>,
    position: u64,
    sample_rate: u32,
    overruns: Arc<AtomicU64>,
}

impl CaptureReader {
    pub fn capacity(&self) -> usize {
        self.keep
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }

    /// Discards everything received so far and rewinds the cursor.
    pub fn clear(&mut self) {
        let pending = self.consumer.occupied_len();
        self.consumer.skip(pending);
        self.recent.clear();
        self.position = 0;
    }

    fn drain(&mut self) {
        loop {
            let n = self.consumer.pop_slice(&mut self.scratch);
            if n == 0 {
                break;
            }
            self.position += n as u64;
            let overflow = (self.recent.len() + n).saturating_sub(self.keep);
            self.recent.drain(..overflow);
            self.recent.extend(&self.scratch[..n]);
        }
    }
}

impl SampleSource for CaptureReader {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn position(&mut self) -> u64 {
        self.drain();
        self.position
    }

    fn read_latest(&mut self, out: &mut [f32]) -> bool {
        self.drain();
        let len = out.len();
        if len > self.recent.len() {
            return false;
        }
        let start = self.recent.len() - len;
        for (dst, src) in out.iter_mut().zip(self.recent.range(start..)) {
            *dst = *src;
        }
        true
    }
}

/// A running input stream.
pub struct CaptureHandle {
    pub stream: cpal::Stream,
    pub sample_rate: u32,
    overruns: Arc<AtomicU64>,
}

impl CaptureHandle {
    /// Samples the callback had to discard because analysis fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

/// Starts audio capture from the default input device.
///
/// Every callback block is downmixed to mono, pushed into a new capture ring
/// and published on `feed`, which is cleared first.
///
/// # Arguments
///
/// * `config` - Requested sample rate and ring length.
/// * `window` - Analysis window length in samples. The ring is never shorter.
/// * `feed` - Shared level feed, updated from the audio callback.
///
/// # Returns
///
/// The running stream together with the reader half of the ring, which the
/// caller hands to the analysis pipeline. Fails with
/// [`TunerError::NoInputDevice`] or [`TunerError::NoSupportedConfig`] when no
/// usable input exists, and with [`TunerError::Device`] when the stream cannot
/// be built or started.
pub fn start_audio_capture(
    config: &CaptureConfig,
    window: usize,
    feed: Arc<AudioFeed>,
) -> Result<(CaptureHandle, CaptureReader)> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or(TunerError::NoInputDevice)?;

    let device_name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());
    log::info!("Using audio input device: {}", device_name);

    let configs = device
        .supported_input_configs()
        .map_err(|e| TunerError::Device(e.to_string()))?
        .collect::<Vec<_>>();
    let supported_config =
        find_supported_config(configs, config.sample_rate).ok_or(TunerError::NoSupportedConfig)?;

    let target = config.sample_rate.clamp(
        supported_config.min_sample_rate().0,
        supported_config.max_sample_rate().0,
    );
    let supported_config = supported_config.with_sample_rate(cpal::SampleRate(target));
    let sample_rate = supported_config.sample_rate().0;
    let channels = supported_config.channels().max(1) as usize;
    let stream_config: cpal::StreamConfig = supported_config.into();

    log::info!("Selected sample rate: {} Hz, {} channel(s)", sample_rate, channels);

    let (mut writer, reader) = capture_ring(config.ring_capacity(window), sample_rate);
    let overruns = Arc::clone(&writer.overruns);
    feed.clear();

    let mut mono = Vec::with_capacity(window);
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
                );
                writer.write(&mono);
                feed.publish(&mono, sample_rate);
            },
            |err| log::error!("An error occurred on the audio stream: {}", err),
            None,
        )
        .map_err(|e| TunerError::Device(e.to_string()))?;

    stream.play().map_err(|e| TunerError::Device(e.to_string()))?;

    Ok((CaptureHandle { stream, sample_rate, overruns }, reader))
}

/// Picks the f32 configuration closest to `target_rate`, preferring mono.
fn find_supported_config(
    configs: Vec<SupportedStreamConfigRange>,
    target_rate: u32,
) -> Option<SupportedStreamConfigRange> {
    configs
        .into_iter()
        .filter(|c| c.sample_format() == cpal::SampleFormat::F32)
        .min_by_key(|c| {
            let rate_diff = if target_rate < c.min_sample_rate().0 {
                c.min_sample_rate().0 - target_rate
            } else if target_rate > c.max_sample_rate().0 {
                target_rate - c.max_sample_rate().0
            } else {
                0
            };
            (rate_diff, c.channels())
        })
}
