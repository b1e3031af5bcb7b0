//! # Analysis Pipeline Module
//!
//! Runs the pitch estimator off the render loop.
//!
//! ## Architecture
//! - **Render thread** (producer and reader): [`AnalysisPipeline::tick`] once
//!   per frame reads a window from the [`SampleSource`], transforms it and
//!   offers the spectrum to a bounded queue. [`AnalysisPipeline::latest_result`]
//!   copies the cached estimate. Neither call waits on the worker.
//! - **Worker thread** (consumer): drains the queue, runs the estimator and is
//!   the only writer of the result cache.
//! - **Queue**: a crossbeam channel of capacity [`QUEUE_CAPACITY`]. A full
//!   queue drops the newest frame instead of blocking the producer.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::SampleSource;
use crate::config::TunerConfig;
use crate::error::{Result, TunerError};
use crate::fft::{SpectralFrontEnd, SpectrumFrame};
use crate::pitch::{HpsEstimator, HpsResult, PitchReading, PitchSource};

/// Maximum number of spectra waiting for the worker.
pub const QUEUE_CAPACITY: usize = 2;

/// How long the worker waits for a frame before re-checking its flag.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Pause after a failed iteration.
const FAILURE_BACKOFF: Duration = Duration::from_millis(100);

const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Estimator settings that can change while the worker runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EstimatorUpdate {
    ReferencePitch(f32),
    FrequencyRange { min: f32, max: f32 },
}

/// The work done on the worker thread for each queued spectrum.
pub trait FrameAnalyzer: Send {
    fn analyze(&mut self, frame: &SpectrumFrame) -> HpsResult;

    fn apply(&mut self, _update: EstimatorUpdate) {}
}

impl FrameAnalyzer for HpsEstimator {
    fn analyze(&mut self, frame: &SpectrumFrame) -> HpsResult {
        self.estimate(frame)
    }

    fn apply(&mut self, update: EstimatorUpdate) {
        match update {
            EstimatorUpdate::ReferencePitch(a4) => self.set_reference_pitch(a4),
            EstimatorUpdate::FrequencyRange { min, max } => self.set_frequency_range(min, max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
}

/// What a single [`AnalysisPipeline::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Too soon after the previous analysis.
    NotDue,
    /// The source has no new full window.
    NoFreshSamples,
    /// The spectrum was queued for the worker.
    Queued,
    /// The queue was full; the spectrum was discarded.
    Dropped,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    analysed: AtomicU64,
    failures: AtomicU64,
}

/// Snapshot of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub enqueued: u64,
    pub dropped: u64,
    pub analysed: u64,
    pub failures: u64,
}

struct Worker {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
    done_rx: Receiver<()>,
}

/// Producer/consumer pitch analysis with a cached latest result.
pub struct AnalysisPipeline {
    source: Box<dyn SampleSource>,
    front_end: SpectralFrontEnd,
    window: Vec<f32>,
    min_interval: Duration,
    last_analysis: Option<Instant>,
    last_position: Option<u64>,
    latest_spectrum: Option<SpectrumFrame>,

    queue_tx: Sender<SpectrumFrame>,
    queue_rx: Receiver<SpectrumFrame>,
    updates_tx: Sender<EstimatorUpdate>,
    updates_rx: Receiver<EstimatorUpdate>,
    result: Arc<Mutex<HpsResult>>,
    analyzer: Arc<Mutex<Box<dyn FrameAnalyzer>>>,
    counters: Arc<Counters>,

    worker: Option<Worker>,
    state: PipelineState,
    join_timeout: Duration,
}

impl AnalysisPipeline {
    /// Builds an idle pipeline running the HPS estimator.
    pub fn new(config: &TunerConfig, source: Box<dyn SampleSource>) -> Self {
        let estimator = HpsEstimator::new(&config.hps);
        Self::with_analyzer(config, source, Box::new(estimator))
    }

    /// Builds an idle pipeline around a custom analyzer.
    pub fn with_analyzer(
        config: &TunerConfig,
        source: Box<dyn SampleSource>,
        analyzer: Box<dyn FrameAnalyzer>,
    ) -> Self {
        let front_end = SpectralFrontEnd::new(config.analysis.fft_size);
        let window = vec![0.0; front_end.fft_size()];
        let rate = config.analysis.analysis_update_rate as f64;
        let min_interval = if rate > 0.0 { Duration::from_secs_f64(1.0 / rate) } else { Duration::ZERO };

        let (queue_tx, queue_rx) = crossbeam_channel::bounded(QUEUE_CAPACITY);
        let (updates_tx, updates_rx) = crossbeam_channel::unbounded();

        Self {
            source,
            front_end,
            window,
            min_interval,
            last_analysis: None,
            last_position: None,
            latest_spectrum: None,
            queue_tx,
            queue_rx,
            updates_tx,
            updates_rx,
            result: Arc::new(Mutex::new(HpsResult::NONE)),
            analyzer: Arc::new(Mutex::new(analyzer)),
            counters: Arc::new(Counters::default()),
            worker: None,
            state: PipelineState::Idle,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    pub fn set_join_timeout(&mut self, timeout: Duration) {
        self.join_timeout = timeout;
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn fft_size(&self) -> usize {
        self.front_end.fft_size()
    }

    /// Spectra currently waiting for the worker.
    pub fn queue_depth(&self) -> usize {
        self.queue_rx.len()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            analysed: self.counters.analysed.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Spawns the worker thread.
    ///
    /// Frames left in the queue by a previous run are consumed first.
    pub fn start(&mut self) -> Result<()> {
        if self.state != PipelineState::Idle {
            return Err(TunerError::AlreadyRunning);
        }

        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        let context = WorkerContext {
            queue: self.queue_rx.clone(),
            updates: self.updates_rx.clone(),
            result: Arc::clone(&self.result),
            analyzer: Arc::clone(&self.analyzer),
            counters: Arc::clone(&self.counters),
            running: Arc::clone(&running),
        };

        let handle = thread::Builder::new()
            .name("hps-worker".to_string())
            .spawn(move || {
                context.run();
                let _ = done_tx.send(());
            })
            .map_err(TunerError::Spawn)?;

        self.worker = Some(Worker { handle, running, done_rx });
        self.state = PipelineState::Running;
        log::info!("Analysis worker started (fft size {})", self.fft_size());
        Ok(())
    }

    /// Stops the worker and waits up to the join timeout for it to exit.
    ///
    /// The queue is left as is. A worker that does not exit in time is
    /// detached; teardown continues either way.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            self.state = PipelineState::Idle;
            return;
        };
        self.state = PipelineState::Stopping;
        worker.running.store(false, Ordering::Release);

        match worker.done_rx.recv_timeout(self.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    log::error!("Analysis worker terminated abnormally");
                } else {
                    log::info!("Analysis worker stopped");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "Analysis worker did not stop within {:?}, detaching it",
                    self.join_timeout
                );
            }
        }
        self.state = PipelineState::Idle;
    }

    /// Producer step, called once per render frame.
    pub fn tick(&mut self, now: Instant) -> TickOutcome {
        if let Some(last) = self.last_analysis {
            if now.saturating_duration_since(last) < self.min_interval {
                return TickOutcome::NotDue;
            }
        }

        let position = self.source.position();
        if self.last_position == Some(position) || !self.source.read_latest(&mut self.window) {
            return TickOutcome::NoFreshSamples;
        }
        self.last_analysis = Some(now);
        self.last_position = Some(position);

        let sample_rate = self.source.sample_rate();
        let Some(frame) = self.front_end.process(&mut self.window, sample_rate) else {
            return TickOutcome::NoFreshSamples;
        };
        self.latest_spectrum = Some(frame.clone());

        match self.queue_tx.try_send(frame) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                TickOutcome::Queued
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Analysis queue full, dropping spectrum");
                TickOutcome::Dropped
            }
        }
    }

    /// Copy of the cached estimate.
    pub fn latest_result(&self) -> HpsResult {
        *lock(&self.result)
    }

    /// Like [`AnalysisPipeline::latest_result`] but gives up instead of
    /// waiting if the worker is writing at this instant.
    pub fn try_latest_result(&self) -> Option<HpsResult> {
        match self.result.try_lock() {
            Ok(guard) => Some(*guard),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Some(*poisoned.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// The spectrum produced by the most recent tick.
    pub fn latest_spectrum(&self) -> Option<&SpectrumFrame> {
        self.latest_spectrum.as_ref()
    }

    pub fn set_reference_pitch(&self, a4: f32) {
        let _ = self.updates_tx.send(EstimatorUpdate::ReferencePitch(a4));
    }

    pub fn set_frequency_range(&self, min: f32, max: f32) {
        let _ = self.updates_tx.send(EstimatorUpdate::FrequencyRange { min, max });
    }
}

impl PitchSource for AnalysisPipeline {
    fn latest_reading(&self) -> PitchReading {
        self.latest_result().reading()
    }
}

impl Drop for AnalysisPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the worker thread owns a handle to.
struct WorkerContext {
    queue: Receiver<SpectrumFrame>,
    updates: Receiver<EstimatorUpdate>,
    result: Arc<Mutex<HpsResult>>,
    analyzer: Arc<Mutex<Box<dyn FrameAnalyzer>>>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
}

impl WorkerContext {
    fn run(&self) {
        while self.running.load(Ordering::Acquire) {
            let frame = match self.queue.recv_timeout(IDLE_POLL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut analyzer = lock(&self.analyzer);
                for update in self.updates.try_iter() {
                    analyzer.apply(update);
                }
                analyzer.analyze(&frame)
            }));

            match outcome {
                Ok(estimate) => {
                    *lock(&self.result) = estimate;
                    self.counters.analysed.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("Pitch analysis failed: {}", panic_message(&*payload));
                    thread::sleep(FAILURE_BACKOFF);
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::sine;

    /// Sine source whose cursor only moves when the test says so.
    struct SteppedSine {
        frequency: f32,
        position: Arc<AtomicU64>,
    }

    /// Test-side handle on a [`SteppedSine`] cursor.
    struct Cursor(Arc<AtomicU64>);

    impl Cursor {
        fn advance(&self, samples: u64) {
            self.0.fetch_add(samples, Ordering::Relaxed);
        }
    }

    fn stepped_sine(frequency: f32) -> (Box<SteppedSine>, Cursor) {
        let position = Arc::new(AtomicU64::new(0));
        let cursor = Cursor(Arc::clone(&position));
        (Box::new(SteppedSine { frequency, position }), cursor)
    }

    impl SampleSource for SteppedSine {
        fn sample_rate(&self) -> u32 {
            8000
        }

        fn position(&mut self) -> u64 {
            self.position.load(Ordering::Relaxed)
        }

        fn read_latest(&mut self, out: &mut [f32]) -> bool {
            if self.position() < out.len() as u64 {
                return false;
            }
            out.copy_from_slice(&sine(self.frequency, 8000, out.len(), 0.5));
            true
        }
    }

    fn config() -> TunerConfig {
        let mut config = TunerConfig::default();
        config.analysis.fft_size = 512;
        config.analysis.analysis_update_rate = 50.0;
        // A pure sine has no harmonics to multiply; plain peak picking.
        config.hps.harmonics = 1;
        config
    }

    #[test]
    fn stalled_consumer_caps_queue_at_two() {
        let (source, cursor) = stepped_sine(440.0);
        let mut pipeline = AnalysisPipeline::new(&config(), source);
        let t0 = Instant::now();

        let outcomes: Vec<_> = (0..6)
            .map(|i| {
                cursor.advance(512);
                pipeline.tick(t0 + Duration::from_millis(100 * i))
            })
            .collect();

        assert_eq!(&outcomes[..2], &[TickOutcome::Queued, TickOutcome::Queued]);
        assert!(outcomes[2..].iter().all(|o| *o == TickOutcome::Dropped));
        assert_eq!(pipeline.queue_depth(), QUEUE_CAPACITY);

        let stats = pipeline.stats();
        assert_eq!((stats.enqueued, stats.dropped, stats.analysed), (2, 4, 0));
    }

    #[test]
    fn ticks_respect_update_rate() {
        let (source, cursor) = stepped_sine(440.0);
        let mut pipeline = AnalysisPipeline::new(&config(), source);
        let t0 = Instant::now();

        cursor.advance(512);
        assert_eq!(pipeline.tick(t0), TickOutcome::Queued);
        cursor.advance(512);
        assert_eq!(pipeline.tick(t0 + Duration::from_millis(5)), TickOutcome::NotDue);
        assert_eq!(pipeline.tick(t0 + Duration::from_millis(20)), TickOutcome::Queued);
    }

    #[test]
    fn needs_full_fresh_window() {
        let (source, cursor) = stepped_sine(440.0);
        let mut pipeline = AnalysisPipeline::new(&config(), source);
        let t0 = Instant::now();

        cursor.advance(100);
        assert_eq!(pipeline.tick(t0), TickOutcome::NoFreshSamples);
        cursor.advance(412);
        assert_eq!(pipeline.tick(t0), TickOutcome::Queued);
        // Cursor has not moved since.
        assert_eq!(pipeline.tick(t0 + Duration::from_secs(1)), TickOutcome::NoFreshSamples);
        assert!(pipeline.latest_spectrum().is_some());
    }

    #[test]
    fn start_twice_is_rejected_and_stop_returns_to_idle() {
        let (source, _cursor) = stepped_sine(440.0);
        let mut pipeline = AnalysisPipeline::new(&config(), source);
        assert_eq!(pipeline.state(), PipelineState::Idle);

        pipeline.start().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(matches!(pipeline.start(), Err(TunerError::AlreadyRunning)));

        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    struct FailsFirst {
        calls: u32,
    }

    impl FrameAnalyzer for FailsFirst {
        fn analyze(&mut self, _frame: &SpectrumFrame) -> HpsResult {
            self.calls += 1;
            if self.calls == 1 {
                panic!("corrupt frame");
            }
            HpsResult::from_frequency(440.0, 1.0, 440.0)
        }
    }

    fn wait_for(pipeline: &AnalysisPipeline, pred: impl Fn(PipelineStats) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if pred(pipeline.stats()) {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn worker_survives_a_failing_frame() {
        let (source, cursor) = stepped_sine(440.0);
        let mut pipeline =
            AnalysisPipeline::with_analyzer(&config(), source, Box::new(FailsFirst { calls: 0 }));
        let t0 = Instant::now();
        for i in 0..2 {
            cursor.advance(512);
            assert_eq!(pipeline.tick(t0 + Duration::from_millis(100 * i)), TickOutcome::Queued);
        }

        pipeline.start().unwrap();
        assert!(wait_for(&pipeline, |s| s.failures == 1 && s.analysed == 1));
        assert_eq!(pipeline.latest_result().note, "A");
        assert_eq!(pipeline.state(), PipelineState::Running);
        pipeline.stop();
    }

    #[test]
    fn restart_consumes_stale_frames() {
        let (source, cursor) = stepped_sine(440.0);
        let mut pipeline = AnalysisPipeline::new(&config(), source);
        pipeline.start().unwrap();
        pipeline.stop();

        let t0 = Instant::now();
        for i in 0..2 {
            cursor.advance(512);
            let _ = pipeline.tick(t0 + Duration::from_millis(100 * i));
        }
        assert_eq!(pipeline.queue_depth(), 2);

        pipeline.start().unwrap();
        assert!(wait_for(&pipeline, |s| s.analysed == 2));
        assert_eq!(pipeline.queue_depth(), 0);
        assert!(pipeline.latest_result().is_detected());
    }

    #[test]
    fn reader_sees_no_detection_before_any_analysis() {
        let (source, _cursor) = stepped_sine(440.0);
        let pipeline = AnalysisPipeline::new(&config(), source);
        assert_eq!(pipeline.latest_result(), HpsResult::NONE);
        assert_eq!(pipeline.try_latest_result(), Some(HpsResult::NONE));
        assert_eq!(pipeline.latest_reading(), PitchReading::default());
    }
}
