//! # Engine Module
//!
//! Ties the pieces together for an owning render loop: one
//! [`TunerEngine::tick`] per frame drives the producer, the band mapper and
//! the pitch history, and returns an owned [`AnalysisSnapshot`].

use std::sync::Arc;
use std::time::Instant;

use crate::audio::{AudioFeed, SampleSource};
use crate::bands::{BandMapper, LayoutChange};
use crate::config::TunerConfig;
use crate::error::Result;
use crate::history::{PitchRingBuffer, PitchSampler};
use crate::pipeline::{AnalysisPipeline, PipelineState, PipelineStats};
use crate::AnalysisSnapshot;

pub struct TunerEngine {
    feed: Arc<AudioFeed>,
    pipeline: AnalysisPipeline,
    bands: BandMapper,
    sampler: PitchSampler,
    history: PitchRingBuffer,
    last_tick: Option<Instant>,
    layout_change: LayoutChange,
}

impl TunerEngine {
    pub fn new(config: &TunerConfig, source: Box<dyn SampleSource>, feed: Arc<AudioFeed>) -> Self {
        Self {
            feed,
            pipeline: AnalysisPipeline::new(config, source),
            bands: BandMapper::new(&config.bands),
            sampler: PitchSampler::new(&config.history),
            history: PitchRingBuffer::from_config(&config.history, config.hps.reference_a4),
            last_tick: None,
            layout_change: LayoutChange::Unchanged,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.pipeline.start()
    }

    /// Stops the worker. Band and history state are kept for a later resume.
    pub fn stop(&mut self) {
        self.pipeline.stop();
        self.last_tick = None;
    }

    pub fn state(&self) -> PipelineState {
        self.pipeline.state()
    }

    pub fn stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    pub fn pipeline(&self) -> &AnalysisPipeline {
        &self.pipeline
    }

    /// Band layout change seen by the most recent tick.
    pub fn layout_change(&self) -> LayoutChange {
        self.layout_change
    }

    /// Changes A4 for note naming and for the pitch history scale.
    ///
    /// Semitone band edges start at `min_hz` and do not depend on A4.
    pub fn set_reference_pitch(&mut self, a4: f32) {
        self.pipeline.set_reference_pitch(a4);
        self.history.set_reference_pitch(a4);
    }

    pub fn history(&self) -> &PitchRingBuffer {
        &self.history
    }

    /// One render frame.
    pub fn tick(&mut self, now: Instant) -> AnalysisSnapshot {
        let dt = self
            .last_tick
            .map_or(0.0, |last| now.saturating_duration_since(last).as_secs_f32());
        self.last_tick = Some(now);

        let _ = self.pipeline.tick(now);

        self.layout_change = match self.pipeline.latest_spectrum() {
            Some(spectrum) => self.bands.update(spectrum, dt),
            None => LayoutChange::Unchanged,
        };

        let pitch = self.pipeline.latest_result();
        self.sampler.update(pitch.reading(), now, &mut self.history);

        AnalysisSnapshot {
            pitch,
            level_db: self.feed.level_db(),
            spectrum: self.pipeline.latest_spectrum().cloned(),
            bands: self.bands.snapshot(),
            history: self.history.snapshot(),
        }
    }
}
