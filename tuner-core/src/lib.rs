// tuner-core/src/lib.rs

//! The core analysis engine for the instrument tuner.
//! This crate turns captured audio into a pitch estimate (frequency, note,
//! cents) and a smoothed band spectrum for visualisation. It is completely
//! headless and contains no GUI code.

pub mod audio;
pub mod bands;
pub mod config;
pub mod engine;
pub mod error;
pub mod fft;
pub mod history;
pub mod pipeline;
pub mod pitch;
pub mod tuning;

pub use audio::{capture_ring, AudioBlock, AudioFeed, CaptureReader, CaptureWriter, SampleSource};
pub use bands::{BandMapper, DisplayBand, FrequencyScale, LayoutChange};
pub use config::TunerConfig;
pub use engine::TunerEngine;
pub use error::{Result, TunerError};
pub use fft::{SpectralFrontEnd, SpectrumFrame};
pub use history::{PitchRingBuffer, PitchSampler};
pub use pipeline::{AnalysisPipeline, PipelineState, PipelineStats, TickOutcome};
pub use pitch::{HpsEstimator, HpsResult, PitchReading, PitchSource};

/// Read-only view of everything the visualisation layer draws in one frame.
///
/// All fields are owned copies; nothing here aliases pipeline state.
#[derive(Debug, Clone, Default)]
pub struct AnalysisSnapshot {
    pub pitch: HpsResult,
    pub level_db: f32,
    pub spectrum: Option<SpectrumFrame>,
    pub bands: Vec<DisplayBand>,
    pub history: Vec<Option<f32>>,
}
