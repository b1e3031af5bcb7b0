//! # Band Mapping Module
//!
//! Folds a magnitude spectrum into a fixed number of display bands on a
//! linear, logarithmic or semitone frequency axis, and smooths each band with
//! a fast-attack / slow-release meter filter.

use serde::{Deserialize, Serialize};

use crate::config::BandConfig;
use crate::fft::SpectrumFrame;
use crate::tuning;

/// Frequency axis used to place band edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrequencyScale {
    Linear,
    #[default]
    Log,
    /// Evenly spaced in MIDI pitch, `bands_per_semitone` bands per semitone.
    Semitone,
}

/// One display bar.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DisplayBand {
    /// Mean spectrum magnitude over the band's bins this frame.
    pub raw: f32,
    /// Smoothed value to draw.
    pub display: f32,
}

/// Tells the caller whether dependent visuals must be rebuilt.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutChange {
    Unchanged,
    /// The number of bands differs from the previous layout.
    Resized { previous: usize, current: usize },
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Computes band edges in Hz.
///
/// Linear and log scales return `count + 1` edges from `min_hz` to `max_hz`.
/// The semitone scale steps `1 / bands_per_semitone` MIDI units from `min_hz`
/// and returns as many edges as fit the range, so its band count is derived
/// from the range rather than from `count`.
pub fn compute_edges(
    scale: FrequencyScale,
    count: usize,
    min_hz: f32,
    max_hz: f32,
    reference_a4: f32,
    bands_per_semitone: u32,
) -> Vec<f32> {
    match scale {
        FrequencyScale::Linear => {
            let count = count.max(1);
            (0..=count)
                .map(|i| lerp(min_hz, max_hz, i as f32 / count as f32))
                .collect()
        }
        FrequencyScale::Log => {
            let count = count.max(1);
            let (lo, hi) = (min_hz.ln(), max_hz.ln());
            (0..=count)
                .map(|i| lerp(lo, hi, i as f32 / count as f32).exp())
                .collect()
        }
        FrequencyScale::Semitone => {
            let per_semitone = bands_per_semitone.max(1) as f32;
            let min_midi = tuning::hz_to_midi(min_hz, reference_a4);
            let max_midi = tuning::hz_to_midi(max_hz, reference_a4);
            let count = (((max_midi - min_midi) * per_semitone).round() as usize).max(1);
            (0..=count)
                .map(|i| tuning::midi_to_hz(min_midi + i as f32 / per_semitone, reference_a4))
                .collect()
        }
    }
}

/// Maps band edges to half-open FFT bin ranges.
///
/// Ranges are contiguous, never include the DC bin and never reach past
/// `fft_size / 2`. Edges above Nyquist are clamped to it. A band narrower
/// than one bin is widened to one bin and pushes its neighbours up; bands
/// left without a bin once the spectrum runs out are dropped, so the result
/// may hold fewer ranges than `edges.len() - 1`.
pub fn edges_to_bins(edges: &[f32], bin_resolution: f32, fft_size: usize) -> Vec<(usize, usize)> {
    let half = fft_size / 2;
    if half < 2 || !(bin_resolution > 0.0) {
        return Vec::new();
    }

    let nyquist = half as f32 * bin_resolution;
    let to_bin =
        |hz: f32| ((hz.min(nyquist) / bin_resolution).round().max(0.0) as usize).clamp(1, half);
    let mut ranges = Vec::with_capacity(edges.len().saturating_sub(1));
    let mut previous_end = 1;
    for pair in edges.windows(2) {
        let start = to_bin(pair[0]).max(previous_end);
        if start >= half {
            break;
        }
        let end = to_bin(pair[1]).max(start + 1).min(half);
        ranges.push((start, end));
        previous_end = end;
    }
    ranges
}

/// Spectrum to display-band mapper with per-band smoothing.
#[derive(Debug, Clone)]
pub struct BandMapper {
    config: BandConfig,
    layout: Option<(usize, u32)>,
    edges: Vec<f32>,
    bins: Vec<(usize, usize)>,
    bands: Vec<DisplayBand>,
}

impl BandMapper {
    pub fn new(config: &BandConfig) -> Self {
        Self {
            config: config.clone(),
            layout: None,
            edges: Vec::new(),
            bins: Vec::new(),
            bands: vec![DisplayBand::default(); config.count],
        }
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn edges(&self) -> &[f32] {
        &self.edges
    }

    pub fn bin_ranges(&self) -> &[(usize, usize)] {
        &self.bins
    }

    pub fn bands(&self) -> &[DisplayBand] {
        &self.bands
    }

    /// Owned copy for the visualisation layer.
    pub fn snapshot(&self) -> Vec<DisplayBand> {
        self.bands.clone()
    }

    /// Rebuilds edges and bin ranges for a spectrum layout.
    pub fn configure(&mut self, fft_size: usize, sample_rate: u32) -> LayoutChange {
        let c = &self.config;
        self.edges = compute_edges(
            c.scale,
            c.count,
            c.min_hz,
            c.max_hz,
            c.reference_a4,
            c.bands_per_semitone,
        );
        let resolution = sample_rate as f32 / fft_size.max(1) as f32;
        self.bins = edges_to_bins(&self.edges, resolution, fft_size);
        self.edges.truncate(self.bins.len() + 1);
        self.layout = Some((fft_size, sample_rate));

        let previous = self.bands.len();
        let current = self.bins.len();
        if previous == current {
            return LayoutChange::Unchanged;
        }
        log::info!("Band count changed from {} to {}", previous, current);
        self.bands = vec![DisplayBand::default(); current];
        LayoutChange::Resized { previous, current }
    }

    /// Aggregates `frame` into the bands and advances smoothing by `dt`
    /// seconds. Reconfigures first if the frame layout changed.
    pub fn update(&mut self, frame: &SpectrumFrame, dt: f32) -> LayoutChange {
        let change = if self.layout != Some((frame.fft_size, frame.sample_rate)) {
            self.configure(frame.fft_size, frame.sample_rate)
        } else {
            LayoutChange::Unchanged
        };

        let attack = 1.0 - self.config.smoothing;
        let fall = self.config.fall_speed * dt.max(0.0);
        let spectrum = &frame.magnitudes;

        for (band, &(start, end)) in self.bands.iter_mut().zip(&self.bins) {
            let end = end.min(spectrum.len());
            band.raw = if start < end {
                spectrum[start..end].iter().sum::<f32>() / (end - start) as f32
            } else {
                0.0
            };

            if band.raw > band.display {
                band.display += (band.raw - band.display) * attack;
            } else {
                band.display = (band.display - fall).max(band.raw);
            }
        }
        change
    }
}
