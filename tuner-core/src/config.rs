//! # Configuration Module
//!
//! All tunable parameters of the analysis engine, grouped by the component
//! that consumes them. Every field has a default so a partial JSON file (or no
//! file at all) yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::bands::FrequencyScale;
use crate::error::{Result, TunerError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunerConfig {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub hps: HpsConfig,
    #[serde(default)]
    pub bands: BandConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Requested FFT size. Rounded up to a power of two by the front end.
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    /// Analyses per second attempted by the producer.
    #[serde(default = "default_analysis_update_rate")]
    pub analysis_update_rate: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpsConfig {
    /// Highest harmonic multiplied into the product (harmonics 2..=H).
    #[serde(default = "default_harmonics")]
    pub harmonics: usize,
    #[serde(default = "default_noise_threshold")]
    pub noise_threshold: f32,
    #[serde(default = "default_min_frequency")]
    pub min_frequency: f32,
    #[serde(default = "default_max_frequency")]
    pub max_frequency: f32,
    #[serde(default = "default_a4")]
    pub reference_a4: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandConfig {
    #[serde(default = "default_band_count")]
    pub count: usize,
    #[serde(default = "default_band_min_hz")]
    pub min_hz: f32,
    #[serde(default = "default_band_max_hz")]
    pub max_hz: f32,
    #[serde(default)]
    pub scale: FrequencyScale,
    #[serde(default = "default_a4")]
    pub reference_a4: f32,
    #[serde(default = "default_bands_per_semitone")]
    pub bands_per_semitone: u32,
    /// Attack smoothing in [0, 1); 0 jumps straight to the target.
    #[serde(default = "default_band_smoothing")]
    pub smoothing: f32,
    /// Release speed in display units per second.
    #[serde(default = "default_fall_speed")]
    pub fall_speed: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_seconds_on_screen")]
    pub seconds_on_screen: f32,
    #[serde(default = "default_samples_per_second")]
    pub samples_per_second: f32,
    #[serde(default = "default_min_midi")]
    pub min_midi: f32,
    #[serde(default = "default_max_midi")]
    pub max_midi: f32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Exponential smoothing applied to frequency and confidence readings.
    #[serde(default = "default_history_smoothing")]
    pub smoothing: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_ring_seconds")]
    pub ring_seconds: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            fft_size: default_fft_size(),
            analysis_update_rate: default_analysis_update_rate(),
        }
    }
}

impl Default for HpsConfig {
    fn default() -> Self {
        Self {
            harmonics: default_harmonics(),
            noise_threshold: default_noise_threshold(),
            min_frequency: default_min_frequency(),
            max_frequency: default_max_frequency(),
            reference_a4: default_a4(),
        }
    }
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            count: default_band_count(),
            min_hz: default_band_min_hz(),
            max_hz: default_band_max_hz(),
            scale: FrequencyScale::default(),
            reference_a4: default_a4(),
            bands_per_semitone: default_bands_per_semitone(),
            smoothing: default_band_smoothing(),
            fall_speed: default_fall_speed(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            seconds_on_screen: default_seconds_on_screen(),
            samples_per_second: default_samples_per_second(),
            min_midi: default_min_midi(),
            max_midi: default_max_midi(),
            confidence_threshold: default_confidence_threshold(),
            smoothing: default_history_smoothing(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            ring_seconds: default_ring_seconds(),
        }
    }
}

fn default_fft_size() -> usize { 4096 }
fn default_analysis_update_rate() -> f32 { 20.0 }
fn default_harmonics() -> usize { 5 }
fn default_noise_threshold() -> f32 { 0.001 }
fn default_min_frequency() -> f32 { 50.0 }
fn default_max_frequency() -> f32 { 2000.0 }
fn default_a4() -> f32 { 440.0 }
fn default_band_count() -> usize { 64 }
fn default_band_min_hz() -> f32 { 40.0 }
fn default_band_max_hz() -> f32 { 8000.0 }
fn default_bands_per_semitone() -> u32 { 1 }
fn default_band_smoothing() -> f32 { 0.5 }
fn default_fall_speed() -> f32 { 1.5 }
fn default_seconds_on_screen() -> f32 { 8.0 }
fn default_samples_per_second() -> f32 { 30.0 }
fn default_min_midi() -> f32 { 36.0 }
fn default_max_midi() -> f32 { 84.0 }
fn default_confidence_threshold() -> f32 { 0.5 }
fn default_history_smoothing() -> f32 { 0.6 }
fn default_sample_rate() -> u32 { 44100 }
fn default_ring_seconds() -> f32 { 2.0 }

impl TunerConfig {
    /// Parses a JSON document. Missing sections and fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TunerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Rejects values no component can work with.
    ///
    /// The FFT size is deliberately not checked for being a power of two:
    /// the spectral front end rounds it up and warns instead.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TunerError::InvalidConfig(msg.to_string()));

        if self.analysis.fft_size < 2 {
            return invalid("analysis.fft_size must be at least 2");
        }
        if !(self.analysis.analysis_update_rate > 0.0) {
            return invalid("analysis.analysis_update_rate must be positive");
        }
        if self.hps.harmonics < 1 {
            return invalid("hps.harmonics must be at least 1");
        }
        if !(self.hps.min_frequency > 0.0 && self.hps.min_frequency < self.hps.max_frequency) {
            return invalid("hps frequency range must satisfy 0 < min_frequency < max_frequency");
        }
        if !(self.hps.reference_a4 > 0.0 && self.bands.reference_a4 > 0.0) {
            return invalid("reference_a4 must be positive");
        }
        if self.bands.count == 0 {
            return invalid("bands.count must be at least 1");
        }
        if !(self.bands.min_hz > 0.0 && self.bands.min_hz < self.bands.max_hz) {
            return invalid("band range must satisfy 0 < min_hz < max_hz");
        }
        if self.bands.bands_per_semitone == 0 {
            return invalid("bands.bands_per_semitone must be at least 1");
        }
        if !(0.0..1.0).contains(&self.bands.smoothing) {
            return invalid("bands.smoothing must be in [0, 1)");
        }
        if self.bands.fall_speed < 0.0 {
            return invalid("bands.fall_speed must not be negative");
        }
        if self.history.capacity() == 0 {
            return invalid("history must hold at least one sample");
        }
        if self.history.min_midi >= self.history.max_midi {
            return invalid("history.min_midi must be below history.max_midi");
        }
        if !(0.0..1.0).contains(&self.history.smoothing) {
            return invalid("history.smoothing must be in [0, 1)");
        }
        if self.capture.sample_rate == 0 {
            return invalid("capture.sample_rate must be positive");
        }
        Ok(())
    }
}

impl HistoryConfig {
    /// Ring capacity `C = secondsOnScreen × samplesPerSecond`.
    pub fn capacity(&self) -> usize {
        let c = self.seconds_on_screen * self.samples_per_second;
        if c.is_finite() && c > 0.0 { c.round() as usize } else { 0 }
    }
}

impl CaptureConfig {
    /// Capture ring length in samples, never shorter than one analysis window.
    pub fn ring_capacity(&self, window: usize) -> usize {
        let wanted = (self.ring_seconds.max(0.0) * self.sample_rate as f32) as usize;
        wanted.max(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = TunerConfig::from_json_str("{}").unwrap();
        assert_eq!(config.analysis.fft_size, 4096);
        assert_eq!(config.hps.harmonics, 5);
        assert_eq!(config.bands.scale, FrequencyScale::Log);
        assert_eq!(config.history.capacity(), 240);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let json = r#"{ "hps": { "harmonics": 3 }, "bands": { "scale": "semitone", "bands_per_semitone": 2 } }"#;
        let config = TunerConfig::from_json_str(json).unwrap();
        assert_eq!(config.hps.harmonics, 3);
        assert_eq!(config.hps.min_frequency, 50.0);
        assert_eq!(config.bands.scale, FrequencyScale::Semitone);
        assert_eq!(config.bands.bands_per_semitone, 2);
    }

    #[test]
    fn non_power_of_two_fft_size_is_accepted() {
        let config = TunerConfig::from_json_str(r#"{ "analysis": { "fft_size": 3000 } }"#).unwrap();
        assert_eq!(config.analysis.fft_size, 3000);
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let json = r#"{ "hps": { "min_frequency": 900.0, "max_frequency": 100.0 } }"#;
        assert!(matches!(
            TunerConfig::from_json_str(json),
            Err(TunerError::InvalidConfig(_))
        ));

        let json = r#"{ "bands": { "min_hz": 0.0 } }"#;
        assert!(TunerConfig::from_json_str(json).is_err());
    }

    #[test]
    fn zero_history_capacity_is_rejected() {
        let json = r#"{ "history": { "seconds_on_screen": 0.0 } }"#;
        assert!(TunerConfig::from_json_str(json).is_err());
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            TunerConfig::from_json_str("{ not json"),
            Err(TunerError::ConfigParse(_))
        ));
    }

    #[test]
    fn ring_capacity_never_below_window() {
        let capture = CaptureConfig { sample_rate: 8000, ring_seconds: 0.1 };
        assert_eq!(capture.ring_capacity(4096), 4096);
        assert_eq!(capture.ring_capacity(256), 800);
    }
}
