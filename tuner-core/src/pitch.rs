//! # Pitch Detection Module
//!
//! Harmonic-product-spectrum (HPS) fundamental frequency estimation on a
//! magnitude spectrum, plus the backend-neutral reading type every pitch
//! source reports through.
//!
//! ## Algorithm
//! 1. Reject the frame if its peak magnitude is below the noise threshold
//! 2. Multiply the spectrum by copies of itself decimated by 2..=H
//! 3. Pick the strongest product bin inside the search range
//! 4. Name the note and measure the cents deviation

use crate::config::HpsConfig;
use crate::fft::SpectrumFrame;
use crate::tuning;

/// Latest pitch estimate. `frequency == 0.0` means nothing was detected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HpsResult {
    pub frequency: f32,
    pub note: &'static str,
    pub octave: i32,
    /// Deviation from the nearest semitone. Not clamped.
    pub cents: f32,
    /// Share of the in-range HPS energy held by the winning peak, 0..=1.
    pub confidence: f32,
}

impl HpsResult {
    /// The "no detection" result.
    pub const NONE: HpsResult = HpsResult {
        frequency: 0.0,
        note: tuning::NO_NOTE,
        octave: 0,
        cents: 0.0,
        confidence: 0.0,
    };

    /// Builds a result for `frequency`, naming it against `a4`.
    pub fn from_frequency(frequency: f32, confidence: f32, a4: f32) -> Self {
        if !(frequency > 0.0) {
            return Self::NONE;
        }
        let (note, octave) = tuning::note_name(frequency, a4);
        Self {
            frequency,
            note,
            octave,
            cents: tuning::cents_from_nearest(frequency, a4),
            confidence,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.frequency > 0.0
    }

    /// Note and octave as one label, e.g. "C#3". "--" when nothing was
    /// detected or the note lies outside C0..B9.
    pub fn label(&self) -> &'static str {
        tuning::NOTE_NAMES
            .iter()
            .position(|name| *name == self.note)
            .and_then(|index| tuning::note_label(self.octave * 12 + index as i32))
            .unwrap_or(tuning::NO_NOTE)
    }

    pub fn reading(&self) -> PitchReading {
        PitchReading {
            frequency: self.frequency,
            confidence: self.confidence,
            cents: self.cents,
        }
    }
}

impl Default for HpsResult {
    fn default() -> Self {
        Self::NONE
    }
}

/// The result shape shared by every pitch backend.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PitchReading {
    pub frequency: f32,
    pub confidence: f32,
    pub cents: f32,
}

/// Anything that can report the latest pitch without blocking.
pub trait PitchSource {
    fn latest_reading(&self) -> PitchReading;
}

/// Harmonic product spectrum estimator.
///
/// Holds its working buffer so repeated estimates do not allocate.
#[derive(Debug, Clone)]
pub struct HpsEstimator {
    harmonics: usize,
    noise_threshold: f32,
    min_frequency: f32,
    max_frequency: f32,
    reference_a4: f32,
    hps: Vec<f32>,
}

impl HpsEstimator {
    pub fn new(config: &HpsConfig) -> Self {
        Self {
            harmonics: config.harmonics.max(1),
            noise_threshold: config.noise_threshold,
            min_frequency: config.min_frequency,
            max_frequency: config.max_frequency,
            reference_a4: config.reference_a4,
            hps: Vec::new(),
        }
    }

    pub fn set_reference_pitch(&mut self, a4: f32) {
        if a4 > 0.0 {
            self.reference_a4 = a4;
        }
    }

    pub fn set_frequency_range(&mut self, min_frequency: f32, max_frequency: f32) {
        if min_frequency > 0.0 && min_frequency < max_frequency {
            self.min_frequency = min_frequency;
            self.max_frequency = max_frequency;
        }
    }

    /// Estimates the fundamental frequency of a spectrum using the
    /// Harmonic Product Spectrum.
    ///
    /// # Arguments
    ///
    /// * `frame` - Magnitude spectrum from the spectral front end. Its sample
    ///   rate and FFT size give the bin resolution.
    ///
    /// # Returns
    ///
    /// The detected pitch named against the current reference A4, or
    /// [`HpsResult::NONE`] when the peak is below the noise threshold or the
    /// search range holds no usable bin.
    pub fn estimate(&mut self, frame: &SpectrumFrame) -> HpsResult {
        let spectrum = &frame.magnitudes;
        let len = spectrum.len();
        if len < 2 {
            return HpsResult::NONE;
        }

        // --- Noise gate on the raw spectrum ---
        let peak = spectrum.iter().copied().fold(0.0f32, f32::max);
        if peak < self.noise_threshold {
            return HpsResult::NONE;
        }

        // --- Harmonic product ---
        self.hps.clear();
        self.hps.extend_from_slice(spectrum);
        for h in 2..=self.harmonics {
            let reach = (len - 1) / h + 1;
            for k in 0..reach {
                self.hps[k] *= spectrum[k * h];
            }
        }

        // --- Search range to bins, DC excluded ---
        let resolution = frame.bin_resolution();
        if !(resolution > 0.0) {
            return HpsResult::NONE;
        }
        let lo = ((self.min_frequency / resolution).floor() as usize).max(1);
        let hi = ((self.max_frequency / resolution).ceil() as usize).min(len - 1);
        if lo > hi {
            return HpsResult::NONE;
        }

        let (best_bin, best_value) = self.hps[lo..=hi]
            .iter()
            .enumerate()
            .fold((lo, 0.0f32), |(bin, value), (offset, &v)| {
                if v > value { (lo + offset, v) } else { (bin, value) }
            });
        if !(best_value > 0.0) {
            return HpsResult::NONE;
        }

        let confidence = self.peak_share(best_bin, lo, hi);
        HpsResult::from_frequency(best_bin as f32 * resolution, confidence, self.reference_a4)
    }

    fn peak_share(&self, best_bin: usize, lo: usize, hi: usize) -> f32 {
        let total: f64 = self.hps[lo..=hi].iter().map(|&v| v as f64).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let start = best_bin.saturating_sub(1).max(lo);
        let end = (best_bin + 1).min(hi);
        let peak: f64 = self.hps[start..=end].iter().map(|&v| v as f64).sum();
        (peak / total).clamp(0.0, 1.0) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft::{SpectralFrontEnd, sine};

    const SR: u32 = 44100;
    const N: usize = 4096;

    fn estimator(harmonics: usize) -> HpsEstimator {
        HpsEstimator::new(&HpsConfig {
            harmonics,
            noise_threshold: 0.001,
            min_frequency: 50.0,
            max_frequency: 2000.0,
            reference_a4: 440.0,
        })
    }

    fn spectrum_of(partials: &[(f32, f32)]) -> SpectrumFrame {
        let mut frame = vec![0.0; N];
        for &(freq, amp) in partials {
            for (s, p) in frame.iter_mut().zip(sine(freq, SR, N, amp)) {
                *s += p;
            }
        }
        SpectralFrontEnd::new(N).process(&mut frame, SR).unwrap()
    }

    #[test]
    fn silence_is_not_detected() {
        let spectrum = spectrum_of(&[]);
        assert_eq!(estimator(5).estimate(&spectrum), HpsResult::NONE);
    }

    #[test]
    fn below_noise_threshold_returns_zero() {
        let mut est = estimator(5);
        for amp in [1e-5, 1e-4, 2e-3] {
            // Peak magnitude of a Hann-windowed sine is about amp / 4.
            let spectrum = spectrum_of(&[(440.0, amp)]);
            let peak = spectrum.magnitudes.iter().copied().fold(0.0f32, f32::max);
            assert!(peak < 0.001);
            assert_eq!(est.estimate(&spectrum).frequency, 0.0);
        }

        let flat = SpectrumFrame { magnitudes: vec![0.0009; 2048], sample_rate: SR, fft_size: N };
        assert_eq!(est.estimate(&flat).frequency, 0.0);
    }

    #[test]
    fn recovers_fundamental_weaker_than_its_harmonics() {
        let resolution = SR as f32 / N as f32;
        let f0 = 20.0 * resolution;
        let partials = [(f0, 0.2), (2.0 * f0, 0.9), (3.0 * f0, 0.8), (4.0 * f0, 0.7), (5.0 * f0, 0.6)];
        let spectrum = spectrum_of(&partials);

        assert_ne!(spectrum.peak_bin(), Some(20), "fundamental should not be the global peak");

        let result = estimator(5).estimate(&spectrum);
        assert!((result.frequency - f0).abs() < 0.5 * resolution, "got {}", result.frequency);
        assert!(result.confidence > 0.5);
    }

    #[test]
    fn recovers_off_bin_harmonic_series() {
        let resolution = SR as f32 / N as f32;
        let f0 = 196.0;
        let partials = [(f0, 0.5), (2.0 * f0, 0.6), (3.0 * f0, 0.4), (4.0 * f0, 0.3), (5.0 * f0, 0.2)];
        let result = estimator(5).estimate(&spectrum_of(&partials));
        assert!((result.frequency - f0).abs() <= resolution, "got {}", result.frequency);
        assert_eq!((result.note, result.octave), ("G", 3));
    }

    #[test]
    fn single_harmonic_reduces_to_peak_picking() {
        let result = estimator(1).estimate(&spectrum_of(&[(440.0, 0.5)]));
        let resolution = SR as f32 / N as f32;
        assert!((result.frequency - 440.0).abs() <= resolution);
        assert_eq!(result.note, "A");
    }

    #[test]
    fn search_range_excludes_out_of_range_peaks() {
        let mut est = estimator(1);
        est.set_frequency_range(500.0, 2000.0);
        let result = est.estimate(&spectrum_of(&[(220.0, 0.5), (880.0, 0.05)]));
        let resolution = SR as f32 / N as f32;
        assert!((result.frequency - 880.0).abs() <= resolution, "got {}", result.frequency);
    }

    #[test]
    fn reference_pitch_changes_cents() {
        let resolution = SR as f32 / N as f32;
        let f0 = 41.0 * resolution; // ~441.4 Hz
        let mut est = estimator(1);
        let at_440 = est.estimate(&spectrum_of(&[(f0, 0.5)]));
        est.set_reference_pitch(f0);
        let at_f0 = est.estimate(&spectrum_of(&[(f0, 0.5)]));
        assert!(at_440.cents > 4.0);
        assert!(at_f0.cents.abs() < 0.1);
    }

    #[test]
    fn no_detection_reading_is_zeroed() {
        assert_eq!(HpsResult::NONE.reading(), PitchReading::default());
        assert!(!HpsResult::from_frequency(-1.0, 0.9, 440.0).is_detected());
    }

    #[test]
    fn labels_join_note_and_octave() {
        assert_eq!(HpsResult::from_frequency(440.0, 1.0, 440.0).label(), "A4");
        assert_eq!(HpsResult::from_frequency(138.59, 1.0, 440.0).label(), "C#3");
        assert_eq!(HpsResult::NONE.label(), "--");
    }
}
