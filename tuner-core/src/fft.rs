//! # Fast Fourier Transform (FFT) Module
//!
//! The spectral front end of the tuner: Hann windowing followed by a radix-2
//! Cooley-Tukey transform, reduced to a magnitude spectrum of `N / 2` bins.
//!
//! ## Features
//! - Iterative in-place radix-2 FFT with a bit-reversal permutation
//! - Twiddle factors, window and scratch buffer allocated once per size
//! - Non-power-of-two sizes rounded up (with a warning), never truncated
//! - A recursive reference transform kept for cross-checking

use rustfft::num_complex::Complex;
use std::f64::consts::PI;

/// Rounds a requested FFT size up to the next power of two.
///
/// Logs a warning when the size had to change. Sizes of 0 and 1 are returned
/// as-is; the front end refuses to process them.
pub fn round_up_fft_size(requested: usize) -> usize {
    if requested <= 1 || requested.is_power_of_two() {
        return requested;
    }
    let rounded = requested.next_power_of_two();
    log::warn!(
        "FFT size {} is not a power of two, rounding up to {}",
        requested,
        rounded
    );
    rounded
}

/// Applies a Hann window to the input buffer to reduce spectral leakage.
///
/// `w[i] = 0.5 * (1 - cos(2πi / (N - 1)))`, multiplied in place.
pub fn apply_hann_window(buffer: &mut [f32]) {
    let n = buffer.len();
    if n <= 1 { return; }
    let n_minus_1 = (n - 1) as f32;
    for (i, sample) in buffer.iter_mut().enumerate() {
        let multiplier = 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n_minus_1).cos());
        *sample *= multiplier;
    }
}

/// One analysed window: magnitudes of bins `0..fft_size / 2`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumFrame {
    pub magnitudes: Vec<f32>,
    pub sample_rate: u32,
    pub fft_size: usize,
}

impl SpectrumFrame {
    /// Width of one bin in Hz, `sampleRate / fftSize`.
    pub fn bin_resolution(&self) -> f32 {
        self.sample_rate as f32 / self.fft_size as f32
    }

    /// Index of the strongest bin, ignoring DC.
    pub fn peak_bin(&self) -> Option<usize> {
        self.magnitudes
            .iter()
            .enumerate()
            .skip(1)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
    }
}

/// Windowing + FFT for a fixed frame size.
///
/// Everything the transform needs is precomputed in [`SpectralFrontEnd::new`],
/// so [`SpectralFrontEnd::process`] does not allocate apart from the returned
/// magnitude vector.
#[derive(Debug, Clone)]
pub struct SpectralFrontEnd {
    fft_size: usize,
    window: Vec<f32>,
    twiddles: Vec<Complex<f32>>,
    bit_reverse: Vec<usize>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralFrontEnd {
    /// Creates a front end for `requested_size` samples, rounded up to a
    /// power of two.
    pub fn new(requested_size: usize) -> Self {
        let fft_size = round_up_fft_size(requested_size);

        let mut window = vec![1.0; fft_size];
        apply_hann_window(&mut window);

        let twiddles = (0..fft_size / 2)
            .map(|k| {
                let angle = -2.0 * PI * k as f64 / fft_size as f64;
                Complex::new(angle.cos() as f32, angle.sin() as f32)
            })
            .collect();

        Self {
            fft_size,
            window,
            twiddles,
            bit_reverse: bit_reverse_table(fft_size),
            scratch: vec![Complex::new(0.0, 0.0); fft_size],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Windows `frame` in place and returns its magnitude spectrum.
    ///
    /// # Arguments
    ///
    /// * `frame` - Exactly `fft_size` time-domain samples. Overwritten with
    ///   the windowed signal.
    /// * `sample_rate` - Sample rate of `frame` in Hz, carried into the result
    ///   for bin-to-frequency conversion.
    ///
    /// # Returns
    ///
    /// A [`SpectrumFrame`] of `fft_size / 2` magnitudes scaled by `1 / N`, or
    /// `None` (after logging) for a mismatched frame or a degenerate size of
    /// 0 or 1.
    pub fn process(&mut self, frame: &mut [f32], sample_rate: u32) -> Option<SpectrumFrame> {
        let n = self.fft_size;
        if n <= 1 {
            log::warn!("Refusing to transform a frame of size {}", n);
            return None;
        }
        if frame.len() != n {
            log::warn!("Frame has {} samples, front end expects {}", frame.len(), n);
            return None;
        }

        for (sample, w) in frame.iter_mut().zip(&self.window) {
            *sample *= *w;
        }

        for (i, &j) in self.bit_reverse.iter().enumerate() {
            self.scratch[i] = Complex::new(frame[j], 0.0);
        }
        butterflies(&mut self.scratch, &self.twiddles);

        let scale = 1.0 / n as f32;
        let magnitudes = self.scratch[..n / 2]
            .iter()
            .map(|c| c.norm() * scale)
            .collect();

        Some(SpectrumFrame { magnitudes, sample_rate, fft_size: n })
    }
}

/// Computes the magnitude spectrum of an arbitrary-length signal.
///
/// A non-power-of-two length is zero-padded up to the next power of two.
/// Builds a fresh [`SpectralFrontEnd`]; prefer keeping one around when
/// transforming repeatedly.
pub fn magnitude_spectrum(signal: &[f32], sample_rate: u32) -> Option<SpectrumFrame> {
    let mut front_end = SpectralFrontEnd::new(signal.len());
    let mut frame = signal.to_vec();
    frame.resize(front_end.fft_size(), 0.0);
    front_end.process(&mut frame, sample_rate)
}

fn bit_reverse_table(n: usize) -> Vec<usize> {
    if n <= 1 {
        return (0..n).collect();
    }
    let bits = n.trailing_zeros();
    (0..n)
        .map(|i| i.reverse_bits() >> (usize::BITS - bits))
        .collect()
}

/// In-place decimation-in-time passes over bit-reversed input.
fn butterflies(data: &mut [Complex<f32>], twiddles: &[Complex<f32>]) {
    let n = data.len();
    let mut size = 2;
    while size <= n {
        let half = size / 2;
        let stride = n / size;
        for start in (0..n).step_by(size) {
            for k in 0..half {
                let w = twiddles[k * stride];
                let even = data[start + k];
                let odd = data[start + k + half] * w;
                data[start + k] = even + odd;
                data[start + k + half] = even - odd;
            }
        }
        size *= 2;
    }
}

/// Recursive radix-2 Cooley-Tukey transform.
///
/// Allocates on every level; kept as the reference the in-place transform
/// is checked against. Input length must be a power of two.
pub fn fft_recursive(input: &[Complex<f32>]) -> Vec<Complex<f32>> {
    let n = input.len();
    if n <= 1 {
        return input.to_vec();
    }

    let even: Vec<_> = input.iter().step_by(2).copied().collect();
    let odd: Vec<_> = input.iter().skip(1).step_by(2).copied().collect();
    let even = fft_recursive(&even);
    let odd = fft_recursive(&odd);

    let mut output = vec![Complex::new(0.0, 0.0); n];
    for k in 0..n / 2 {
        let angle = -2.0 * PI * k as f64 / n as f64;
        let twiddle = Complex::new(angle.cos() as f32, angle.sin() as f32) * odd[k];
        output[k] = even[k] + twiddle;
        output[k + n / 2] = even[k] - twiddle;
    }
    output
}

#[cfg(test)]
pub(crate) fn sine(frequency: f32, sample_rate: u32, len: usize, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustfft::FftPlanner;

    #[test]
    fn sizes_round_up_to_power_of_two() {
        assert_eq!(round_up_fft_size(4096), 4096);
        assert_eq!(round_up_fft_size(3000), 4096);
        assert_eq!(round_up_fft_size(1025), 2048);
        assert_eq!(SpectralFrontEnd::new(1000).fft_size(), 1024);
    }

    #[test]
    fn spectrum_is_half_the_fft_size() {
        let mut front_end = SpectralFrontEnd::new(1024);
        let mut frame = sine(440.0, 44100, 1024, 0.5);
        let spectrum = front_end.process(&mut frame, 44100).unwrap();
        assert_eq!(spectrum.magnitudes.len(), 512);
        assert_eq!(spectrum.fft_size, 1024);
    }

    #[test]
    fn sine_peak_lands_on_expected_bin() {
        for &(freq, sr, n) in &[(110.0, 44100, 4096), (440.0, 48000, 2048), (1000.0, 22050, 1024)] {
            let mut front_end = SpectralFrontEnd::new(n);
            let mut frame = sine(freq, sr, n, 0.8);
            let spectrum = front_end.process(&mut frame, sr).unwrap();
            let expected = (freq * n as f32 / sr as f32).round() as i64;
            let peak = spectrum.peak_bin().unwrap() as i64;
            assert!(
                (peak - expected).abs() <= 1,
                "{} Hz: expected bin {}, got {}",
                freq,
                expected,
                peak
            );
        }
    }

    #[test]
    fn a_110_hz_tone_at_44100_peaks_near_bin_10() {
        let mut front_end = SpectralFrontEnd::new(4096);
        let mut frame = sine(110.0, 44100, 4096, 1.0);
        let spectrum = front_end.process(&mut frame, 44100).unwrap();
        assert!((spectrum.bin_resolution() - 10.766).abs() < 1e-3);
        let peak = spectrum.peak_bin().unwrap();
        assert!((9..=11).contains(&peak), "peak bin {}", peak);
    }

    #[test]
    fn matches_rustfft_oracle() {
        let n = 512;
        let signal: Vec<f32> = (0..n)
            .map(|i| ((i * 7919) % 97) as f32 / 97.0 - 0.5)
            .collect();

        let mut windowed = signal.clone();
        apply_hann_window(&mut windowed);
        let mut oracle: Vec<Complex<f32>> = windowed.iter().map(|&s| Complex::new(s, 0.0)).collect();
        FftPlanner::<f32>::new().plan_fft_forward(n).process(&mut oracle);

        let mut frame = signal;
        let spectrum = SpectralFrontEnd::new(n).process(&mut frame, 8000).unwrap();

        for (k, magnitude) in spectrum.magnitudes.iter().enumerate() {
            let expected = oracle[k].norm() / n as f32;
            assert!(
                (magnitude - expected).abs() < 1e-4,
                "bin {}: {} vs {}",
                k,
                magnitude,
                expected
            );
        }
    }

    #[test]
    fn recursive_and_in_place_transforms_agree() {
        let n = 64;
        let input: Vec<Complex<f32>> = (0..n)
            .map(|i| Complex::new((i as f32 * 0.3).sin(), 0.0))
            .collect();
        let reference = fft_recursive(&input);

        let mut data: Vec<Complex<f32>> = bit_reverse_table(n).iter().map(|&j| input[j]).collect();
        let twiddles: Vec<Complex<f32>> = (0..n / 2)
            .map(|k| {
                let angle = -2.0 * PI * k as f64 / n as f64;
                Complex::new(angle.cos() as f32, angle.sin() as f32)
            })
            .collect();
        butterflies(&mut data, &twiddles);

        for (a, b) in data.iter().zip(&reference) {
            assert!((a - b).norm() < 1e-4);
        }
    }

    #[test]
    fn recursive_base_case_returns_sample() {
        let single = [Complex::new(0.25, 0.0)];
        assert_eq!(fft_recursive(&single), single.to_vec());
    }

    #[test]
    fn degenerate_sizes_return_none() {
        let mut empty: [f32; 0] = [];
        assert!(SpectralFrontEnd::new(0).process(&mut empty, 44100).is_none());
        let mut one = [1.0];
        assert!(SpectralFrontEnd::new(1).process(&mut one, 44100).is_none());
    }

    #[test]
    fn mismatched_frame_length_is_rejected() {
        let mut front_end = SpectralFrontEnd::new(256);
        let mut frame = vec![0.0; 128];
        assert!(front_end.process(&mut frame, 44100).is_none());
    }

    #[test]
    fn odd_length_signal_is_zero_padded() {
        let signal = sine(440.0, 44100, 3000, 0.5);
        let spectrum = magnitude_spectrum(&signal, 44100).unwrap();
        assert_eq!(spectrum.fft_size, 4096);
        assert_eq!(spectrum.magnitudes.len(), 2048);
    }

    #[test]
    fn hann_window_tapers_to_zero_at_edges() {
        let mut buffer = vec![1.0; 9];
        apply_hann_window(&mut buffer);
        assert!(buffer[0].abs() < 1e-6);
        assert!(buffer[8].abs() < 1e-6);
        assert!((buffer[4] - 1.0).abs() < 1e-6);
    }
}
