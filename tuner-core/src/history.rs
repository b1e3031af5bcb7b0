//! # Pitch History Module
//!
//! Scrolling pitch trace: a fixed-capacity ring of normalised pitch positions
//! and the sampler that decides when a new position is recorded.
//!
//! Low-confidence stretches are not recorded at all; the trace freezes at its
//! last state instead of writing a gap marker.

use std::time::{Duration, Instant};

use crate::config::HistoryConfig;
use crate::pitch::PitchReading;
use crate::tuning;

/// Circular buffer of pitch positions in `[0, 1]`.
///
/// Unwritten slots are `None`.
#[derive(Debug, Clone)]
pub struct PitchRingBuffer {
    slots: Vec<Option<f32>>,
    head: usize,
    written: u64,
    min_midi: f32,
    max_midi: f32,
    reference_a4: f32,
}

impl PitchRingBuffer {
    /// Creates a ring of `capacity` slots (at least one) covering the MIDI
    /// range `min_midi..max_midi`.
    pub fn new(capacity: usize, min_midi: f32, max_midi: f32, reference_a4: f32) -> Self {
        Self {
            slots: vec![None; capacity.max(1)],
            head: 0,
            written: 0,
            min_midi,
            max_midi,
            reference_a4,
        }
    }

    pub fn from_config(config: &HistoryConfig, reference_a4: f32) -> Self {
        Self::new(config.capacity(), config.min_midi, config.max_midi, reference_a4)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Changes A4 for samples written from now on.
    pub fn set_reference_pitch(&mut self, a4: f32) {
        self.reference_a4 = a4;
    }

    /// Index of the newest slot.
    pub fn head(&self) -> usize {
        self.head
    }

    /// True once every slot has been written at least once.
    pub fn is_full(&self) -> bool {
        self.written >= self.slots.len() as u64
    }

    /// Maps a frequency onto the display range, clamped to `[0, 1]`.
    pub fn normalize(&self, frequency: f32) -> f32 {
        let midi = tuning::hz_to_midi(frequency, self.reference_a4);
        let span = self.max_midi - self.min_midi;
        if !(span > 0.0) || !midi.is_finite() {
            return 0.0;
        }
        ((midi - self.min_midi) / span).clamp(0.0, 1.0)
    }

    /// Records `frequency` as the newest sample.
    pub fn advance(&mut self, frequency: f32) {
        let position = self.normalize(frequency);
        self.head = (self.head + 1) % self.slots.len();
        self.slots[self.head] = Some(position);
        self.written += 1;
    }

    pub fn latest(&self) -> Option<f32> {
        self.slots[self.head]
    }

    /// Slots from oldest to newest, starting at `(head - C + 1) mod C`.
    pub fn iter(&self) -> impl Iterator<Item = Option<f32>> + '_ {
        let capacity = self.slots.len();
        (1..=capacity).map(move |i| self.slots[(self.head + i) % capacity])
    }

    pub fn snapshot(&self) -> Vec<Option<f32>> {
        self.iter().collect()
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.head = 0;
        self.written = 0;
    }
}

/// Smooths pitch readings and feeds the ring at a bounded rate.
#[derive(Debug, Clone)]
pub struct PitchSampler {
    smoothing: f32,
    confidence_threshold: f32,
    interval: Duration,
    last_sample: Option<Instant>,
    /// Smoothed pitch as log2(Hz); `None` until the first detection.
    log_frequency: Option<f32>,
    confidence: f32,
}

impl PitchSampler {
    pub fn new(config: &HistoryConfig) -> Self {
        let rate = if config.samples_per_second > 0.0 { config.samples_per_second as f64 } else { 1.0 };
        Self {
            smoothing: config.smoothing.clamp(0.0, 0.999),
            confidence_threshold: config.confidence_threshold,
            interval: Duration::from_secs_f64(1.0 / rate),
            last_sample: None,
            log_frequency: None,
            confidence: 0.0,
        }
    }

    pub fn smoothed_frequency(&self) -> f32 {
        self.log_frequency.map_or(0.0, f32::exp2)
    }

    pub fn smoothed_confidence(&self) -> f32 {
        self.confidence
    }

    /// Folds `reading` into the smoothed state and, if a sample is due and
    /// the smoothed pitch is confident, advances `ring`.
    ///
    /// Returns whether a sample was written.
    pub fn update(&mut self, reading: PitchReading, now: Instant, ring: &mut PitchRingBuffer) -> bool {
        let alpha = self.smoothing;
        self.confidence = self.confidence * alpha + reading.confidence.max(0.0) * (1.0 - alpha);
        if reading.frequency > 0.0 {
            let target = reading.frequency.log2();
            self.log_frequency = Some(match self.log_frequency {
                Some(current) => current * alpha + target * (1.0 - alpha),
                None => target,
            });
        }

        let due = self
            .last_sample
            .is_none_or(|last| now.saturating_duration_since(last) >= self.interval);
        if !due {
            return false;
        }
        self.last_sample = Some(now);

        let frequency = self.smoothed_frequency();
        if self.confidence >= self.confidence_threshold && frequency > 0.0 {
            ring.advance(frequency);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_sample = None;
        self.log_frequency = None;
        self.confidence = 0.0;
    }
}
