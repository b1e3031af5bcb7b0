//! # Musical Tuning Module
//!
//! Equal-temperament helpers: note naming relative to C0, cents deviation and
//! the continuous MIDI pitch scale used by the band mapper and pitch history.
//!
//! All functions take the reference pitch of A4 explicitly so a tuner set to,
//! say, A4 = 442 Hz names and measures notes against that reference.

use once_cell::sync::Lazy;

/// Standard concert pitch.
pub const DEFAULT_A4: f32 = 440.0;

/// Placeholder note name reported when there is no pitch.
pub const NO_NOTE: &str = "--";

/// Note names in semitone order starting at C.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Highest octave with a precomputed label.
const MAX_LABEL_OCTAVE: i32 = 9;

/// Labels such as "A4" for every semitone from C0 to B9.
///
/// Index is the number of semitones above C0.
static NOTE_LABELS: Lazy<Vec<String>> = Lazy::new(|| {
    (0..=MAX_LABEL_OCTAVE)
        .flat_map(|octave| NOTE_NAMES.iter().map(move |name| format!("{}{}", name, octave)))
        .collect()
});

/// Frequency of C0 for a given A4, `a4 * 2^(-4.75)`.
pub fn c0_frequency(a4: f32) -> f32 {
    a4 * 2.0_f32.powf(-4.75)
}

/// Nearest semitone to `freq`, counted from C0.
///
/// `None` for non-positive or non-finite input.
pub fn semitones_from_c0(freq: f32, a4: f32) -> Option<i32> {
    if !(freq > 0.0) || !freq.is_finite() {
        return None;
    }
    Some((12.0 * (freq / c0_frequency(a4)).log2()).round() as i32)
}

/// Names the note nearest to `freq`, returning `(name, octave)`.
///
/// Frequencies at or below zero yield `("--", 0)`.
pub fn note_name(freq: f32, a4: f32) -> (&'static str, i32) {
    match semitones_from_c0(freq, a4) {
        Some(h) => (NOTE_NAMES[h.rem_euclid(12) as usize], h.div_euclid(12)),
        None => (NO_NOTE, 0),
    }
}

/// Display label ("A4", "C#3") for a semitone index from C0.
pub fn note_label(semitone_from_c0: i32) -> Option<&'static str> {
    usize::try_from(semitone_from_c0)
        .ok()
        .and_then(|i| NOTE_LABELS.get(i))
        .map(String::as_str)
}

/// Exact equal-tempered frequency of the semitone `h` steps above C0.
pub fn semitone_frequency(h: i32, a4: f32) -> f32 {
    c0_frequency(a4) * 2.0_f32.powf(h as f32 / 12.0)
}

/// Calculates the deviation from a target frequency in cents.
///
/// Positive values are sharp, negative values flat.
pub fn calculate_cents_deviation(freq: f32, target_freq: f32) -> f32 {
    1200.0 * (freq / target_freq).log2()
}

/// Cents between `freq` and its nearest equal-tempered semitone.
///
/// Not clamped; lies in roughly -50..+50. Returns 0 for no pitch.
pub fn cents_from_nearest(freq: f32, a4: f32) -> f32 {
    match semitones_from_c0(freq, a4) {
        Some(h) => calculate_cents_deviation(freq, semitone_frequency(h, a4)),
        None => 0.0,
    }
}

/// Continuous MIDI pitch, `69 + 12·log2(hz / a4)`.
pub fn hz_to_midi(hz: f32, a4: f32) -> f32 {
    69.0 + 12.0 * (hz / a4).log2()
}

pub fn midi_to_hz(midi: f32, a4: f32) -> f32 {
    a4 * 2.0_f32.powf((midi - 69.0) / 12.0)
}
