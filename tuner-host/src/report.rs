//! Text rendering of per-tick snapshots for the log.

use tuner_core::{AnalysisSnapshot, PipelineStats};

/// Characters used for the band meter, quietest first.
const METER: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Width of the band meter in characters.
const METER_WIDTH: usize = 32;

pub fn status_line(snapshot: &AnalysisSnapshot) -> String {
    let pitch = &snapshot.pitch;
    let note = if pitch.is_detected() {
        format!(
            "{} {:+5.1} cents ({:7.2} Hz, conf {:.2})",
            pitch.label(), pitch.cents, pitch.frequency, pitch.confidence
        )
    } else {
        format!("{} (no pitch)", pitch.note)
    };
    format!(
        "{} | level {:6.1} dB | {}",
        note,
        snapshot.level_db,
        band_meter(snapshot)
    )
}

pub fn stats_line(stats: &PipelineStats) -> String {
    format!(
        "frames queued {} dropped {} analysed {} failed {}",
        stats.enqueued, stats.dropped, stats.analysed, stats.failures
    )
}

/// Squeezes the display bands into a fixed-width bar chart.
fn band_meter(snapshot: &AnalysisSnapshot) -> String {
    let bands = &snapshot.bands;
    if bands.is_empty() {
        return String::new();
    }
    let peak = bands.iter().map(|b| b.display).fold(0.0f32, f32::max);
    if peak <= 0.0 {
        return METER[0].to_string().repeat(METER_WIDTH.min(bands.len()));
    }

    let width = METER_WIDTH.min(bands.len());
    (0..width)
        .map(|column| {
            let start = column * bands.len() / width;
            let end = ((column + 1) * bands.len() / width).max(start + 1);
            let level = bands[start..end].iter().map(|b| b.display).fold(0.0f32, f32::max) / peak;
            let index = (level * (METER.len() - 1) as f32).round() as usize;
            METER[index.min(METER.len() - 1)]
        })
        .collect()
}
