//! # Error Module
//!
//! Errors surfaced by the analysis engine. Most of the real-time path never
//! fails (silence, saturation and odd FFT sizes are normal outcomes), so this
//! enum only covers setup and lifecycle problems.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunerError {
    /// The host has no default input device.
    #[error("no input device available")]
    NoInputDevice,

    /// The device exists but offers no mono/stereo f32 configuration.
    #[error("no suitable f32 input format found")]
    NoSupportedConfig,

    #[error("audio device error: {0}")]
    Device(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("could not read configuration: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("could not parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("analysis worker is already running")]
    AlreadyRunning,

    #[error("failed to spawn analysis worker: {0}")]
    Spawn(std::io::Error),
}

pub type Result<T> = std::result::Result<T, TunerError>;
