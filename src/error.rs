//! Custom error types for the positioning engine.
//!
//! `PlateposError` consolidates every failure the controller stack can
//! surface. The taxonomy follows the recovery policy of the batch
//! sequencer: frame and alignment problems are per-well and recoverable,
//! homing and motion acknowledgement failures are fatal to the run because
//! no stage position can be trusted afterwards.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type Result<T> = std::result::Result<T, PlateposError>;

#[derive(Error, Debug)]
pub enum PlateposError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Motion transport error: {0}")]
    Transport(String),

    #[error("Homing failed: {reason}")]
    HomingFailed { reason: String },

    #[error("No acknowledgement for '{command}' within {waited:?}")]
    MotionTimeout { command: String, waited: Duration },

    #[error("No frame delivered within {waited:?}")]
    FrameTimeout { waited: Duration },

    #[error("Light-source calibration failed: {reason}")]
    CalibrationFailed { reason: String },

    #[error("Stop requested")]
    Stopped,

    #[error("Telemetry log error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl PlateposError {
    /// Whether the batch sequencer may continue with the next well after
    /// this error. Homing and acknowledgement failures leave the stage in
    /// an untrusted state and must abort the run.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(
            self,
            PlateposError::HomingFailed { .. }
                | PlateposError::CalibrationFailed { .. }
                | PlateposError::MotionTimeout { .. }
                | PlateposError::Transport(_)
                | PlateposError::Stopped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn homing_failure_aborts_run() {
        let err = PlateposError::HomingFailed {
            reason: "endstop still triggered".into(),
        };
        assert!(err.is_fatal_for_run());
    }

    #[test]
    fn frame_timeout_is_per_well() {
        let err = PlateposError::FrameTimeout {
            waited: Duration::from_secs(5),
        };
        assert!(!err.is_fatal_for_run());
    }
}
