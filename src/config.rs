//! Configuration management.
//!
//! All empirically-tuned constants of the positioning engine live here as
//! named settings: damped-gain divisors, alignment tolerance, loop caps,
//! the distance-based settle table and the detector thresholds. Defaults
//! reproduce the values the reader hardware was tuned with; none of them
//! should be assumed to generalize to other optics or stage geometries.

use crate::error::Result;
use crate::wellmap::WellTarget;
use config::Config;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub camera: CameraSettings,
    pub plate: PlateGeometry,
    #[serde(default)]
    pub stage: StageSettings,
    #[serde(default)]
    pub alignment: AlignmentSettings,
    #[serde(default)]
    pub locator: LocatorSettings,
    pub batch: BatchSettings,
}

fn default_log_level() -> String {
    "info".into()
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

/// Sensor resolution, used to seed the locator radius window and the
/// alignment tolerance denominators.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct CameraSettings {
    pub width: u32,
    pub height: u32,
}

/// Physical plate geometry. Row/column indices are 1-based; index 0 is a
/// sentinel in the well map.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PlateGeometry {
    pub rows: usize,
    pub columns: usize,
    pub origin_x_mm: f64,
    pub origin_y_mm: f64,
    pub row_pitch_mm: f64,
    pub col_pitch_mm: f64,
}

/// One step of the distance-based settle table: moves of at most
/// `up_to_mm` wait `delay` before imaging.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SettleStep {
    pub up_to_mm: f64,
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

/// Mechanical settling delays as a step function of travel distance.
#[derive(Debug, Deserialize, Clone)]
pub struct SettleSettings {
    #[serde(default = "default_settle_table")]
    pub table: Vec<SettleStep>,
    /// Delay for moves beyond the last table entry.
    #[serde(with = "humantime_serde", default = "default_settle_beyond")]
    pub beyond: Duration,
    /// Assumed travel distance when the previous position is unknown.
    #[serde(default = "default_unknown_distance")]
    pub unknown_distance_mm: f64,
}

fn default_settle_table() -> Vec<SettleStep> {
    vec![
        SettleStep {
            up_to_mm: 20.0,
            delay: Duration::from_secs(1),
        },
        SettleStep {
            up_to_mm: 50.0,
            delay: Duration::from_secs(3),
        },
        SettleStep {
            up_to_mm: 70.0,
            delay: Duration::from_secs(5),
        },
        SettleStep {
            up_to_mm: 85.0,
            delay: Duration::from_secs(8),
        },
    ]
}

fn default_settle_beyond() -> Duration {
    Duration::from_secs(11)
}

fn default_unknown_distance() -> f64 {
    50.0
}

impl Default for SettleSettings {
    fn default() -> Self {
        Self {
            table: default_settle_table(),
            beyond: default_settle_beyond(),
            unknown_distance_mm: default_unknown_distance(),
        }
    }
}

impl SettleSettings {
    /// Settle delay for a move of `distance_mm`.
    pub fn delay_for(&self, distance_mm: f64) -> Duration {
        for step in &self.table {
            if distance_mm < step.up_to_mm {
                return step.delay;
            }
        }
        self.beyond
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StageSettings {
    /// Watchdog for move/wait-for-finish acknowledgement.
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,
    /// Watchdog for the homing acknowledgement (mechanically slower).
    #[serde(with = "humantime_serde", default = "default_homing_timeout")]
    pub homing_timeout: Duration,
    /// Quantum for every bounded polling loop.
    #[serde(with = "humantime_serde", default = "default_poll_quantum")]
    pub poll_quantum: Duration,
    #[serde(default)]
    pub settle: SettleSettings,
    /// Backlight duty cycle while positioning.
    #[serde(default = "default_light_pwm")]
    pub light_pwm: f64,
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_homing_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_poll_quantum() -> Duration {
    Duration::from_millis(20)
}

fn default_light_pwm() -> f64 {
    1.0
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            ack_timeout: default_ack_timeout(),
            homing_timeout: default_homing_timeout(),
            poll_quantum: default_poll_quantum(),
            settle: SettleSettings::default(),
            light_pwm: default_light_pwm(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AlignmentSettings {
    /// Correction-loop cap; exceeding it is a soft failure, not a crash.
    #[serde(default = "default_max_loops")]
    pub max_loops: u32,
    /// Per-axis damped-gain divisors. Distinct because of stage geometry.
    #[serde(default = "default_gain_x")]
    pub gain_x: f64,
    #[serde(default = "default_gain_y")]
    pub gain_y: f64,
    /// Aligned when |offset| < dimension / divisor on both axes.
    #[serde(default = "default_tolerance_divisor")]
    pub tolerance_divisor: f64,
    /// Consecutive failed detections tolerated before FrameError.
    #[serde(default = "default_error_budget")]
    pub error_budget: u32,
    /// Wait after a correction move before requesting a frame.
    #[serde(with = "humantime_serde", default = "default_frame_settle")]
    pub frame_settle: Duration,
    /// Hard bound on waiting for a fresh frame.
    #[serde(with = "humantime_serde", default = "default_frame_timeout")]
    pub frame_timeout: Duration,
    /// Commanded positions are rounded to this granularity.
    #[serde(default = "default_step_round_mm")]
    pub step_round_mm: f64,
    /// Record a per-iteration trace CSV next to the batch output.
    #[serde(default = "default_log_fine_tuning")]
    pub log_fine_tuning: bool,
}

fn default_max_loops() -> u32 {
    20
}

fn default_gain_x() -> f64 {
    20.0
}

fn default_gain_y() -> f64 {
    15.0
}

fn default_tolerance_divisor() -> f64 {
    200.0
}

fn default_error_budget() -> u32 {
    3
}

fn default_frame_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_frame_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_step_round_mm() -> f64 {
    0.1
}

fn default_log_fine_tuning() -> bool {
    true
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            max_loops: default_max_loops(),
            gain_x: default_gain_x(),
            gain_y: default_gain_y(),
            tolerance_divisor: default_tolerance_divisor(),
            error_budget: default_error_budget(),
            frame_settle: default_frame_settle(),
            frame_timeout: default_frame_timeout(),
            step_round_mm: default_step_round_mm(),
            log_fine_tuning: default_log_fine_tuning(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocatorSettings {
    /// CLAHE clip limit; contrast limiting disabled at 0.
    #[serde(default = "default_clahe_clip")]
    pub clahe_clip: f64,
    /// CLAHE tile grid (tiles per axis).
    #[serde(default = "default_clahe_tiles")]
    pub clahe_tiles: u32,
    /// Minimum gradient magnitude for a pixel to vote in the Hough stage.
    #[serde(default = "default_edge_threshold")]
    pub edge_threshold: f64,
    /// Minimum centre votes for a Hough circle candidate.
    #[serde(default = "default_accumulator_threshold")]
    pub accumulator_threshold: u32,
    /// Circle candidate spacing is the sensor height divided by this.
    #[serde(default = "default_min_dist_divisor")]
    pub min_dist_divisor: f64,
    /// Fallback blob area cap as a fraction of the frame. A region
    /// covering essentially the whole frame means thresholding found no
    /// structure at all.
    #[serde(default = "default_max_area_fraction")]
    pub max_area_fraction: f64,
}

fn default_clahe_clip() -> f64 {
    4.0
}

fn default_clahe_tiles() -> u32 {
    8
}

fn default_edge_threshold() -> f64 {
    40.0
}

fn default_accumulator_threshold() -> u32 {
    80
}

fn default_min_dist_divisor() -> f64 {
    480.0
}

fn default_max_area_fraction() -> f64 {
    0.9
}

impl Default for LocatorSettings {
    fn default() -> Self {
        Self {
            clahe_clip: default_clahe_clip(),
            clahe_tiles: default_clahe_tiles(),
            edge_threshold: default_edge_threshold(),
            accumulator_threshold: default_accumulator_threshold(),
            min_dist_divisor: default_min_dist_divisor(),
            max_area_fraction: default_max_area_fraction(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchSettings {
    pub id: String,
    #[serde(default)]
    pub info: String,
    /// Total wall-clock budget for the run.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// Time between the starts of successive passes over all targets.
    #[serde(with = "humantime_serde")]
    pub interleave: Duration,
    pub output_root: PathBuf,
    pub targets: Vec<WellTarget>,
}
