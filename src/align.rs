//! Damped-gain fine alignment of a well under the camera.
//!
//! After the coarse move to a well, the measured pixel offset between the
//! detected well centre and the calibrated alignment target is converted
//! into a stage correction with a per-axis damped gain: correction `n` is
//! `offset / ((n + 1) * gain)`, so early corrections move boldly and
//! later ones cannot oscillate. `n` counts corrections only; a failed
//! detection is retried without advancing the damping or consuming the
//! correction budget. The loop ends in one of three ways:
//! within tolerance (aligned), the loop cap (not aligned, soft failure),
//! or too many consecutive detection failures (frame error, the well is
//! skipped and the stage position is no longer trusted).

use crate::config::Settings;
use crate::error::{PlateposError, Result};
use crate::events::{AlignEvent, EventBus, StopFlag};
use crate::frame::FrameBus;
use crate::locator::WellLocator;
use crate::stage::{sleep_checked, StagePositioner};
use crate::wellmap::PlatePosition;
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Terminal state of one alignment attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AlignOutcome {
    /// Offset within tolerance on both axes after `loops` corrections.
    Aligned { loops: u32, position: PlatePosition },
    /// Loop cap reached with the well still off-centre. The position is
    /// usable but low-confidence.
    NotAligned { loops: u32 },
    /// Consecutive detection failures exhausted the error budget; the
    /// stage may have drifted somewhere without a visible well.
    FrameError { failures: u32 },
}

/// Per-iteration trace written next to the batch output for tuning the
/// gain constants offline.
pub struct FineTuningTrace {
    writer: csv::Writer<std::fs::File>,
}

impl FineTuningTrace {
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "run_time",
            "target_x_mm",
            "target_y_mm",
            "err_x_px",
            "err_y_px",
        ])?;
        writer.flush()?;
        Ok(Self { writer })
    }

    fn record(&mut self, target: PlatePosition, err_x: f64, err_y: f64) -> Result<()> {
        self.writer.write_record([
            Utc::now().to_rfc3339(),
            format!("{}", target.x_mm),
            format!("{}", target.y_mm),
            format!("{err_x}"),
            format!("{err_y}"),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

pub struct AlignmentController {
    locator: Arc<dyn WellLocator>,
    frames: FrameBus,
    events: EventBus<AlignEvent>,
    stop: StopFlag,
    settings: Settings,
}

impl AlignmentController {
    pub fn new(
        locator: Arc<dyn WellLocator>,
        frames: FrameBus,
        events: EventBus<AlignEvent>,
        stop: StopFlag,
        settings: Settings,
    ) -> Self {
        Self {
            locator,
            frames,
            events,
            stop,
            settings,
        }
    }

    /// Pixel tolerance per axis: dimension divided by the configured
    /// divisor.
    fn tolerance(&self) -> (f64, f64) {
        let divisor = self.settings.alignment.tolerance_divisor;
        (
            f64::from(self.settings.camera.width) / divisor,
            f64::from(self.settings.camera.height) / divisor,
        )
    }

    /// Run the correction loop until aligned, the loop cap, or a frame
    /// error. The stage is assumed to already be at the well's coarse
    /// position with the light on.
    pub async fn align(
        &self,
        stage: &mut StagePositioner,
        mut trace: Option<&mut FineTuningTrace>,
    ) -> Result<AlignOutcome> {
        let align_cfg = &self.settings.alignment;
        let quantum = self.settings.stage.poll_quantum;
        let (tol_x, tol_y) = self.tolerance();

        let mut current = stage.position().unwrap_or_default();
        // Corrections and failed detections are accounted separately: a
        // retry must not inflate the damping of the next real correction.
        let mut corrections = 0u32;
        let mut failures = 0u32;

        while corrections < align_cfg.max_loops {
            if self.stop.is_stopped() {
                return Err(PlateposError::Stopped);
            }

            // Let vibration die down, then insist on a frame captured
            // after the wait.
            sleep_checked(align_cfg.frame_settle, quantum, &self.stop).await?;
            let frame = match self
                .frames
                .await_fresh(align_cfg.frame_timeout, quantum, &self.stop)
                .await
            {
                Ok(frame) => frame,
                Err(PlateposError::FrameTimeout { .. }) => {
                    failures += 1;
                    warn!(corrections, failures, "no frame during alignment");
                    if failures >= align_cfg.error_budget {
                        return Ok(AlignOutcome::FrameError { failures });
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            let target = stage.alignment_target().unwrap_or_else(|| frame.center());
            let Some(est) = self.locator.locate(&frame, target) else {
                failures += 1;
                warn!(corrections, failures, "well not detected");
                if failures >= align_cfg.error_budget {
                    return Ok(AlignOutcome::FrameError { failures });
                }
                continue;
            };
            failures = 0;
            self.events.emit(AlignEvent::WellLocated {
                x: est.x,
                y: est.y,
                radius: est.radius,
            });

            if est.dx.abs() < tol_x && est.dy.abs() < tol_y {
                info!(loops = corrections, "aligned");
                self.events.emit(AlignEvent::Aligned { loops: corrections });
                if let Some(trace) = trace.as_mut() {
                    trace.record(current, est.dx, est.dy)?;
                }
                return Ok(AlignOutcome::Aligned {
                    loops: corrections,
                    position: current,
                });
            }

            // Damped gain: later corrections take proportionally smaller
            // steps.
            let damping = f64::from(corrections + 1);
            let dx_mm = est.dx / (damping * align_cfg.gain_x);
            let dy_mm = est.dy / (damping * align_cfg.gain_y);
            debug!(corrections, dx_mm, dy_mm, "issuing correction");
            self.events.emit(AlignEvent::CorrectionIssued {
                loop_index: corrections,
                dx_mm,
                dy_mm,
            });

            current = stage
                .move_to(PlatePosition::new(
                    current.x_mm + dx_mm,
                    current.y_mm + dy_mm,
                ))
                .await?;
            if let Some(trace) = trace.as_mut() {
                trace.record(current, est.dx, est.dy)?;
            }
            corrections += 1;
        }

        warn!(loops = align_cfg.max_loops, "alignment gave up");
        self.events.emit(AlignEvent::GaveUp {
            loops: align_cfg.max_loops,
        });
        Ok(AlignOutcome::NotAligned {
            loops: align_cfg.max_loops,
        })
    }
}
