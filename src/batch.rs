//! Batch sequencing: repeated passes over a target list with telemetry.
//!
//! A run owns the stage for its whole duration. Each pass visits every
//! configured well in order (coarse move, fine alignment, snapshot), then
//! the sequencer paces itself so successive passes start one interleave
//! apart. A pass that overruns the interleave is logged and the next one
//! starts immediately. The run ends at the deadline, on an operator stop,
//! or on the first fatal error.
//!
//! Telemetry is one CSV row per pass: the run start time, the row time,
//! then a measured `(x, y)` pair per target. Wells that failed their
//! visit leave their pair empty for that pass.

use crate::align::{AlignOutcome, AlignmentController, FineTuningTrace};
use crate::config::Settings;
use crate::error::{PlateposError, Result};
use crate::events::{BatchEvent, EventBus, StopFlag};
use crate::frame::FrameBus;
use crate::snapshot::SnapshotSink;
use crate::stage::{sleep_checked, StagePositioner};
use crate::wellmap::{PlatePosition, WellMap, WellTarget};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Name of the per-pass telemetry file under the output root.
pub const TELEMETRY_FILE: &str = "batch_positioning_results.csv";
/// Name of the per-iteration alignment trace under the batch directory.
pub const TRACE_FILE: &str = "fine_tuning_trace.csv";

/// Summary of a finished (or aborted) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub passes: u32,
    pub wells_completed: u32,
    pub wells_failed: u32,
    pub stopped: bool,
}

/// Outcome of one well visit within a pass.
enum WellVisit {
    /// Stage position at the end of the visit; `low_confidence` when the
    /// alignment loop gave up before reaching tolerance.
    Recorded {
        position: PlatePosition,
        low_confidence: bool,
    },
    Failed,
}

pub struct BatchSequencer {
    stage: StagePositioner,
    controller: AlignmentController,
    frames: FrameBus,
    snapshots: Arc<dyn SnapshotSink>,
    events: EventBus<BatchEvent>,
    stop: StopFlag,
    settings: Settings,
    map: WellMap,
}

/// CSV header: fixed time columns, then an `(x, y)` pair per target.
fn telemetry_header(targets: &[WellTarget]) -> Vec<String> {
    let mut header = vec!["run_start_time".to_string(), "run_time".to_string()];
    for target in targets {
        header.push(format!("{}_x", target.label));
        header.push(format!("{}_y", target.label));
    }
    header
}

impl BatchSequencer {
    pub fn new(
        stage: StagePositioner,
        controller: AlignmentController,
        frames: FrameBus,
        snapshots: Arc<dyn SnapshotSink>,
        events: EventBus<BatchEvent>,
        stop: StopFlag,
        settings: Settings,
    ) -> Self {
        let map = WellMap::from_geometry(&settings.plate);
        Self {
            stage,
            controller,
            frames,
            snapshots,
            events,
            stop,
            settings,
            map,
        }
    }

    /// Measured well positions accumulated so far.
    pub fn well_map(&self) -> &WellMap {
        &self.map
    }

    /// Run passes until the duration budget, a stop request, or a fatal
    /// error.
    pub async fn run(&mut self) -> Result<BatchReport> {
        let batch = self.settings.batch.clone();
        info!(id = %batch.id, targets = batch.targets.len(), "batch starting");
        self.events.emit(BatchEvent::Started {
            id: batch.id.clone(),
        });

        std::fs::create_dir_all(&batch.output_root)?;
        let mut telemetry =
            csv::Writer::from_path(batch.output_root.join(TELEMETRY_FILE))?;
        telemetry.write_record(telemetry_header(&batch.targets))?;
        telemetry.flush()?;

        let mut trace = if self.settings.alignment.log_fine_tuning {
            Some(FineTuningTrace::create(
                &batch.output_root.join(&batch.id).join(TRACE_FILE),
            )?)
        } else {
            None
        };

        self.stage.home().await?;

        let run_start = Utc::now();
        let deadline = Instant::now() + batch.duration;
        let mut report = BatchReport {
            passes: 0,
            wells_completed: 0,
            wells_failed: 0,
            stopped: false,
        };

        'run: while Instant::now() < deadline {
            if self.stop.is_stopped() {
                report.stopped = true;
                break;
            }
            let pass_started = Instant::now();
            let mut row =
                vec![run_start.to_rfc3339(), Utc::now().to_rfc3339()];

            for target in &batch.targets {
                if self.stop.is_stopped() {
                    report.stopped = true;
                    break;
                }
                match self.visit_well(target, trace.as_mut()).await {
                    Ok(WellVisit::Recorded {
                        position,
                        low_confidence,
                    }) => {
                        row.push(format!("{}", position.x_mm));
                        row.push(format!("{}", position.y_mm));
                        report.wells_completed += 1;
                        self.events.emit(BatchEvent::WellCompleted {
                            label: target.label.clone(),
                            low_confidence,
                        });
                    }
                    Ok(WellVisit::Failed) => {
                        row.push(String::new());
                        row.push(String::new());
                        report.wells_failed += 1;
                    }
                    Err(PlateposError::Stopped) => {
                        report.stopped = true;
                        break;
                    }
                    Err(err) => {
                        error!(label = %target.label, %err, "fatal error, aborting run");
                        telemetry.write_record(&row)?;
                        telemetry.flush()?;
                        return Err(err);
                    }
                }
            }

            telemetry.write_record(&row)?;
            telemetry.flush()?;
            if report.stopped {
                break;
            }

            report.passes += 1;
            let elapsed = pass_started.elapsed();
            self.events.emit(BatchEvent::PassCompleted {
                pass: report.passes,
                elapsed_ms: elapsed.as_millis() as u64,
            });
            info!(pass = report.passes, elapsed = ?elapsed, "pass completed");

            // Pace the next pass one interleave after this one started,
            // but never past the deadline.
            if elapsed >= batch.interleave {
                let overrun = elapsed - batch.interleave;
                warn!(pass = report.passes, overrun = ?overrun, "pass overran the interleave");
                self.events.emit(BatchEvent::InterleaveTooShort {
                    pass: report.passes,
                    overrun_ms: overrun.as_millis() as u64,
                });
            } else {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let wait = (batch.interleave - elapsed).min(deadline - now);
                match sleep_checked(wait, self.settings.stage.poll_quantum, &self.stop)
                    .await
                {
                    Ok(()) => {}
                    Err(PlateposError::Stopped) => {
                        report.stopped = true;
                        break 'run;
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        if report.stopped {
            info!("batch stopped by operator");
            self.events.emit(BatchEvent::Stopped);
        } else {
            info!(passes = report.passes, "batch finished");
            self.events.emit(BatchEvent::Finished {
                passes: report.passes,
            });
        }
        Ok(report)
    }

    /// One well: coarse move, fine alignment, snapshot. Per-well problems
    /// come back as `WellVisit::Failed`; fatal errors propagate.
    async fn visit_well(
        &mut self,
        target: &WellTarget,
        trace: Option<&mut FineTuningTrace>,
    ) -> Result<WellVisit> {
        let Some(nominal) = self.map.position(target.row, target.col) else {
            warn!(
                label = %target.label,
                row = target.row,
                col = target.col,
                "target outside the plate grid"
            );
            self.events.emit(BatchEvent::WellFailed {
                label: target.label.clone(),
                reason: "target outside the plate grid".into(),
            });
            return Ok(WellVisit::Failed);
        };

        self.stage.goto_well(nominal).await?;
        let outcome = self.controller.align(&mut self.stage, trace).await?;

        let visit = match outcome {
            AlignOutcome::Aligned { position, .. } => {
                self.snapshot(&target.label)?;
                self.map
                    .set_measured(target.row, target.col, position);
                WellVisit::Recorded {
                    position,
                    low_confidence: false,
                }
            }
            AlignOutcome::NotAligned { loops } => {
                warn!(label = %target.label, loops, "well recorded off-centre");
                self.snapshot(&target.label)?;
                WellVisit::Recorded {
                    position: self.stage.position().unwrap_or(nominal),
                    low_confidence: true,
                }
            }
            AlignOutcome::FrameError { failures } => {
                // The stage may have wandered somewhere with no visible
                // well; nothing it reports can be trusted until rehomed.
                warn!(label = %target.label, failures, "well skipped after frame errors");
                self.events.emit(BatchEvent::WellFailed {
                    label: target.label.clone(),
                    reason: format!("{failures} consecutive frame errors"),
                });
                self.stage.reset_position();
                WellVisit::Failed
            }
        };

        self.stage.set_light(0.0).await?;
        Ok(visit)
    }

    /// Capture and persist one frame for the well just visited. Snapshot
    /// problems are logged but never end the visit.
    fn snapshot(&self, label: &str) -> Result<()> {
        let slot = self.frames.latest();
        let Some(frame) = slot else {
            warn!(label, "no frame available for snapshot");
            return Ok(());
        };
        if let Err(err) =
            self.snapshots
                .save(&self.settings.batch.id, label, &frame)
        {
            warn!(label, %err, "snapshot failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(row: usize, col: usize, label: &str) -> WellTarget {
        WellTarget {
            row,
            col,
            label: label.into(),
            description: String::new(),
        }
    }

    #[test]
    fn header_has_a_pair_per_target() {
        let targets = vec![target(1, 1, "A1"), target(2, 3, "B3")];
        assert_eq!(
            telemetry_header(&targets),
            vec![
                "run_start_time",
                "run_time",
                "A1_x",
                "A1_y",
                "B3_x",
                "B3_y"
            ]
        );
    }
}
