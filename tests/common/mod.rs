//! Shared harness: a simulated rig with timing constants shrunk so the
//! full control loop runs in milliseconds.
#![allow(dead_code)]

use platepos::align::AlignmentController;
use platepos::config::{
    AlignmentSettings, BatchSettings, CameraSettings, LocatorSettings, PlateGeometry,
    Settings, SettleSettings, StageSettings,
};
use platepos::events::EventBus;
use platepos::frame::FrameBus;
use platepos::locator::TargetLocator;
use platepos::sim::{spawn_camera, SimOptions, SimPlant, SimTransport};
use platepos::stage::StagePositioner;
use platepos::wellmap::{PlatePosition, WellTarget};
use platepos::{StopFlag, WellLocator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub fn fast_settings(output_root: &Path, targets: Vec<WellTarget>) -> Settings {
    Settings {
        log_level: "info".into(),
        camera: CameraSettings {
            width: 128,
            height: 128,
        },
        plate: PlateGeometry {
            rows: 8,
            columns: 12,
            origin_x_mm: 10.0,
            origin_y_mm: 12.5,
            row_pitch_mm: 9.0,
            col_pitch_mm: 9.0,
        },
        stage: StageSettings {
            ack_timeout: Duration::from_millis(500),
            homing_timeout: Duration::from_millis(500),
            poll_quantum: Duration::from_millis(2),
            settle: SettleSettings {
                table: vec![],
                beyond: Duration::from_millis(1),
                unknown_distance_mm: 50.0,
            },
            light_pwm: 1.0,
        },
        alignment: AlignmentSettings {
            max_loops: 20,
            gain_x: 20.0,
            gain_y: 15.0,
            // 128 px frames leave 2 px of tolerance per axis.
            tolerance_divisor: 64.0,
            error_budget: 3,
            frame_settle: Duration::from_millis(2),
            frame_timeout: Duration::from_millis(500),
            step_round_mm: 0.1,
            log_fine_tuning: false,
        },
        locator: LocatorSettings::default(),
        batch: BatchSettings {
            id: "itest".into(),
            info: String::new(),
            duration: Duration::from_millis(1200),
            interleave: Duration::from_millis(300),
            output_root: output_root.to_path_buf(),
            targets,
        },
    }
}

pub struct SimRig {
    pub transport: Arc<SimTransport>,
    pub frames: FrameBus,
    pub locator: Arc<TargetLocator>,
    pub stop: StopFlag,
    pub camera: tokio::task::JoinHandle<()>,
}

impl SimRig {
    /// The optical scale equals the alignment gains, so a correction of
    /// `offset / gain` lands exactly on the well.
    pub fn start(settings: &Settings, wells: Vec<PlatePosition>, options: SimOptions) -> Self {
        let transport = SimTransport::new(options);
        let frames = FrameBus::new();
        let plant = SimPlant {
            wells,
            px_per_mm_x: settings.alignment.gain_x,
            px_per_mm_y: settings.alignment.gain_y,
            width: settings.camera.width,
            height: settings.camera.height,
            well_radius_px: f64::from(settings.camera.height) * 0.375,
        };
        let camera = spawn_camera(
            plant,
            transport.state_handle(),
            frames.clone(),
            Duration::from_millis(5),
        );
        let locator = Arc::new(TargetLocator::new(
            settings.locator.clone(),
            &settings.camera,
        ));
        Self {
            transport,
            frames,
            locator,
            stop: StopFlag::new(),
            camera,
        }
    }

    pub fn stage(&self, settings: &Settings) -> StagePositioner {
        StagePositioner::new(
            Arc::clone(&self.transport) as Arc<dyn platepos::transport::MotionTransport>,
            Arc::clone(&self.locator) as Arc<dyn WellLocator>,
            self.frames.clone(),
            EventBus::default(),
            self.stop.clone(),
            settings.clone(),
        )
    }

    pub fn controller(&self, settings: &Settings) -> AlignmentController {
        AlignmentController::new(
            Arc::clone(&self.locator) as Arc<dyn WellLocator>,
            self.frames.clone(),
            EventBus::default(),
            self.stop.clone(),
            settings.clone(),
        )
    }
}

impl Drop for SimRig {
    fn drop(&mut self) {
        self.camera.abort();
    }
}

pub fn target(row: usize, col: usize, label: &str) -> WellTarget {
    WellTarget {
        row,
        col,
        label: label.into(),
        description: String::new(),
    }
}
