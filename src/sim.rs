//! Hardware simulation: a scripted stepper board and a synthetic camera.
//!
//! The simulated transport interprets the same G-code grammar the real
//! board speaks and tracks the commanded stage position. The synthetic
//! camera renders the well nearest the optical axis as a bright disk
//! displaced by the current positioning error, which closes the loop:
//! corrections issued by the alignment controller actually move the disk.
//!
//! With the pixel-per-millimetre scale set equal to the alignment gains,
//! the first correction lands on the well and the loop converges in a
//! couple of iterations; mismatched scales exercise the damped tail.

use crate::error::Result;
use crate::frame::{Frame, FrameBus};
use crate::transport::MotionTransport;
use crate::wellmap::PlatePosition;
use async_trait::async_trait;
use image::GrayImage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Mutable state shared between the transport and the camera.
#[derive(Debug, Clone, Copy)]
pub struct SimState {
    pub x_mm: f64,
    pub y_mm: f64,
    /// Backlight duty cycle last commanded.
    pub light: f64,
    pub homed: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            x_mm: 0.0,
            y_mm: 0.0,
            light: 0.0,
            homed: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimOptions {
    /// Report an endstop fault instead of completing the homing move.
    pub homing_fault: bool,
}

/// In-process stand-in for the stepper board.
pub struct SimTransport {
    options: SimOptions,
    state: Arc<Mutex<SimState>>,
    pending: Mutex<VecDeque<String>>,
    sent: Mutex<Vec<String>>,
}

impl SimTransport {
    pub fn new(options: SimOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            state: Arc::new(Mutex::new(SimState::default())),
            pending: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Handle for the camera (and assertions) to observe stage state.
    pub fn state_handle(&self) -> Arc<Mutex<SimState>> {
        Arc::clone(&self.state)
    }

    /// Every command sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    fn interpret(&self, command: &str) {
        let trimmed = command.trim();
        let mut state = self.state.lock();
        let mut reply = "ok".to_string();

        if trimmed.starts_with("G28") {
            if self.options.homing_fault {
                reply = "Endstop x still triggered after retract".to_string();
            } else {
                state.x_mm = 0.0;
                state.y_mm = 0.0;
                state.homed = true;
            }
        } else if trimmed.starts_with("G0 ") {
            for token in trimmed.split_whitespace() {
                if let Some(v) = token.strip_prefix('X') {
                    if let Ok(v) = v.parse::<f64>() {
                        state.x_mm = v;
                    }
                } else if let Some(v) = token.strip_prefix('Y') {
                    if let Ok(v) = v.parse::<f64>() {
                        state.y_mm = v;
                    }
                }
            }
        } else if trimmed.starts_with("M114") {
            reply = format!("ok C: X:{} Y:{}", state.x_mm, state.y_mm);
        } else if trimmed.starts_with("M112") {
            state.homed = false;
        } else if trimmed.starts_with("SET_PIN") {
            for token in trimmed.split_whitespace() {
                if let Some(v) = token.strip_prefix("VALUE=") {
                    if let Ok(v) = v.parse::<f64>() {
                        state.light = v;
                    }
                }
            }
        }
        drop(state);
        self.pending.lock().push_back(reply);
    }
}

#[async_trait]
impl MotionTransport for SimTransport {
    async fn send(&self, command: &str) -> Result<()> {
        self.sent.lock().push(command.to_string());
        self.interpret(command);
        Ok(())
    }

    async fn read_line(&self) -> Result<Option<String>> {
        Ok(self.pending.lock().pop_front())
    }
}

/// Optical model of the plate under the camera.
#[derive(Debug, Clone)]
pub struct SimPlant {
    pub wells: Vec<PlatePosition>,
    /// Image displacement per millimetre of positioning error.
    pub px_per_mm_x: f64,
    pub px_per_mm_y: f64,
    pub width: u32,
    pub height: u32,
    pub well_radius_px: f64,
}

impl SimPlant {
    /// Render one frame for the given stage state. With the light off the
    /// frame is uniformly dark; otherwise the well nearest the optical
    /// axis appears as a bright disk displaced by the positioning error.
    pub fn render(&self, state: &SimState) -> Frame {
        if state.light <= 0.0 {
            return Frame::new(GrayImage::from_pixel(
                self.width,
                self.height,
                image::Luma([10]),
            ));
        }

        let stage = PlatePosition::new(state.x_mm, state.y_mm);
        let nearest = self
            .wells
            .iter()
            .min_by(|a, b| a.distance_to(&stage).total_cmp(&b.distance_to(&stage)));

        let mut img = GrayImage::from_pixel(self.width, self.height, image::Luma([20]));
        if let Some(well) = nearest {
            let cx = f64::from(self.width) / 2.0
                + (well.x_mm - state.x_mm) * self.px_per_mm_x;
            let cy = f64::from(self.height) / 2.0
                + (well.y_mm - state.y_mm) * self.px_per_mm_y;
            let r2 = self.well_radius_px * self.well_radius_px;
            for y in 0..self.height {
                for x in 0..self.width {
                    let dx = f64::from(x) - cx;
                    let dy = f64::from(y) - cy;
                    if dx * dx + dy * dy <= r2 {
                        img.put_pixel(x, y, image::Luma([200]));
                    }
                }
            }
        }
        Frame::new(img)
    }
}

/// Spawn the synthetic camera delivery task.
pub fn spawn_camera(
    plant: SimPlant,
    state: Arc<Mutex<SimState>>,
    frames: FrameBus,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let snapshot = *state.lock();
            frames.publish(plant.render(&snapshot));
            tokio::time::sleep(interval).await;
        }
    })
}
