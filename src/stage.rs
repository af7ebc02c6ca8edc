//! Stage positioning: homing, light-source calibration and settled moves.
//!
//! The positioner owns the motion transport. Every command follows the
//! same discipline: send, then poll `read_line` in quantum steps until the
//! firmware acknowledges, with a hard watchdog so a wedged board surfaces
//! as [`PlateposError::MotionTimeout`] instead of a hung task. Homing
//! additionally watches for the endstop fault token.
//!
//! After a successful home the light source is calibrated: one frame is
//! captured at the home position and the detected well position becomes
//! the alignment target for every later well. The measured radius narrows
//! the locator search window at the same time.

use crate::config::Settings;
use crate::error::{PlateposError, Result};
use crate::events::{EventBus, StageEvent, StopFlag};
use crate::frame::FrameBus;
use crate::locator::WellLocator;
use crate::transport::{scan_ack, AckScan, Gcode, MotionTransport};
use crate::wellmap::PlatePosition;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Whether the stage coordinate frame can currently be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    /// Not homed, or a previous operation invalidated the position.
    Unknown,
    Ready,
}

/// Sleep in quantum steps so a stop request interrupts the wait.
pub async fn sleep_checked(
    total: Duration,
    quantum: Duration,
    stop: &StopFlag,
) -> Result<()> {
    let deadline = Instant::now() + total;
    loop {
        if stop.is_stopped() {
            return Err(PlateposError::Stopped);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        tokio::time::sleep(quantum.min(deadline - now)).await;
    }
}

/// Round to the commanded-position granularity, avoiding float noise in
/// the serialized G-code.
fn round_mm(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    ((value / step).round() * step * 1000.0).round() / 1000.0
}

pub struct StagePositioner {
    transport: Arc<dyn MotionTransport>,
    locator: Arc<dyn WellLocator>,
    frames: FrameBus,
    events: EventBus<StageEvent>,
    stop: StopFlag,
    settings: Settings,
    /// Operator acknowledgement escape hatch for a lost "ok".
    manual_confirm: Arc<AtomicBool>,

    state: StageState,
    /// Last confirmed commanded position, rounded.
    position: Option<PlatePosition>,
    /// Pixel position a well centre should occupy when aligned.
    alignment_target: Option<(f64, f64)>,
    /// Well radius measured during calibration, in pixels.
    target_radius: Option<f64>,
}

impl StagePositioner {
    pub fn new(
        transport: Arc<dyn MotionTransport>,
        locator: Arc<dyn WellLocator>,
        frames: FrameBus,
        events: EventBus<StageEvent>,
        stop: StopFlag,
        settings: Settings,
    ) -> Self {
        Self {
            transport,
            locator,
            frames,
            events,
            stop,
            settings,
            manual_confirm: Arc::new(AtomicBool::new(false)),
            state: StageState::Unknown,
            position: None,
            alignment_target: None,
            target_radius: None,
        }
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn position(&self) -> Option<PlatePosition> {
        self.position
    }

    pub fn alignment_target(&self) -> Option<(f64, f64)> {
        self.alignment_target
    }

    pub fn target_radius(&self) -> Option<f64> {
        self.target_radius
    }

    /// Handle the operator can use to confirm a move whose
    /// acknowledgement was lost on the wire.
    pub fn manual_confirm_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.manual_confirm)
    }

    /// Forget the current position. The next motion request homes first.
    pub fn reset_position(&mut self) {
        self.state = StageState::Unknown;
        self.position = None;
        self.events.emit(StageEvent::PositionInvalidated);
    }

    /// Home both axes, then calibrate the light source and alignment
    /// target from a frame captured at the home position.
    pub async fn home(&mut self) -> Result<()> {
        self.state = StageState::Unknown;
        self.position = None;
        self.events.emit(StageEvent::HomingStarted);
        info!("homing stage");

        self.transport.send(&Gcode::home_xy()).await?;
        match self
            .wait_for_ack("G28 X0 Y0", self.settings.stage.homing_timeout)
            .await
        {
            Ok(()) => {}
            Err(err) => {
                let reason = err.to_string();
                self.events.emit(StageEvent::HomingFailed {
                    reason: reason.clone(),
                });
                return match err {
                    PlateposError::MotionTimeout { .. } => {
                        Err(PlateposError::HomingFailed { reason })
                    }
                    other => Err(other),
                };
            }
        }
        self.events.emit(StageEvent::HomingConfirmed);

        self.calibrate().await?;
        self.position = Some(PlatePosition::new(0.0, 0.0));
        self.state = StageState::Ready;
        Ok(())
    }

    /// Locate the well visible at the home position and fix the
    /// alignment target and radius window from it.
    async fn calibrate(&mut self) -> Result<()> {
        self.set_light(self.settings.stage.light_pwm).await?;
        sleep_checked(
            self.settings.alignment.frame_settle,
            self.settings.stage.poll_quantum,
            &self.stop,
        )
        .await?;

        let frame = self
            .frames
            .await_fresh(
                self.settings.alignment.frame_timeout,
                self.settings.stage.poll_quantum,
                &self.stop,
            )
            .await?;

        let center = frame.center();
        let estimate = self.locator.locate(&frame, center);
        self.set_light(0.0).await?;

        let Some(est) = estimate else {
            self.state = StageState::Unknown;
            return Err(PlateposError::CalibrationFailed {
                reason: "no well visible at the home position".into(),
            });
        };

        self.alignment_target = Some((est.x, est.y));
        self.target_radius = Some(est.radius);
        // Later frames only need to search close to the measured radius.
        let max_radius = est.radius.ceil() as u32;
        let min_radius = (est.radius * 0.8) as u32;
        self.locator.set_radius_window(min_radius, max_radius);

        info!(
            x = est.x,
            y = est.y,
            radius = est.radius,
            "light-source calibration fixed alignment target"
        );
        self.events.emit(StageEvent::TargetLocated {
            x: est.x,
            y: est.y,
            radius: est.radius,
        });
        Ok(())
    }

    /// Absolute move with acknowledgement. The commanded position is
    /// rounded to the configured granularity and becomes the trusted
    /// position once the firmware confirms the queue has drained.
    pub async fn move_to(&mut self, target: PlatePosition) -> Result<PlatePosition> {
        let step = self.settings.alignment.step_round_mm;
        let rounded =
            PlatePosition::new(round_mm(target.x_mm, step), round_mm(target.y_mm, step));

        // An unacknowledged move may or may not have reached the firmware
        // queue, so on failure the previous position cannot be trusted.
        if let Err(err) = self.commanded_move(&rounded).await {
            self.reset_position();
            return Err(err);
        }

        self.position = Some(rounded);
        self.events.emit(StageEvent::MoveConfirmed {
            x_mm: rounded.x_mm,
            y_mm: rounded.y_mm,
        });
        debug!(x_mm = rounded.x_mm, y_mm = rounded.y_mm, "move confirmed");
        Ok(rounded)
    }

    /// Move to a well and wait out the mechanical settle delay for the
    /// travelled distance. Homes first when the position is not trusted.
    /// The light source stays on afterwards for imaging.
    pub async fn goto_well(&mut self, target: PlatePosition) -> Result<()> {
        if self.state != StageState::Ready {
            self.home().await?;
        }

        let distance = match self.position {
            Some(pos) => pos.distance_to(&target),
            None => self.settings.stage.settle.unknown_distance_mm,
        };

        self.set_light(self.settings.stage.light_pwm).await?;
        self.move_to(target).await?;

        let delay = self.settings.stage.settle.delay_for(distance);
        debug!(distance_mm = distance, delay = ?delay, "settling");
        sleep_checked(delay, self.settings.stage.poll_quantum, &self.stop).await
    }

    /// Backlight duty cycle. The firmware acks the pin write like any
    /// other command.
    pub async fn set_light(&mut self, duty: f64) -> Result<()> {
        self.transport.send(&Gcode::set_light_pwm(duty)).await?;
        self.wait_for_ack("SET_PIN", self.settings.stage.ack_timeout)
            .await
    }

    async fn commanded_move(&self, target: &PlatePosition) -> Result<()> {
        let goto = Gcode::goto_xy(target.x_mm, target.y_mm);
        self.transport.send(&goto).await?;
        self.wait_for_ack(goto.trim_end(), self.settings.stage.ack_timeout)
            .await?;

        self.transport.send(&Gcode::wait_for_finish()).await?;
        self.wait_for_ack("M400", self.settings.stage.ack_timeout)
            .await
    }

    /// Relative jog for manual nudging. The stage position can no longer
    /// be trusted afterwards; the next visual-servo move homes first.
    pub async fn jog(&mut self, dx_mm: f64, dy_mm: f64) -> Result<()> {
        let result = self.jog_sequence(dx_mm, dy_mm).await;
        self.reset_position();
        result
    }

    async fn jog_sequence(&self, dx_mm: f64, dy_mm: f64) -> Result<()> {
        self.transport.send(&Gcode::relative_mode()).await?;
        self.wait_for_ack("G91", self.settings.stage.ack_timeout)
            .await?;
        self.transport.send(&Gcode::goto_xy(dx_mm, dy_mm)).await?;
        self.wait_for_ack("G0 (jog)", self.settings.stage.ack_timeout)
            .await?;
        self.transport.send(&Gcode::absolute_mode()).await?;
        self.wait_for_ack("G90", self.settings.stage.ack_timeout)
            .await
    }

    /// Kill all motors and request a run stop. The firmware requires a
    /// restart afterwards, so the stage position is forgotten.
    pub async fn emergency_stop(&mut self) -> Result<()> {
        warn!("emergency stop issued");
        self.transport.send(&Gcode::emergency_stop()).await?;
        self.transport.send(&Gcode::firmware_restart()).await?;
        self.stop.request_stop();
        self.reset_position();
        Ok(())
    }

    /// Poll for an acknowledgement with a hard deadline, re-checking the
    /// stop flag and the manual-confirm escape once per quantum.
    async fn wait_for_ack(&self, command: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.stop.is_stopped() {
                return Err(PlateposError::Stopped);
            }
            if self.manual_confirm.swap(false, Ordering::SeqCst) {
                warn!(command, "move confirmed manually by operator");
                return Ok(());
            }

            match self.transport.read_line().await? {
                Some(line) => match scan_ack(&line) {
                    AckScan::Acknowledged => return Ok(()),
                    AckScan::HomingFault => {
                        return Err(PlateposError::HomingFailed { reason: line });
                    }
                    AckScan::None => continue,
                },
                None => {
                    if Instant::now() >= deadline {
                        return Err(PlateposError::MotionTimeout {
                            command: command.to_string(),
                            waited: timeout,
                        });
                    }
                    tokio::time::sleep(self.settings.stage.poll_quantum).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AlignmentSettings, BatchSettings, CameraSettings, LocatorSettings, PlateGeometry,
        StageSettings,
    };
    use crate::frame::Frame;
    use crate::locator::TargetEstimate;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Transport with a scripted response queue.
    struct ScriptedTransport {
        responses: Mutex<VecDeque<String>>,
        sent: Mutex<Vec<String>>,
        /// Push an "ok" automatically for every command sent.
        auto_ack: bool,
    }

    impl ScriptedTransport {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    responses.iter().map(|s| s.to_string()).collect(),
                ),
                sent: Mutex::new(Vec::new()),
                auto_ack: false,
            })
        }

        fn auto_acking() -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(VecDeque::new()),
                sent: Mutex::new(Vec::new()),
                auto_ack: true,
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl MotionTransport for ScriptedTransport {
        async fn send(&self, command: &str) -> Result<()> {
            self.sent.lock().push(command.to_string());
            if self.auto_ack {
                self.responses.lock().push_back("ok".to_string());
            }
            Ok(())
        }

        async fn read_line(&self) -> Result<Option<String>> {
            Ok(self.responses.lock().pop_front())
        }
    }

    /// Locator returning a fixed estimate, recording window updates.
    struct FixedLocator {
        estimate: Option<TargetEstimate>,
        windows: Mutex<Vec<(u32, u32)>>,
    }

    impl FixedLocator {
        fn some(x: f64, y: f64, radius: f64) -> Arc<Self> {
            Arc::new(Self {
                estimate: Some(TargetEstimate {
                    x,
                    y,
                    dx: 0.0,
                    dy: 0.0,
                    radius,
                    area: std::f64::consts::PI * radius * radius,
                }),
                windows: Mutex::new(Vec::new()),
            })
        }

        fn none() -> Arc<Self> {
            Arc::new(Self {
                estimate: None,
                windows: Mutex::new(Vec::new()),
            })
        }
    }

    impl WellLocator for FixedLocator {
        fn locate(&self, _frame: &Frame, expected: (f64, f64)) -> Option<TargetEstimate> {
            self.estimate.map(|mut est| {
                est.dx = est.x - expected.0;
                est.dy = est.y - expected.1;
                est
            })
        }

        fn set_radius_window(&self, min_radius: u32, max_radius: u32) {
            self.windows.lock().push((min_radius, max_radius));
        }
    }

    fn test_settings() -> Settings {
        Settings {
            log_level: "info".into(),
            camera: CameraSettings {
                width: 640,
                height: 480,
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
                ack_timeout: Duration::from_millis(200),
                homing_timeout: Duration::from_millis(200),
                poll_quantum: Duration::from_millis(5),
                settle: Default::default(),
                light_pwm: 1.0,
            },
            alignment: AlignmentSettings {
                frame_settle: Duration::from_millis(5),
                frame_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            locator: LocatorSettings::default(),
            batch: BatchSettings {
                id: "test".into(),
                info: String::new(),
                duration: Duration::from_secs(60),
                interleave: Duration::from_secs(10),
                output_root: "/tmp".into(),
                targets: Vec::new(),
            },
        }
    }

    fn positioner(
        transport: Arc<ScriptedTransport>,
        locator: Arc<FixedLocator>,
        frames: FrameBus,
    ) -> StagePositioner {
        let mut settings = test_settings();
        // Shrink settle delays so tests run fast.
        settings.stage.settle.table = vec![];
        settings.stage.settle.beyond = Duration::from_millis(1);
        StagePositioner::new(
            transport,
            locator,
            frames,
            EventBus::default(),
            StopFlag::new(),
            settings,
        )
    }

    fn publish_blank(frames: &FrameBus) {
        frames.publish(Frame::new(image::GrayImage::new(64, 48)));
    }

    #[tokio::test]
    async fn home_calibrates_and_narrows_radius_window() {
        let transport = ScriptedTransport::auto_acking();
        let locator = FixedLocator::some(330.0, 236.0, 100.0);
        let frames = FrameBus::new();
        let mut stage = positioner(Arc::clone(&transport), Arc::clone(&locator), frames.clone());

        let feeder = frames.clone();
        let task = tokio::spawn(async move {
            loop {
                publish_blank(&feeder);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        stage.home().await.unwrap();
        task.abort();

        assert_eq!(stage.state(), StageState::Ready);
        assert_eq!(stage.position(), Some(PlatePosition::new(0.0, 0.0)));
        assert_eq!(stage.alignment_target(), Some((330.0, 236.0)));
        assert_eq!(locator.windows.lock().as_slice(), &[(80, 100)]);

        let sent = transport.sent();
        assert_eq!(sent[0], "G28 X0 Y0\r\n");
        assert!(sent.iter().any(|c| c.starts_with("SET_PIN PIN=light")));
    }

    #[tokio::test]
    async fn endstop_fault_fails_homing() {
        let transport =
            ScriptedTransport::new(&["Endstop x still triggered after retract"]);
        let locator = FixedLocator::none();
        let mut stage = positioner(transport, locator, FrameBus::new());

        let err = stage.home().await.unwrap_err();
        assert!(matches!(err, PlateposError::HomingFailed { .. }));
        assert_eq!(stage.state(), StageState::Unknown);
        assert_eq!(stage.position(), None);
    }

    #[tokio::test]
    async fn blank_camera_fails_calibration() {
        let transport = ScriptedTransport::auto_acking();
        let locator = FixedLocator::none();
        let frames = FrameBus::new();
        let mut stage = positioner(transport, locator, frames.clone());

        let feeder = frames.clone();
        let task = tokio::spawn(async move {
            loop {
                publish_blank(&feeder);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        let err = stage.home().await.unwrap_err();
        task.abort();
        assert!(matches!(err, PlateposError::CalibrationFailed { .. }));
        assert!(err.is_fatal_for_run());
        assert_eq!(stage.state(), StageState::Unknown);
    }

    #[tokio::test]
    async fn silent_transport_times_out_and_invalidates_position() {
        let transport = ScriptedTransport::new(&[]);
        let locator = FixedLocator::none();
        let mut stage = positioner(transport, locator, FrameBus::new());
        stage.position = Some(PlatePosition::new(10.0, 10.0));
        stage.state = StageState::Ready;

        let err = stage
            .move_to(PlatePosition::new(20.0, 10.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PlateposError::MotionTimeout { .. }));
        // The G0 went out without an ack, so the old position is no
        // longer a trustworthy visual-servo reference.
        assert_eq!(stage.state(), StageState::Unknown);
        assert_eq!(stage.position(), None);
    }

    #[tokio::test]
    async fn manual_confirm_releases_lost_ack() {
        let transport = ScriptedTransport::new(&[]);
        let locator = FixedLocator::none();
        let mut stage = positioner(Arc::clone(&transport), locator, FrameBus::new());
        let confirm = stage.manual_confirm_handle();

        // Both the move and the queue drain need confirming; hold the
        // button down for a while.
        let presser = tokio::spawn(async move {
            for _ in 0..20 {
                confirm.store(true, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        });

        stage.move_to(PlatePosition::new(5.0, 5.0)).await.unwrap();
        presser.await.unwrap();
        assert_eq!(stage.position(), Some(PlatePosition::new(5.0, 5.0)));
    }

    #[tokio::test]
    async fn commanded_positions_are_rounded() {
        let transport = ScriptedTransport::auto_acking();
        let locator = FixedLocator::none();
        let mut stage = positioner(Arc::clone(&transport), locator, FrameBus::new());

        let confirmed = stage
            .move_to(PlatePosition::new(10.07, 5.54))
            .await
            .unwrap();
        assert_eq!(confirmed, PlatePosition::new(10.1, 5.5));
        assert!(transport
            .sent()
            .iter()
            .any(|c| c == "G0 X10.1 Y5.5\r\n"));
    }

    #[tokio::test]
    async fn jog_moves_relatively_and_invalidates_position() {
        let transport = ScriptedTransport::auto_acking();
        let locator = FixedLocator::none();
        let mut stage = positioner(Arc::clone(&transport), locator, FrameBus::new());
        stage.position = Some(PlatePosition::new(10.0, 10.0));
        stage.state = StageState::Ready;

        stage.jog(0.5, -0.5).await.unwrap();

        assert_eq!(
            transport.sent(),
            vec!["G91\r\n", "G0 X0.5 Y-0.5\r\n", "G90\r\n"]
        );
        assert_eq!(stage.state(), StageState::Unknown);
        assert_eq!(stage.position(), None);
    }

    #[tokio::test]
    async fn emergency_stop_requests_run_stop() {
        let transport = ScriptedTransport::auto_acking();
        let locator = FixedLocator::none();
        let mut stage = positioner(Arc::clone(&transport), locator, FrameBus::new());

        stage.emergency_stop().await.unwrap();

        assert_eq!(transport.sent(), vec!["M112\r\n", "FIRMWARE_RESTART\r\n"]);
        assert_eq!(stage.state(), StageState::Unknown);
        assert!(stage.stop.is_stopped());
    }

    #[test]
    fn rounding_granularity() {
        assert_eq!(round_mm(10.07, 0.1), 10.1);
        assert_eq!(round_mm(10.04, 0.1), 10.0);
        assert_eq!(round_mm(-3.26, 0.1), -3.3);
        // Disabled rounding passes values through.
        assert_eq!(round_mm(1.2345, 0.0), 1.2345);
    }
}
