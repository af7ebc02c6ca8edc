//! Motion-command transport and the G-code vocabulary.
//!
//! The stage controller speaks a small fixed grammar to a PrintHAT-style
//! stepper board: home, absolute XY move, wait-for-finish, position query,
//! light PWM, emergency stop. The transport itself is asynchronous; the
//! only contract is "send a command string, then poll `read_line` until an
//! acknowledgement token shows up". Token detection lives here so the
//! positioner never string-matches raw firmware output itself.

use crate::error::Result;
use async_trait::async_trait;

/// Firmware acknowledgement for a completed command.
pub const ACK_TOKEN: &str = "ok";
/// Firmware report of a hard stop during homing (endstop still triggered).
pub const HOMING_FAULT_TOKEN: &str = "still triggered";

/// Outcome of scanning one response line for acknowledgement tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckScan {
    /// Nothing relevant on this line.
    None,
    Acknowledged,
    HomingFault,
}

/// Scan a raw response line for the acknowledgement vocabulary.
///
/// The fault token wins when both appear on one line; firmware emits it
/// alongside an "ok" when homing is aborted by the endstop.
pub fn scan_ack(line: &str) -> AckScan {
    if line.contains(HOMING_FAULT_TOKEN) {
        AckScan::HomingFault
    } else if line.contains(ACK_TOKEN) {
        AckScan::Acknowledged
    } else {
        AckScan::None
    }
}

/// G-code command builders for the motion grammar.
pub struct Gcode;

impl Gcode {
    /// Home both axes against their endstops.
    pub fn home_xy() -> String {
        "G28 X0 Y0\r\n".to_string()
    }

    /// Absolute move, millimetres from the home position.
    pub fn goto_xy(x_mm: f64, y_mm: f64) -> String {
        format!("G0 X{x_mm} Y{y_mm}\r\n")
    }

    /// Block the firmware queue until motion has finished; the "ok" for
    /// this command doubles as the motion-complete acknowledgement.
    pub fn wait_for_finish() -> String {
        "M400\r\n".to_string()
    }

    pub fn get_position() -> String {
        "M114\r\n".to_string()
    }

    /// Switch the firmware to relative positioning (for jogs).
    pub fn relative_mode() -> String {
        "G91\r\n".to_string()
    }

    pub fn absolute_mode() -> String {
        "G90\r\n".to_string()
    }

    /// Stop all motors and shut the controller down. Requires a firmware
    /// restart afterwards.
    pub fn emergency_stop() -> String {
        "M112\r\n".to_string()
    }

    pub fn firmware_restart() -> String {
        "FIRMWARE_RESTART\r\n".to_string()
    }

    /// Backlight duty cycle, 0.0..=1.0.
    pub fn set_light_pwm(duty: f64) -> String {
        format!("SET_PIN PIN=light VALUE={duty}\r\n")
    }
}

/// Asynchronous command transport to the motion controller.
///
/// `read_line` is a poll: it returns `Ok(None)` when no complete response
/// line is available yet. Callers own the bounded-wait loop (and its
/// watchdog); the transport never blocks indefinitely on their behalf.
#[async_trait]
pub trait MotionTransport: Send + Sync {
    async fn send(&self, command: &str) -> Result<()>;

    async fn read_line(&self) -> Result<Option<String>>;
}

/// Serial implementation for the real stepper board.
#[cfg(feature = "transport_serial")]
pub mod serial {
    use super::MotionTransport;
    use crate::error::{PlateposError, Result};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::Mutex;
    use tokio_serial::{SerialPortBuilderExt, SerialStream};

    /// Line-oriented serial transport over a pseudo-terminal or USB port.
    pub struct SerialTransport {
        port: Mutex<SerialStream>,
        /// Complete lines decoded but not yet handed out.
        lines: Mutex<VecDeque<String>>,
        /// Partial line carried between reads.
        partial: Mutex<String>,
    }

    impl SerialTransport {
        /// Open `path` (e.g. `/tmp/printer`, `/dev/ttyUSB0`) at `baud`.
        pub fn open(path: &str, baud: u32) -> Result<Self> {
            let port = tokio_serial::new(path, baud)
                .open_native_async()
                .map_err(|e| {
                    PlateposError::Transport(format!("open {path}: {e}"))
                })?;
            Ok(Self {
                port: Mutex::new(port),
                lines: Mutex::new(VecDeque::new()),
                partial: Mutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl MotionTransport for SerialTransport {
        async fn send(&self, command: &str) -> Result<()> {
            let mut port = self.port.lock().await;
            port.write_all(command.as_bytes())
                .await
                .map_err(|e| PlateposError::Transport(format!("write: {e}")))?;
            Ok(())
        }

        async fn read_line(&self) -> Result<Option<String>> {
            {
                let mut lines = self.lines.lock().await;
                if let Some(line) = lines.pop_front() {
                    return Ok(Some(line));
                }
            }

            let mut buf = [0u8; 256];
            let n = {
                let mut port = self.port.lock().await;
                match tokio::time::timeout(
                    std::time::Duration::from_millis(5),
                    port.read(&mut buf),
                )
                .await
                {
                    // No bytes pending within the poll window.
                    Err(_) => return Ok(None),
                    Ok(Ok(0)) => {
                        return Err(PlateposError::Transport(
                            "serial port closed".into(),
                        ));
                    }
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => {
                        return Err(PlateposError::Transport(format!(
                            "read: {e}"
                        )));
                    }
                }
            };

            let chunk = String::from_utf8_lossy(&buf[..n]);
            let mut partial = self.partial.lock().await;
            let mut lines = self.lines.lock().await;
            for ch in chunk.chars() {
                if ch == '\n' {
                    let line = partial.trim_end_matches('\r').to_string();
                    lines.push_back(line);
                    partial.clear();
                } else {
                    partial.push(ch);
                }
            }
            Ok(lines.pop_front())
        }
    }
}
