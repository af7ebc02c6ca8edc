//! # platepos
//!
//! Automated well-plate positioning engine: it drives an XY stage under a
//! fixed camera so that each configured well is centred in the optical
//! path, then records snapshots and positioning telemetry over repeated
//! passes.
//!
//! ## Crate structure
//!
//! - **`config`**: TOML-backed settings, including every empirically tuned
//!   constant (gains, tolerances, settle table, detector thresholds).
//! - **`error`**: the [`error::PlateposError`] taxonomy and its
//!   fatal-versus-per-well recovery policy.
//! - **`events`**: typed broadcast buses plus the [`events::StopFlag`]
//!   cooperative-cancellation primitive every polling loop observes.
//! - **`frame`**: the camera-to-controller mailbox with freshness
//!   tracking and bounded waits.
//! - **`transport`**: the G-code grammar, acknowledgement scanning and
//!   the [`transport::MotionTransport`] boundary (serial implementation
//!   behind the `transport_serial` feature).
//! - **`locator`**: well-centre detection; circle transform first,
//!   contour scoring as the fallback.
//! - **`stage`**: homing, light-source calibration and settled moves.
//! - **`align`**: the damped-gain fine-alignment loop.
//! - **`wellmap`**: the typed plate grid that accumulates measured well
//!   positions.
//! - **`batch`**: the pass sequencer with CSV telemetry and interleave
//!   pacing.
//! - **`snapshot`**: PNG persistence for visited wells.
//! - **`sim`**: a scripted stepper board and synthetic camera for
//!   closed-loop runs without hardware.

pub mod align;
pub mod batch;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod locator;
pub mod sim;
pub mod snapshot;
pub mod stage;
pub mod transport;
pub mod wellmap;

pub use align::{AlignOutcome, AlignmentController};
pub use batch::{BatchReport, BatchSequencer};
pub use config::Settings;
pub use error::{PlateposError, Result};
pub use events::StopFlag;
pub use frame::{Frame, FrameBus};
pub use locator::{TargetLocator, WellLocator};
pub use stage::StagePositioner;
pub use wellmap::{PlatePosition, WellMap, WellTarget};
