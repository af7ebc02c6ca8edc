//! Typed event channels and cooperative cancellation.
//!
//! The controller components each publish a small typed event enum instead
//! of sharing one god-object of signals. Buses are constructed explicitly
//! and injected; a component with no subscribers simply drops its events.
//!
//! `StopFlag` is the single cancellation mechanism: every bounded wait in
//! the stack re-checks it once per polling quantum, so an operator stop is
//! observed within roughly one quantum.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Shared stop-request flag checked by all polling loops.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a cooperative stop. Idempotent.
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Re-arm the flag before starting a new run.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Broadcast bus for one component boundary.
///
/// Thin wrapper over `tokio::sync::broadcast` that drops events when nobody
/// listens, matching fire-and-forget signal semantics.
#[derive(Clone, Debug)]
pub struct EventBus<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventBus<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    /// Publish an event, ignoring the no-subscriber case.
    pub fn emit(&self, event: T) {
        let _ = self.tx.send(event);
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Events published by the stage positioner.
#[derive(Clone, Debug)]
pub enum StageEvent {
    HomingStarted,
    HomingConfirmed,
    HomingFailed { reason: String },
    /// Light-source calibration fixed the alignment target.
    TargetLocated { x: f64, y: f64, radius: f64 },
    MoveConfirmed { x_mm: f64, y_mm: f64 },
    /// The stage position is no longer trusted (manual jog or reset).
    PositionInvalidated,
}

/// Events published by the alignment controller.
#[derive(Clone, Debug)]
pub enum AlignEvent {
    /// The locator found the well at this absolute pixel position.
    WellLocated { x: f64, y: f64, radius: f64 },
    CorrectionIssued { loop_index: u32, dx_mm: f64, dy_mm: f64 },
    Aligned { loops: u32 },
    GaveUp { loops: u32 },
}

/// Events published by the batch sequencer.
#[derive(Clone, Debug)]
pub enum BatchEvent {
    Started { id: String },
    WellCompleted { label: String, low_confidence: bool },
    WellFailed { label: String, reason: String },
    PassCompleted { pass: u32, elapsed_ms: u64 },
    InterleaveTooShort { pass: u32, overrun_ms: u64 },
    Finished { passes: u32 },
    Stopped,
}
