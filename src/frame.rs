//! Frame buffer and the camera-to-controller handshake.
//!
//! The camera side pushes frames into a [`FrameBus`]; the controller side
//! awaits a frame that is *fresher* than the last one it consumed. The wait
//! is a bounded poll: it re-checks the stop flag once per quantum and gives
//! up with [`PlateposError::FrameTimeout`] when the deadline passes, so a
//! dead camera can never hang an alignment loop.

use crate::error::{PlateposError, Result};
use crate::events::StopFlag;
use chrono::{DateTime, Utc};
use image::GrayImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// A captured grayscale frame. Immutable once published; components that
/// need to modify pixels work on a private copy.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: GrayImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: GrayImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Pixel centre of the frame.
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.width()) / 2.0,
            f64::from(self.height()) / 2.0,
        )
    }
}

#[derive(Clone)]
struct Slot {
    seq: u64,
    frame: Option<Arc<Frame>>,
}

/// Single-producer frame mailbox with freshness tracking.
#[derive(Clone)]
pub struct FrameBus {
    tx: watch::Sender<Slot>,
}

impl FrameBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Slot {
            seq: 0,
            frame: None,
        });
        Self { tx }
    }

    /// Publish a new frame. Called from the camera delivery task; the
    /// controller never pulls the camera directly.
    pub fn publish(&self, frame: Frame) {
        self.tx.send_modify(|slot| {
            slot.seq += 1;
            slot.frame = Some(Arc::new(frame));
        });
    }

    /// Sequence number of the most recently published frame.
    pub fn latest_seq(&self) -> u64 {
        self.tx.borrow().seq
    }

    /// Most recently published frame, if any.
    pub fn latest(&self) -> Option<Arc<Frame>> {
        self.tx.borrow().frame.clone()
    }

    /// Wait for a frame published *after* this call, with a hard deadline.
    ///
    /// Polls in `quantum` steps so a stop request is observed promptly.
    pub async fn await_fresh(
        &self,
        timeout: Duration,
        quantum: Duration,
        stop: &StopFlag,
    ) -> Result<Arc<Frame>> {
        let mut rx = self.tx.subscribe();
        let baseline = rx.borrow().seq;
        let deadline = Instant::now() + timeout;

        loop {
            if stop.is_stopped() {
                return Err(PlateposError::Stopped);
            }
            {
                let slot = rx.borrow_and_update();
                if slot.seq > baseline {
                    if let Some(frame) = slot.frame.clone() {
                        return Ok(frame);
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(PlateposError::FrameTimeout { waited: timeout });
            }
            // Wake on change or quantum expiry, whichever first.
            let _ = tokio::time::timeout(quantum, rx.changed()).await;
        }
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_frame(w: u32, h: u32) -> Frame {
        Frame::new(GrayImage::new(w, h))
    }

    #[tokio::test]
    async fn await_fresh_sees_published_frame() {
        let bus = FrameBus::new();
        let waiter = bus.clone();
        let stop = StopFlag::new();

        let handle = tokio::spawn(async move {
            waiter
                .await_fresh(
                    Duration::from_secs(1),
                    Duration::from_millis(10),
                    &stop,
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish(blank_frame(64, 48));

        let frame = handle.await.unwrap().unwrap();
        assert_eq!(frame.width(), 64);
        assert_eq!(frame.height(), 48);
    }

    #[tokio::test]
    async fn stale_frame_is_not_returned() {
        let bus = FrameBus::new();
        bus.publish(blank_frame(64, 48));

        let stop = StopFlag::new();
        let result = bus
            .await_fresh(
                Duration::from_millis(60),
                Duration::from_millis(10),
                &stop,
            )
            .await;
        assert!(matches!(result, Err(PlateposError::FrameTimeout { .. })));
    }

    #[tokio::test]
    async fn stop_releases_blocked_wait() {
        let bus = FrameBus::new();
        let stop = StopFlag::new();
        let stop_clone = stop.clone();

        let handle = tokio::spawn(async move {
            bus.await_fresh(
                Duration::from_secs(10),
                Duration::from_millis(10),
                &stop_clone,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.request_stop();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PlateposError::Stopped)));
    }
}
