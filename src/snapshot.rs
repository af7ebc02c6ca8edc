//! Snapshot persistence for aligned wells.
//!
//! One PNG per well visit, grouped per batch under the output root. The
//! sink is a trait so batch tests can count snapshots without touching
//! the filesystem.

use crate::error::Result;
use crate::frame::Frame;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait SnapshotSink: Send + Sync {
    /// Persist `frame` for the given batch and well label, returning
    /// where it landed.
    fn save(&self, batch_id: &str, label: &str, frame: &Frame) -> Result<PathBuf>;
}

/// Writes `{root}/{batch_id}/{label}_{timestamp}.png`.
pub struct PngSink {
    root: PathBuf,
}

impl PngSink {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl SnapshotSink for PngSink {
    fn save(&self, batch_id: &str, label: &str, frame: &Frame) -> Result<PathBuf> {
        let dir = self.root.join(batch_id);
        std::fs::create_dir_all(&dir)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let path = dir.join(format!("{label}_{timestamp}.png"));
        frame.image.save(&path)?;
        debug!(path = %path.display(), "snapshot saved");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    #[test]
    fn snapshot_lands_under_batch_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PngSink::new(dir.path());
        let frame = Frame::new(GrayImage::new(8, 8));

        let path = sink.save("batch-7", "B3", &frame).unwrap();
        assert!(path.exists());
        assert!(path.starts_with(dir.path().join("batch-7")));

        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("B3_"));
        assert!(name.ends_with(".png"));
    }

    #[test]
    fn repeated_saves_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let sink = PngSink::new(dir.path());
        let frame = Frame::new(GrayImage::new(8, 8));

        let a = sink.save("batch", "A1", &frame).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = sink.save("batch", "A1", &frame).unwrap();
        assert_ne!(a, b);
    }
}
