//! Well-centre detection in camera frames.
//!
//! The primary detector is a gradient-voting circle transform over a
//! contrast-enhanced copy of the frame; when no circle in the current
//! radius window gets enough support, a contour fallback takes over:
//! Otsu threshold, morphological cleanup, then the large blob whose shape
//! scores closest to an ideal disk. Either way the result is the offset
//! of the detected centre from an expected pixel position.
//!
//! The radius window starts wide and is narrowed once calibration has
//! measured the actual well radius, which cuts both false positives and
//! voting cost on later frames.

pub mod contour;
pub mod enhance;
pub mod hough;

use crate::config::{CameraSettings, LocatorSettings};
use crate::frame::Frame;
use parking_lot::RwLock;

/// Where the locator believes the well centre is, relative to the
/// expected position handed to [`WellLocator::locate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetEstimate {
    /// Absolute pixel position of the detected centre.
    pub x: f64,
    pub y: f64,
    /// Offset from the expected position, in pixels.
    pub dx: f64,
    pub dy: f64,
    pub radius: f64,
    pub area: f64,
}

/// Frame-to-centre detection boundary.
///
/// Object-safe so the positioner and alignment loop can be driven by a
/// scripted locator in tests.
pub trait WellLocator: Send + Sync {
    /// Locate the well centre in `frame`. `expected` is the pixel
    /// position the centre should be at when perfectly aligned.
    fn locate(&self, frame: &Frame, expected: (f64, f64)) -> Option<TargetEstimate>;

    /// Narrow (or re-widen) the circle radius search window.
    fn set_radius_window(&self, min_radius: u32, max_radius: u32);
}

/// Production locator: enhancement, circle transform, contour fallback.
pub struct TargetLocator {
    settings: LocatorSettings,
    /// Candidate circle spacing, derived from the sensor height.
    min_dist: f64,
    window: RwLock<(u32, u32)>,
}

impl TargetLocator {
    /// The initial radius window assumes the well fills most of the frame
    /// height: between 70% and 100% of the half-height.
    pub fn new(settings: LocatorSettings, camera: &CameraSettings) -> Self {
        let half_h = camera.height / 2;
        let min_radius = (f64::from(half_h) * 0.7) as u32;
        let min_dist =
            (f64::from(camera.height) / settings.min_dist_divisor).max(1.0);
        Self {
            settings,
            min_dist,
            window: RwLock::new((min_radius, half_h)),
        }
    }

    pub fn radius_window(&self) -> (u32, u32) {
        *self.window.read()
    }

    fn enhanced(&self, frame: &Frame) -> image::GrayImage {
        let mut img = frame.image.clone();
        enhance::normalize_minmax(&mut img);
        enhance::clahe(&img, self.settings.clahe_tiles, self.settings.clahe_clip)
    }

    fn locate_circle(&self, img: &image::GrayImage) -> Option<hough::Circle> {
        let (min_radius, max_radius) = *self.window.read();
        let circles = hough::detect(
            img,
            &hough::HoughParams {
                min_radius,
                max_radius,
                min_dist: self.min_dist,
                edge_threshold: self.settings.edge_threshold,
                accumulator_threshold: self.settings.accumulator_threshold,
            },
        );
        // Several concentric candidates can survive when the well rim is
        // wide; the outermost one tracks the physical well edge. First
        // found wins a radius tie.
        circles.into_iter().fold(None, |best: Option<hough::Circle>, c| {
            match best {
                Some(b) if c.radius <= b.radius => Some(b),
                _ => Some(c),
            }
        })
    }

    /// Contour fallback for frames where the circle transform finds no
    /// supported candidate (blurred edges, partial occlusion).
    fn locate_blob(&self, img: &image::GrayImage) -> Option<contour::Blob> {
        let (w, h) = img.dimensions();
        let threshold = contour::otsu_threshold(img);
        let mut mask = contour::binarize(img, threshold);

        // Close pinholes, then drop speckle. Kernel sizes scale with the
        // sensor so the cleanup strength is resolution-independent.
        let close_kernel = contour::elliptical_kernel(w / 128, h / 128);
        contour::morph_close(&mut mask, w as usize, h as usize, &close_kernel, 2);
        let open_kernel = contour::elliptical_kernel(w / 48, h / 48);
        contour::morph_open(&mut mask, w as usize, h as usize, &open_kernel, 2);

        // Only well-sized regions qualify; anything smaller is debris or
        // an out-of-focus reflection, anything near the frame area is a
        // degenerate threshold of a structureless frame.
        let frame_area = f64::from(w) * f64::from(h);
        let min_area = (f64::from(w) / 3.0) * (f64::from(h) / 3.0);
        let max_area = self.settings.max_area_fraction * frame_area;
        contour::find_blobs(&mask, w as usize, h as usize)
            .into_iter()
            .filter(|b| b.area > min_area && b.area < max_area)
            .min_by(|a, b| a.score().total_cmp(&b.score()))
    }
}

impl WellLocator for TargetLocator {
    fn locate(&self, frame: &Frame, expected: (f64, f64)) -> Option<TargetEstimate> {
        let img = self.enhanced(frame);

        if let Some(circle) = self.locate_circle(&img) {
            return Some(TargetEstimate {
                x: circle.x,
                y: circle.y,
                dx: circle.x - expected.0,
                dy: circle.y - expected.1,
                radius: circle.radius,
                area: std::f64::consts::PI * circle.radius * circle.radius,
            });
        }

        let blob = self.locate_blob(&img)?;
        let (x, y) = blob.centroid;
        Some(TargetEstimate {
            x,
            y,
            dx: x - expected.0,
            dy: y - expected.1,
            radius: blob.radius(),
            area: blob.area,
        })
    }

    fn set_radius_window(&self, min_radius: u32, max_radius: u32) {
        let mut window = self.window.write();
        *window = (min_radius.min(max_radius), max_radius);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GrayImage;

    fn camera(w: u32, h: u32) -> CameraSettings {
        CameraSettings {
            width: w,
            height: h,
        }
    }

    fn disk_frame(w: u32, h: u32, cx: f64, cy: f64, r: f64) -> Frame {
        Frame::new(GrayImage::from_fn(w, h, |x, y| {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            image::Luma([if dx * dx + dy * dy <= r * r { 200 } else { 20 }])
        }))
    }

    #[test]
    fn initial_window_spans_upper_radius_band() {
        let locator = TargetLocator::new(LocatorSettings::default(), &camera(1024, 768));
        assert_eq!(locator.radius_window(), (268, 384));
    }

    #[test]
    fn circle_path_reports_offset_from_expected() {
        let locator = TargetLocator::new(LocatorSettings::default(), &camera(128, 128));
        locator.set_radius_window(20, 40);

        // Disk centre sits 6 px right and 4 px up of the frame centre.
        let frame = disk_frame(128, 128, 70.0, 60.0, 30.0);
        let est = locator
            .locate(&frame, frame.center())
            .expect("disk should be detected");
        assert!((est.dx - 6.0).abs() <= 2.0, "dx: {}", est.dx);
        assert!((est.dy + 4.0).abs() <= 2.0, "dy: {}", est.dy);
        assert!((est.radius - 30.0).abs() <= 2.0, "radius: {}", est.radius);
    }

    #[test]
    fn square_blob_falls_back_to_contour_path() {
        // Straight edges spread circle votes thin, so the transform finds
        // nothing; the contour path still reports the region centroid.
        let frame = Frame::new(GrayImage::from_fn(150, 150, |x, y| {
            let inside = (40..=110).contains(&x) && (46..=116).contains(&y);
            image::Luma([if inside { 200 } else { 20 }])
        }));
        let locator = TargetLocator::new(LocatorSettings::default(), &camera(150, 150));
        locator.set_radius_window(30, 70);

        let est = locator
            .locate(&frame, frame.center())
            .expect("large blob should be detected");
        assert!((est.x - 75.0).abs() <= 2.0, "x: {}", est.x);
        assert!((est.y - 81.0).abs() <= 2.0, "y: {}", est.y);
        assert!(est.area > 70.0 * 70.0 * 0.9);
    }

    #[test]
    fn narrowed_window_rejects_out_of_band_circle() {
        // Frame is large enough that the disk also fails the fallback
        // area filter, so an out-of-band radius means no detection.
        let frame = disk_frame(192, 192, 96.0, 96.0, 30.0);
        let locator = TargetLocator::new(LocatorSettings::default(), &camera(192, 192));

        locator.set_radius_window(25, 35);
        assert!(locator.locate(&frame, frame.center()).is_some());

        locator.set_radius_window(45, 60);
        assert!(locator.locate(&frame, frame.center()).is_none());
    }

    #[test]
    fn blank_frame_yields_none() {
        let frame = Frame::new(GrayImage::from_pixel(128, 128, image::Luma([128])));
        let locator = TargetLocator::new(LocatorSettings::default(), &camera(128, 128));
        locator.set_radius_window(20, 40);
        assert!(locator.locate(&frame, frame.center()).is_none());
    }
}
