//! Contour/eccentricity fallback for the well detector.
//!
//! Used when the Hough stage finds no circle, typically because the well
//! is still far from the target or the contrast is poor. The frame is
//! binarized with Otsu's threshold, cleaned up with elliptical
//! close/open morphology, and the remaining blobs are scored by
//! `(1 - roundness + eccentricity) / 2` — lower is better, a clean disk
//! scores near zero.

use image::GrayImage;

/// A connected foreground region with the shape features the scorer needs.
#[derive(Debug, Clone)]
pub struct Blob {
    /// Pixel count.
    pub area: f64,
    /// Boundary length with diagonal steps weighted sqrt(2).
    pub perimeter: f64,
    /// Centroid from raw moments.
    pub centroid: (f64, f64),
    nu20: f64,
    nu02: f64,
    nu11: f64,
}

impl Blob {
    /// `4π·area / perimeter²`; 1.0 for an ideal disk.
    pub fn roundness(&self) -> f64 {
        if self.perimeter <= 0.0 {
            return 0.0;
        }
        4.0 * std::f64::consts::PI * self.area / (self.perimeter * self.perimeter)
    }

    /// Moment-based eccentricity; 0 for a disk, grows with elongation.
    pub fn eccentricity(&self) -> f64 {
        let denom = self.nu20 + self.nu02;
        if denom.abs() < f64::EPSILON {
            return 0.0;
        }
        let num = (self.nu20 - self.nu02).powi(2) + 4.0 * self.nu11 * self.nu11;
        num / (denom * denom)
    }

    /// Combined shape score, lower is better.
    pub fn score(&self) -> f64 {
        (1.0 - self.roundness() + self.eccentricity()) / 2.0
    }

    /// Disk-equivalent radius.
    pub fn radius(&self) -> f64 {
        (self.area / std::f64::consts::PI).sqrt()
    }
}

/// Otsu's threshold: the split maximizing between-class variance.
pub fn otsu_threshold(img: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for p in img.pixels() {
        hist[p.0[0] as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return 0;
    }
    let sum_all: f64 = hist
        .iter()
        .enumerate()
        .map(|(v, c)| v as f64 * *c as f64)
        .sum();

    let mut best_t = 0u8;
    let mut best_var = -1.0f64;
    let mut w_bg = 0.0f64;
    let mut sum_bg = 0.0f64;
    for t in 0..256usize {
        w_bg += hist[t] as f64;
        if w_bg == 0.0 {
            continue;
        }
        let w_fg = total as f64 - w_bg;
        if w_fg == 0.0 {
            break;
        }
        sum_bg += t as f64 * hist[t] as f64;
        let mean_bg = sum_bg / w_bg;
        let mean_fg = (sum_all - sum_bg) / w_fg;
        let var = w_bg * w_fg * (mean_bg - mean_fg).powi(2);
        if var > best_var {
            best_var = var;
            best_t = t as u8;
        }
    }
    best_t
}

/// Binary mask: true where `img > threshold`.
pub fn binarize(img: &GrayImage, threshold: u8) -> Vec<bool> {
    img.pixels().map(|p| p.0[0] > threshold).collect()
}

/// Offsets of an axis-aligned elliptical structuring element with the
/// given half-axes (minimum 1 pixel each).
pub fn elliptical_kernel(half_w: u32, half_h: u32) -> Vec<(i32, i32)> {
    let a = half_w.max(1) as f64;
    let b = half_h.max(1) as f64;
    let mut offsets = Vec::new();
    for dy in -(b as i32)..=(b as i32) {
        for dx in -(a as i32)..=(a as i32) {
            let nx = f64::from(dx) / a;
            let ny = f64::from(dy) / b;
            if nx * nx + ny * ny <= 1.0 {
                offsets.push((dx, dy));
            }
        }
    }
    offsets
}

fn dilate(mask: &[bool], w: usize, h: usize, kernel: &[(i32, i32)]) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for y in 0..h {
        for x in 0..w {
            if !mask[y * w + x] {
                continue;
            }
            for &(dx, dy) in kernel {
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if nx >= 0 && ny >= 0 && (nx as usize) < w && (ny as usize) < h {
                    out[ny as usize * w + nx as usize] = true;
                }
            }
        }
    }
    out
}

fn erode(mask: &[bool], w: usize, h: usize, kernel: &[(i32, i32)]) -> Vec<bool> {
    let mut out = vec![false; mask.len()];
    for y in 0..h {
        'pixel: for x in 0..w {
            if !mask[y * w + x] {
                continue;
            }
            for &(dx, dy) in kernel {
                let nx = x as i32 + dx;
                let ny = y as i32 + dy;
                if nx < 0 || ny < 0 || nx as usize >= w || ny as usize >= h {
                    continue 'pixel;
                }
                if !mask[ny as usize * w + nx as usize] {
                    continue 'pixel;
                }
            }
            out[y * w + x] = true;
        }
    }
    out
}

/// Morphological close (fill holes) for `iterations` rounds.
pub fn morph_close(
    mask: &mut Vec<bool>,
    w: usize,
    h: usize,
    kernel: &[(i32, i32)],
    iterations: u32,
) {
    for _ in 0..iterations {
        *mask = dilate(mask, w, h, kernel);
    }
    for _ in 0..iterations {
        *mask = erode(mask, w, h, kernel);
    }
}

/// Morphological open (drop speckle) for `iterations` rounds.
pub fn morph_open(
    mask: &mut Vec<bool>,
    w: usize,
    h: usize,
    kernel: &[(i32, i32)],
    iterations: u32,
) {
    for _ in 0..iterations {
        *mask = erode(mask, w, h, kernel);
    }
    for _ in 0..iterations {
        *mask = dilate(mask, w, h, kernel);
    }
}

/// Label 8-connected foreground components and compute their shape
/// features. Components touching nothing are still returned; the caller
/// applies the area filter.
pub fn find_blobs(mask: &[bool], w: usize, h: usize) -> Vec<Blob> {
    let mut labels = vec![0u32; mask.len()];
    let mut blobs = Vec::new();
    let mut next_label = 1u32;
    let mut stack = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || labels[start] != 0 {
            continue;
        }
        let label = next_label;
        next_label += 1;

        // Flood fill collecting raw and central moment accumulators.
        let mut count = 0u64;
        let mut sum_x = 0.0f64;
        let mut sum_y = 0.0f64;
        let mut pixels = Vec::new();
        stack.push(start);
        labels[start] = label;
        while let Some(idx) = stack.pop() {
            let x = idx % w;
            let y = idx / w;
            count += 1;
            sum_x += x as f64;
            sum_y += y as f64;
            pixels.push((x, y));
            for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = x as i32 + dx;
                    let ny = y as i32 + dy;
                    if nx < 0 || ny < 0 || nx as usize >= w || ny as usize >= h {
                        continue;
                    }
                    let nidx = ny as usize * w + nx as usize;
                    if mask[nidx] && labels[nidx] == 0 {
                        labels[nidx] = label;
                        stack.push(nidx);
                    }
                }
            }
        }

        let area = count as f64;
        let cx = sum_x / area;
        let cy = sum_y / area;
        let mut mu20 = 0.0f64;
        let mut mu02 = 0.0f64;
        let mut mu11 = 0.0f64;
        for &(x, y) in &pixels {
            let dx = x as f64 - cx;
            let dy = y as f64 - cy;
            mu20 += dx * dx;
            mu02 += dy * dy;
            mu11 += dx * dy;
        }
        let norm = area * area; // mu_pq / m00^(1 + (p+q)/2), p+q = 2
        blobs.push(Blob {
            area,
            perimeter: boundary_length(&pixels, mask, w, h),
            centroid: (cx, cy),
            nu20: mu20 / norm,
            nu02: mu02 / norm,
            nu11: mu11 / norm,
        });
    }
    blobs
}

/// Clockwise 8-neighbourhood starting east.
const TRACE_DIRS: [(i32, i32); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// External contour length by Moore-neighbour tracing: unit steps for
/// 4-moves, sqrt(2) for diagonal moves. Close to the polygonal arc
/// length of the boundary for blob-sized regions.
fn boundary_length(pixels: &[(usize, usize)], mask: &[bool], w: usize, h: usize) -> f64 {
    let is_set = |x: i32, y: i32| -> bool {
        x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h && mask[y as usize * w + x as usize]
    };

    // Topmost-leftmost pixel of the component; its west neighbour is
    // guaranteed background, which anchors the first search direction.
    let Some(&start) = pixels
        .iter()
        .min_by_key(|&&(x, y)| (y, x))
    else {
        return 0.0;
    };
    let start = (start.0 as i32, start.1 as i32);

    let mut length = 0.0;
    let mut current = start;
    // Entered the start pixel heading east (coming from the west).
    let mut entry_dir = 0usize;
    let max_steps = 4 * pixels.len() + 8;

    for step in 0..max_steps {
        // Sweep clockwise beginning two positions counter-clockwise of
        // the direction we entered on.
        let mut found = None;
        for i in 0..8 {
            let dir = (entry_dir + 6 + i) % 8;
            let (dx, dy) = TRACE_DIRS[dir];
            if is_set(current.0 + dx, current.1 + dy) {
                found = Some(dir);
                break;
            }
        }
        let Some(dir) = found else {
            // Isolated pixel.
            return 4.0;
        };
        let (dx, dy) = TRACE_DIRS[dir];
        current = (current.0 + dx, current.1 + dy);
        length += if dx != 0 && dy != 0 {
            std::f64::consts::SQRT_2
        } else {
            1.0
        };
        entry_dir = dir;
        if current == start && step > 0 {
            break;
        }
    }
    length
}
