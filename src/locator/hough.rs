//! Gradient-voting circle transform.
//!
//! Two-stage detection: Sobel edge pixels vote along their gradient line
//! (both senses) for every radius in the search window, then each surviving
//! centre candidate gets its radius from the mode of edge-pixel distances.
//! The accumulator is a single centre plane shared across radii, which
//! keeps memory flat regardless of how wide the radius window is.

use image::GrayImage;

/// One detected circle, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub x: f64,
    pub y: f64,
    pub radius: f64,
    /// Centre-accumulator support for this candidate.
    pub votes: u32,
}

/// Search parameters for one detection pass.
#[derive(Debug, Clone, Copy)]
pub struct HoughParams {
    pub min_radius: u32,
    pub max_radius: u32,
    /// Minimum centre-to-centre spacing between reported circles.
    pub min_dist: f64,
    /// Minimum normalized gradient magnitude for a pixel to vote.
    pub edge_threshold: f64,
    /// Minimum centre votes for a candidate to survive.
    pub accumulator_threshold: u32,
}

struct EdgePixel {
    x: u32,
    y: u32,
    /// Unit gradient direction.
    ux: f64,
    uy: f64,
}

/// Detect circles in an enhanced grayscale image.
///
/// Returns candidates in descending vote order after spacing suppression.
/// The caller picks a winner by whatever criterion suits it (the well
/// locator takes the largest radius).
pub fn detect(img: &GrayImage, params: &HoughParams) -> Vec<Circle> {
    let (w, h) = img.dimensions();
    if w < 3 || h < 3 || params.min_radius > params.max_radius {
        return Vec::new();
    }

    let edges = sobel_edges(img, params.edge_threshold);
    if edges.is_empty() {
        return Vec::new();
    }

    // Centre voting: each edge pixel votes along +/- gradient for every
    // radius in the window.
    let mut acc = vec![0u32; (w * h) as usize];
    for e in &edges {
        for r in params.min_radius..=params.max_radius {
            let rf = f64::from(r);
            for sign in [-1.0, 1.0] {
                let cx = (f64::from(e.x) + sign * rf * e.ux).round();
                let cy = (f64::from(e.y) + sign * rf * e.uy).round();
                if cx >= 0.0 && cy >= 0.0 && (cx as u32) < w && (cy as u32) < h {
                    acc[(cy as u32 * w + cx as u32) as usize] += 1;
                }
            }
        }
    }

    // Candidate score is the 3x3 neighbourhood sum: directional
    // quantization spreads a centre's support over adjacent cells, and
    // summing keeps the threshold meaningful across radii.
    let score = |x: u32, y: u32| -> u32 {
        let mut sum = 0u32;
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let nx = (x as i32 + dx) as u32;
                let ny = (y as i32 + dy) as u32;
                sum += acc[(ny * w + nx) as usize];
            }
        }
        sum
    };

    // Local maxima above threshold become centre candidates.
    let mut candidates: Vec<(u32, u32, u32)> = Vec::new();
    for y in 2..h - 2 {
        for x in 2..w - 2 {
            let votes = score(x, y);
            if votes < params.accumulator_threshold {
                continue;
            }
            let mut is_max = true;
            'probe: for dy in -1i32..=1 {
                for dx in -1i32..=1 {
                    if dx == 0 && dy == 0 {
                        continue;
                    }
                    let nx = (x as i32 + dx) as u32;
                    let ny = (y as i32 + dy) as u32;
                    if score(nx, ny) > votes {
                        is_max = false;
                        break 'probe;
                    }
                }
            }
            if is_max {
                candidates.push((x, y, votes));
            }
        }
    }
    candidates.sort_by(|a, b| b.2.cmp(&a.2));

    // Greedy spacing suppression, strongest candidates first.
    let min_dist = params.min_dist.max(1.0);
    let mut kept: Vec<(u32, u32, u32)> = Vec::new();
    for cand in candidates {
        let far_enough = kept.iter().all(|k| {
            let dx = f64::from(cand.0) - f64::from(k.0);
            let dy = f64::from(cand.1) - f64::from(k.1);
            (dx * dx + dy * dy).sqrt() >= min_dist
        });
        if far_enough {
            kept.push(cand);
        }
    }

    // Radius from the mode of edge-pixel distances within the window.
    let mut circles = Vec::with_capacity(kept.len());
    for (cx, cy, votes) in kept {
        if let Some(radius) =
            radius_mode(&edges, cx, cy, params.min_radius, params.max_radius)
        {
            circles.push(Circle {
                x: f64::from(cx),
                y: f64::from(cy),
                radius,
                votes,
            });
        }
    }
    circles
}

/// Sobel gradient pass; pixels whose magnitude (normalized by the kernel
/// weight sum of 4) clears `threshold` become voting edges.
fn sobel_edges(img: &GrayImage, threshold: f64) -> Vec<EdgePixel> {
    let (w, h) = img.dimensions();
    let px = |x: u32, y: u32| -> i32 { i32::from(img.get_pixel(x, y).0[0]) };

    let mut edges = Vec::new();
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = px(x + 1, y - 1) + 2 * px(x + 1, y) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2 * px(x - 1, y)
                - px(x - 1, y + 1);
            let gy = px(x - 1, y + 1) + 2 * px(x, y + 1) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2 * px(x, y - 1)
                - px(x + 1, y - 1);
            let mag = (f64::from(gx * gx + gy * gy)).sqrt();
            if mag / 4.0 >= threshold {
                edges.push(EdgePixel {
                    x,
                    y,
                    ux: f64::from(gx) / mag,
                    uy: f64::from(gy) / mag,
                });
            }
        }
    }
    edges
}

/// Most common integer edge distance from the candidate centre, restricted
/// to the search window. `None` when no edge pixel lands in the window.
fn radius_mode(
    edges: &[EdgePixel],
    cx: u32,
    cy: u32,
    min_radius: u32,
    max_radius: u32,
) -> Option<f64> {
    let mut hist = vec![0u32; (max_radius + 1) as usize];
    for e in edges {
        let dx = f64::from(e.x) - f64::from(cx);
        let dy = f64::from(e.y) - f64::from(cy);
        let d = (dx * dx + dy * dy).sqrt().round() as u32;
        if d >= min_radius && d <= max_radius {
            hist[d as usize] += 1;
        }
    }
    hist.iter()
        .enumerate()
        .skip(min_radius as usize)
        .max_by_key(|(_, count)| **count)
        .filter(|(_, count)| **count > 0)
        .map(|(r, _)| r as f64)
}
