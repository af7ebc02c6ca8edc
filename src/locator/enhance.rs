//! Contrast conditioning ahead of circle detection.
//!
//! Frames are min-max normalized to the full 8-bit range and then run
//! through contrast-limited adaptive histogram equalization. The detector
//! thresholds downstream assume this conditioning; without it the Hough
//! stage is at the mercy of the light-source brightness of the day.

use image::GrayImage;

/// Stretch the dynamic range to [0, 255] in place.
pub fn normalize_minmax(img: &mut GrayImage) {
    let mut min = u8::MAX;
    let mut max = u8::MIN;
    for p in img.pixels() {
        min = min.min(p.0[0]);
        max = max.max(p.0[0]);
    }
    if max <= min {
        return;
    }
    let span = f64::from(max) - f64::from(min);
    for p in img.pixels_mut() {
        let v = (f64::from(p.0[0]) - f64::from(min)) * 255.0 / span;
        p.0[0] = v.round().clamp(0.0, 255.0) as u8;
    }
}

/// Contrast-limited adaptive histogram equalization.
///
/// Tiled histogram equalization with clipped histograms and bilinear
/// blending between neighbouring tile mappings. `clip_limit` is the
/// contrast-limiting factor (relative to a uniform histogram); values at
/// or below zero disable clipping.
pub fn clahe(img: &GrayImage, tiles: u32, clip_limit: f64) -> GrayImage {
    let (w, h) = img.dimensions();
    let tiles = tiles.max(1);
    if w < tiles || h < tiles {
        return img.clone();
    }

    let tile_w = w.div_ceil(tiles);
    let tile_h = h.div_ceil(tiles);

    // Per-tile equalization LUTs.
    let mut luts = vec![[0u8; 256]; (tiles * tiles) as usize];
    for ty in 0..tiles {
        for tx in 0..tiles {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);

            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y).0[0] as usize] += 1;
                }
            }
            let area = (x1 - x0) * (y1 - y0);
            if clip_limit > 0.0 {
                clip_histogram(&mut hist, area, clip_limit);
            }

            // Cumulative mapping to the full output range.
            let mut cdf = 0u64;
            let lut = &mut luts[(ty * tiles + tx) as usize];
            for (value, count) in hist.iter().enumerate() {
                cdf += u64::from(*count);
                lut[value] =
                    ((cdf * 255) / u64::from(area).max(1)) as u8;
            }
        }
    }

    // Bilinear interpolation between the four surrounding tile mappings.
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let v = img.get_pixel(x, y).0[0] as usize;

            let fx = (f64::from(x) + 0.5) / f64::from(tile_w) - 0.5;
            let fy = (f64::from(y) + 0.5) / f64::from(tile_h) - 0.5;
            let tx0 = fx.floor().max(0.0) as u32;
            let ty0 = fy.floor().max(0.0) as u32;
            let tx0 = tx0.min(tiles - 1);
            let ty0 = ty0.min(tiles - 1);
            let tx1 = (tx0 + 1).min(tiles - 1);
            let ty1 = (ty0 + 1).min(tiles - 1);
            let wx = (fx - fx.floor()).clamp(0.0, 1.0);
            let wy = (fy - fy.floor()).clamp(0.0, 1.0);

            let v00 = f64::from(luts[(ty0 * tiles + tx0) as usize][v]);
            let v01 = f64::from(luts[(ty0 * tiles + tx1) as usize][v]);
            let v10 = f64::from(luts[(ty1 * tiles + tx0) as usize][v]);
            let v11 = f64::from(luts[(ty1 * tiles + tx1) as usize][v]);

            let top = v00 * (1.0 - wx) + v01 * wx;
            let bottom = v10 * (1.0 - wx) + v11 * wx;
            let blended = top * (1.0 - wy) + bottom * wy;
            out.put_pixel(x, y, image::Luma([blended.round() as u8]));
        }
    }
    out
}

/// Clip the histogram at `clip_limit` times the uniform bin height and
/// redistribute the excess evenly.
fn clip_histogram(hist: &mut [u32; 256], area: u32, clip_limit: f64) {
    let uniform = f64::from(area) / 256.0;
    let clip = (clip_limit * uniform).max(1.0) as u32;

    let mut excess = 0u32;
    for count in hist.iter_mut() {
        if *count > clip {
            excess += *count - clip;
            *count = clip;
        }
    }
    let per_bin = excess / 256;
    let mut remainder = excess % 256;
    for count in hist.iter_mut() {
        *count += per_bin;
        if remainder > 0 {
            *count += 1;
            remainder -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_stretches_to_full_range() {
        let mut img = GrayImage::from_fn(16, 16, |x, _| {
            image::Luma([100 + (x as u8) * 2])
        });
        normalize_minmax(&mut img);
        let values: Vec<u8> = img.pixels().map(|p| p.0[0]).collect();
        assert_eq!(*values.iter().min().unwrap(), 0);
        assert_eq!(*values.iter().max().unwrap(), 255);
    }

    #[test]
    fn normalize_flat_image_is_noop() {
        let mut img = GrayImage::from_pixel(8, 8, image::Luma([77]));
        normalize_minmax(&mut img);
        assert!(img.pixels().all(|p| p.0[0] == 77));
    }

    #[test]
    fn clahe_preserves_dimensions_and_order() {
        let img = GrayImage::from_fn(64, 64, |x, y| {
            image::Luma([((x + y) * 2) as u8])
        });
        let out = clahe(&img, 8, 4.0);
        assert_eq!(out.dimensions(), (64, 64));

        // A dark pixel must not map above a bright pixel in the same tile.
        let dark = out.get_pixel(1, 1).0[0];
        let bright = out.get_pixel(6, 6).0[0];
        assert!(dark <= bright);
    }

    #[test]
    fn clahe_boosts_low_contrast_regions() {
        // Low-contrast blob in an otherwise flat image.
        let img = GrayImage::from_fn(64, 64, |x, y| {
            let inside = (x as i32 - 32).pow(2) + (y as i32 - 32).pow(2) < 100;
            image::Luma([if inside { 130 } else { 120 }])
        });
        let out = clahe(&img, 8, 4.0);
        let inside = out.get_pixel(32, 32).0[0] as i32;
        let outside = out.get_pixel(5, 5).0[0] as i32;
        let raw_contrast = 130 - 120;
        assert!(inside - outside >= raw_contrast);
    }
}
