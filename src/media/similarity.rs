// Structural similarity between grayscale frames
//
// Mean SSIM over non-overlapping square windows. Inputs of different sizes are
// cropped to the common top-left region first. Pure and thread-safe.

use image::GrayImage;

const WINDOW: u32 = 8;
// (k1 * L)^2 and (k2 * L)^2 with L = 255
const C1: f64 = 6.5025;
const C2: f64 = 58.5225;

/// Similarity in practice within [0, 1]; 1 means identical.
pub fn score(previous: &GrayImage, current: &GrayImage) -> f64 {
    let width = previous.width().min(current.width());
    let height = previous.height().min(current.height());

    // Nothing in common to compare
    if width == 0 || height == 0 {
        return 1.0;
    }

    let window = WINDOW.min(width).min(height);
    let mut total = 0.0;
    let mut count = 0u32;

    let mut y = 0;
    while y + window <= height {
        let mut x = 0;
        while x + window <= width {
            total += window_ssim(previous, current, x, y, window);
            count += 1;
            x += window;
        }
        y += window;
    }

    total / count as f64
}

fn window_ssim(a: &GrayImage, b: &GrayImage, x0: u32, y0: u32, size: u32) -> f64 {
    let n = (size * size) as f64;

    let mut sum_a = 0.0;
    let mut sum_b = 0.0;
    for y in y0..y0 + size {
        for x in x0..x0 + size {
            sum_a += a.get_pixel(x, y)[0] as f64;
            sum_b += b.get_pixel(x, y)[0] as f64;
        }
    }
    let mean_a = sum_a / n;
    let mean_b = sum_b / n;

    let mut var_a = 0.0;
    let mut var_b = 0.0;
    let mut cov = 0.0;
    for y in y0..y0 + size {
        for x in x0..x0 + size {
            let da = a.get_pixel(x, y)[0] as f64 - mean_a;
            let db = b.get_pixel(x, y)[0] as f64 - mean_b;
            var_a += da * da;
            var_b += db * db;
            cov += da * db;
        }
    }
    var_a /= n;
    var_b /= n;
    cov /= n;

    ((2.0 * mean_a * mean_b + C1) * (2.0 * cov + C2))
        / ((mean_a * mean_a + mean_b * mean_b + C1) * (var_a + var_b + C2))
}
