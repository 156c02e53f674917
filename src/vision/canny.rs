//! Dual-threshold edge detector.
//!
//! Sobel 3×3 gradients (L1 magnitude), non-maximum suppression quantised to
//! four directions, then hysteresis: pixels above `high` seed edges, pixels
//! above `low` join them when 8-connected to a seed.

use super::filters::reflect101;
use super::frame::GrayFrame;

/// tan(22.5°)
const TAN_22_5: f64 = 0.414_213_562_373_095;
/// tan(67.5°)
const TAN_67_5: f64 = 2.414_213_562_373_095;

const NOT_EDGE: u8 = 0;
const WEAK: u8 = 1;
const STRONG: u8 = 2;

/// Signed Sobel derivatives, row-major.
pub fn sobel(frame: &GrayFrame) -> (Vec<i32>, Vec<i32>) {
    let (w, h) = (frame.width, frame.height);
    let mut gx = vec![0i32; w * h];
    let mut gy = vec![0i32; w * h];
    if frame.is_empty() {
        return (gx, gy);
    }
    let at = |x: isize, y: isize| -> i32 {
        let xx = reflect101(x, w as isize);
        let yy = reflect101(y, h as isize);
        i32::from(frame.data[yy * w + xx])
    };

    for y in 0..h as isize {
        for x in 0..w as isize {
            let dx = (at(x + 1, y - 1) + 2 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x - 1, y) + at(x - 1, y + 1));
            let dy = (at(x - 1, y + 1) + 2 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2 * at(x, y - 1) + at(x + 1, y - 1));
            let i = y as usize * w + x as usize;
            gx[i] = dx;
            gy[i] = dy;
        }
    }
    (gx, gy)
}

pub fn canny(frame: &GrayFrame, low: f64, high: f64) -> GrayFrame {
    let (w, h) = (frame.width, frame.height);
    let mut out = GrayFrame::new(w, h);
    if frame.is_empty() {
        return out;
    }
    let (low, high) = if low > high { (high, low) } else { (low, high) };

    let (gx, gy) = sobel(frame);
    let magnitude: Vec<f64> = gx
        .iter()
        .zip(&gy)
        .map(|(dx, dy)| f64::from(dx.abs() + dy.abs()))
        .collect();
    let mag = |x: isize, y: isize| -> f64 {
        if x < 0 || y < 0 || x >= w as isize || y >= h as isize {
            0.0
        } else {
            magnitude[y as usize * w + x as usize]
        }
    };

    // non-maximum suppression; ties resolve toward the lower/left neighbour
    let mut class = vec![NOT_EDGE; w * h];
    for y in 0..h as isize {
        for x in 0..w as isize {
            let i = y as usize * w + x as usize;
            let m = magnitude[i];
            if m <= low {
                continue;
            }
            let dx = f64::from(gx[i]);
            let dy = f64::from(gy[i]);
            let (ax, ay) = (dx.abs(), dy.abs());

            let (a, b) = if ay <= ax * TAN_22_5 {
                (mag(x - 1, y), mag(x + 1, y))
            } else if ay > ax * TAN_67_5 {
                (mag(x, y - 1), mag(x, y + 1))
            } else if (dx < 0.0) != (dy < 0.0) {
                (mag(x + 1, y - 1), mag(x - 1, y + 1))
            } else {
                (mag(x - 1, y - 1), mag(x + 1, y + 1))
            };

            if m > a && m >= b {
                class[i] = if m > high { STRONG } else { WEAK };
            }
        }
    }

    // hysteresis
    let mut stack: Vec<usize> = class
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == STRONG)
        .map(|(i, _)| i)
        .collect();
    for &i in &stack {
        out.data[i] = 255;
    }
    while let Some(i) = stack.pop() {
        let (x, y) = ((i % w) as isize, (i / w) as isize);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let (nx, ny) = (x + dx, y + dy);
                if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                    continue;
                }
                let j = ny as usize * w + nx as usize;
                if class[j] == WEAK && out.data[j] == 0 {
                    out.data[j] = 255;
                    stack.push(j);
                }
            }
        }
    }
    out
}
