//! filters.rs
//! Per-pixel and neighbourhood filters used ahead of edge detection.
//!
//! Border handling:
//! - morphology ignores pixels outside the image (erode never eats the frame
//!   edge, dilate never grows from it)
//! - gaussian reflects about the edge pixel without repeating it (dcb|abcd|cba)

use super::frame::{ColorFrame, GrayFrame};

/// Rec.601 luma.
pub fn to_gray(frame: &ColorFrame) -> GrayFrame {
    let mut out = GrayFrame::new(frame.width, frame.height);
    for (dst, rgb) in out.data.iter_mut().zip(frame.data.chunks_exact(3)) {
        let y = 0.299 * f64::from(rgb[0]) + 0.587 * f64::from(rgb[1]) + 0.114 * f64::from(rgb[2]);
        *dst = y.round().min(255.0) as u8;
    }
    out
}

/// Keep rows `[top·h, bottom·h)`; fractions are clamped to [0, 1].
pub fn crop_rows(frame: &GrayFrame, top: f64, bottom: f64) -> GrayFrame {
    let h = frame.height as f64;
    let start = ((top.max(0.0).min(1.0)) * h) as usize;
    let end = ((bottom.max(0.0).min(1.0)) * h) as usize;
    let end = end.max(start);

    GrayFrame {
        width: frame.width,
        height: end - start,
        data: frame.data[start * frame.width..end * frame.width].to_vec(),
    }
}

fn morph(frame: &GrayFrame, kernel: usize, pick: fn(u8, u8) -> u8, init: u8) -> GrayFrame {
    let r = (kernel.max(1) / 2) as isize;
    let (w, h) = (frame.width as isize, frame.height as isize);
    let mut out = GrayFrame::new(frame.width, frame.height);

    for y in 0..h {
        for x in 0..w {
            let mut acc = init;
            for dy in -r..=r {
                let yy = y + dy;
                if yy < 0 || yy >= h {
                    continue;
                }
                for dx in -r..=r {
                    let xx = x + dx;
                    if xx < 0 || xx >= w {
                        continue;
                    }
                    acc = pick(acc, frame.data[(yy * w + xx) as usize]);
                }
            }
            out.data[(y * w + x) as usize] = acc;
        }
    }
    out
}

/// Minimum over a square `kernel`×`kernel` neighbourhood, applied `iterations` times.
pub fn erode(frame: &GrayFrame, kernel: usize, iterations: usize) -> GrayFrame {
    let mut out = frame.clone();
    for _ in 0..iterations {
        out = morph(&out, kernel, u8::min, u8::MAX);
    }
    out
}

/// Maximum over a square neighbourhood, applied `iterations` times.
pub fn dilate(frame: &GrayFrame, kernel: usize, iterations: usize) -> GrayFrame {
    let mut out = frame.clone();
    for _ in 0..iterations {
        out = morph(&out, kernel, u8::max, u8::MIN);
    }
    out
}

/// Normalised 1-D gaussian taps. A non-positive sigma is derived from the
/// kernel size: 0.3·((k − 1)·0.5 − 1) + 0.8.
pub fn gaussian_kernel(size: usize, sigma: f64) -> Vec<f64> {
    let size = if size % 2 == 0 { size + 1 } else { size.max(1) };
    let sigma = if sigma > 0.0 {
        sigma
    } else {
        0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8
    };
    let half = (size / 2) as f64;
    let mut taps: Vec<f64> = (0..size)
        .map(|i| {
            let x = i as f64 - half;
            (-(x * x) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = taps.iter().sum();
    for t in taps.iter_mut() {
        *t /= sum;
    }
    taps
}

#[inline]
pub(crate) fn reflect101(i: isize, n: isize) -> usize {
    if n == 1 {
        return 0;
    }
    let mut i = i;
    while i < 0 || i >= n {
        i = if i < 0 { -i } else { 2 * (n - 1) - i };
    }
    i as usize
}

/// Separable gaussian blur.
pub fn gaussian_blur(frame: &GrayFrame, size: usize, sigma: f64) -> GrayFrame {
    if frame.is_empty() {
        return frame.clone();
    }
    let taps = gaussian_kernel(size, sigma);
    let r = (taps.len() / 2) as isize;
    let (w, h) = (frame.width, frame.height);

    let mut horizontal = vec![0.0f64; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, tap) in taps.iter().enumerate() {
                let xx = reflect101(x as isize + k as isize - r, w as isize);
                acc += tap * f64::from(frame.data[y * w + xx]);
            }
            horizontal[y * w + x] = acc;
        }
    }

    let mut out = GrayFrame::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, tap) in taps.iter().enumerate() {
                let yy = reflect101(y as isize + k as isize - r, h as isize);
                acc += tap * horizontal[yy * w + x];
            }
            out.data[y * w + x] = acc.round().max(0.0).min(255.0) as u8;
        }
    }
    out
}

/// Pixels strictly above `threshold` become 255, the rest 0.
pub fn threshold_binary(frame: &GrayFrame, threshold: u8) -> GrayFrame {
    GrayFrame {
        width: frame.width,
        height: frame.height,
        data: frame
            .data
            .iter()
            .map(|&v| if v > threshold { 255 } else { 0 })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn luma_weights() {
        let mut c = ColorFrame::new(2, 1);
        c.set_pixel(0, 0, [255, 255, 255]);
        c.set_pixel(1, 0, [255, 0, 0]);
        let g = to_gray(&c);
        assert_eq!(g.get(0, 0), 255);
        assert_eq!(g.get(1, 0), 76);
    }

    #[test]
    fn crop_keeps_middle_half() {
        let mut g = GrayFrame::new(4, 8);
        for y in 0..8 {
            for x in 0..4 {
                g.set(x, y, y as u8);
            }
        }
        let c = crop_rows(&g, 0.25, 0.75);
        assert_eq!((c.width, c.height), (4, 4));
        assert_eq!(c.get(0, 0), 2);
        assert_eq!(c.get(3, 3), 5);
    }

    #[test]
    fn erode_removes_speckle_and_dilate_restores_band() {
        let mut g = GrayFrame::new(30, 20);
        g.set(3, 3, 255);
        for y in 0..20 {
            for x in 10..20 {
                g.set(x, y, 200);
            }
        }
        let opened = dilate(&erode(&g, 5, 2), 5, 2);
        assert_eq!(opened.get(3, 3), 0);
        for x in 10..20 {
            assert_eq!(opened.get(x, 10), 200, "column {}", x);
        }
        assert_eq!(opened.get(9, 10), 0);
        assert_eq!(opened.get(20, 10), 0);
    }

    #[test]
    fn default_sigma_kernel_is_normalised_and_symmetric() {
        let k = gaussian_kernel(5, 0.0);
        assert_eq!(k.len(), 5);
        assert!((k.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((k[0] - k[4]).abs() < 1e-15);
        assert!(k[2] > k[1] && k[1] > k[0]);
    }

    #[test]
    fn blur_preserves_flat_fields() {
        let g = GrayFrame::filled(7, 5, 123);
        assert_eq!(gaussian_blur(&g, 5, 0.0), g);
    }

    #[test]
    fn threshold_is_strict() {
        let g = GrayFrame { width: 3, height: 1, data: vec![100, 101, 255] };
        assert_eq!(threshold_binary(&g, 100).data, vec![0, 255, 255]);
    }
}
