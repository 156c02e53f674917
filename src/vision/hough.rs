//! hough.rs
//! Progressive probabilistic Hough transform.
//!
//! Edge points are visited in random order (seeded, so a given frame always
//! yields the same segments). Each point votes in the (theta, rho)
//! accumulator; when its best bin reaches the vote threshold the detector
//! walks along that line in both directions, tolerating up to `max_line_gap`
//! missing pixels. Walked pixels are removed from further consideration, and
//! for accepted segments their votes are withdrawn.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use super::frame::GrayFrame;
use crate::config::HoughConfig;

const SHIFT: i64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSegment {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl LineSegment {
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    #[inline]
    pub fn min_x(&self) -> i32 {
        self.x1.min(self.x2)
    }

    #[inline]
    pub fn max_x(&self) -> i32 {
        self.x1.max(self.x2)
    }
}

pub fn detect_segments(edges: &GrayFrame, config: &HoughConfig) -> Vec<LineSegment> {
    let (w, h) = (edges.width as i64, edges.height as i64);
    if edges.is_empty() || !(config.rho > 0.0) || !(config.theta > 0.0) {
        return Vec::new();
    }

    let irho = 1.0 / config.rho;
    let numangle = ((std::f64::consts::PI / config.theta).round() as usize).max(1);
    let numrho = ((((w + h) * 2 + 1) as f64 / config.rho).round() as i64).max(1);
    let rho_offset = (numrho - 1) / 2;
    let threshold = config.threshold.max(1) as i32;
    let line_gap = i64::from(config.max_line_gap);
    let line_length = i64::from(config.min_line_length);

    let trig: Vec<(f64, f64)> = (0..numangle)
        .map(|n| {
            let angle = n as f64 * config.theta;
            (angle.cos() * irho, angle.sin() * irho)
        })
        .collect();

    let mut accum = vec![0i32; numangle * numrho as usize];
    let mut mask = vec![false; edges.data.len()];
    let mut points: Vec<(i64, i64)> = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let i = (y * w + x) as usize;
            if edges.data[i] != 0 {
                mask[i] = true;
                points.push((x, y));
            }
        }
    }
    let mut rng = StdRng::seed_from_u64(config.seed);
    points.shuffle(&mut rng);

    let bin = |n: usize, x: i64, y: i64| -> usize {
        let (c, s) = trig[n];
        let r = (x as f64 * c + y as f64 * s).round() as i64 + rho_offset;
        n * numrho as usize + r.clamp(0, numrho - 1) as usize
    };

    let mut segments = Vec::new();

    for &(px, py) in &points {
        if !mask[(py * w + px) as usize] {
            continue;
        }

        let mut max_val = threshold - 1;
        let mut max_n = 0;
        for n in 0..numangle {
            let b = bin(n, px, py);
            accum[b] += 1;
            if max_val < accum[b] {
                max_val = accum[b];
                max_n = n;
            }
        }
        if max_val < threshold {
            continue;
        }

        // walk direction is the line tangent (-sin, cos); step one pixel
        // along the major axis, fixed point on the minor one
        let a = -trig[max_n].1;
        let b = trig[max_n].0;
        let (x0, y0, dx0, dy0, x_major) = if a.abs() > b.abs() {
            let dx0 = if a > 0.0 { 1 } else { -1 };
            let dy0 = (b * (1i64 << SHIFT) as f64 / a.abs()).round() as i64;
            (px, (py << SHIFT) + (1 << (SHIFT - 1)), dx0, dy0, true)
        } else {
            let dy0 = if b > 0.0 { 1 } else { -1 };
            let dx0 = (a * (1i64 << SHIFT) as f64 / b.abs()).round() as i64;
            ((px << SHIFT) + (1 << (SHIFT - 1)), py, dx0, dy0, false)
        };
        let pixel = |x: i64, y: i64| -> (i64, i64) {
            if x_major { (x, y >> SHIFT) } else { (x >> SHIFT, y) }
        };

        let mut line_end = [(px, py); 2];
        for (k, end) in line_end.iter_mut().enumerate() {
            let (dx, dy) = if k == 0 { (dx0, dy0) } else { (-dx0, -dy0) };
            let (mut x, mut y) = (x0, y0);
            let mut gap = 0;
            loop {
                let (j, i) = pixel(x, y);
                if j < 0 || j >= w || i < 0 || i >= h {
                    break;
                }
                if mask[(i * w + j) as usize] {
                    gap = 0;
                    *end = (j, i);
                } else {
                    gap += 1;
                    if gap > line_gap {
                        break;
                    }
                }
                x += dx;
                y += dy;
            }
        }

        let good_line = (line_end[1].0 - line_end[0].0).abs() >= line_length
            || (line_end[1].1 - line_end[0].1).abs() >= line_length;

        for (k, end) in line_end.iter().enumerate() {
            let (dx, dy) = if k == 0 { (dx0, dy0) } else { (-dx0, -dy0) };
            let (mut x, mut y) = (x0, y0);
            loop {
                let (j, i) = pixel(x, y);
                if j < 0 || j >= w || i < 0 || i >= h {
                    break;
                }
                let idx = (i * w + j) as usize;
                if mask[idx] {
                    if good_line {
                        for n in 0..numangle {
                            accum[bin(n, j, i)] -= 1;
                        }
                    }
                    mask[idx] = false;
                }
                if (j, i) == *end {
                    break;
                }
                x += dx;
                y += dy;
            }
        }

        if good_line {
            segments.push(LineSegment::new(
                line_end[0].0 as i32,
                line_end[0].1 as i32,
                line_end[1].0 as i32,
                line_end[1].1 as i32,
            ));
            if segments.len() >= config.max_lines {
                break;
            }
        }
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(width: usize, height: usize, xs: &[usize]) -> GrayFrame {
        let mut g = GrayFrame::new(width, height);
        for &x in xs {
            for y in 0..height {
                g.set(x, y, 255);
            }
        }
        g
    }

    #[test]
    fn finds_two_vertical_edges() {
        let edges = columns(100, 60, &[39, 59]);
        let mut lines = detect_segments(&edges, &HoughConfig::default());
        lines.sort_by_key(|l| l.min_x());

        assert_eq!(lines.len(), 2, "{:?}", lines);
        assert_eq!((lines[0].min_x(), lines[0].max_x()), (39, 39));
        assert_eq!((lines[1].min_x(), lines[1].max_x()), (59, 59));
        for l in &lines {
            assert!((l.y1 - l.y2).abs() >= 30);
        }
    }

    #[test]
    fn short_runs_are_rejected() {
        let edges = columns(50, 20, &[10]);
        assert!(detect_segments(&edges, &HoughConfig::default()).is_empty());
    }

    #[test]
    fn same_seed_same_segments() {
        let mut edges = columns(80, 64, &[20, 50]);
        edges.set(5, 5, 255);
        edges.set(70, 33, 255);
        let cfg = HoughConfig::default();
        assert_eq!(detect_segments(&edges, &cfg), detect_segments(&edges, &cfg));
    }

    #[test]
    fn respects_max_lines() {
        let edges = columns(120, 60, &[10, 40, 70, 100]);
        let cfg = HoughConfig { max_lines: 1, ..HoughConfig::default() };
        assert_eq!(detect_segments(&edges, &cfg).len(), 1);
    }
}
