//! Low-level raster primitives: Gaussian smoothing, Canny edges,
//! binarisation, dilation and connected-component bounding boxes.

use std::collections::VecDeque;

use image::{GrayImage, Luma};

use super::Rect;

/// 5-tap binomial kernel, sigma ~1.1 (matches a 5x5 Gaussian with auto sigma)
const KERNEL: [f32; 5] = [1.0 / 16.0, 4.0 / 16.0, 6.0 / 16.0, 4.0 / 16.0, 1.0 / 16.0];

/// tan(22.5 deg) and tan(67.5 deg) for gradient direction binning
const TAN_22_5: f32 = 0.414_213_57;
const TAN_67_5: f32 = 2.414_213_6;

/// Floating point single-channel buffer
struct Plane {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl Plane {
    fn from_gray(gray: &GrayImage) -> Self {
        Self {
            width: gray.width() as usize,
            height: gray.height() as usize,
            data: gray.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    /// Sample with coordinates clamped to the border
    fn at(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width as isize - 1) as usize;
        let y = y.clamp(0, self.height as isize - 1) as usize;
        self.data[y * self.width + x]
    }

    /// Sample with zero outside the buffer
    fn at_or_zero(&self, x: isize, y: isize) -> f32 {
        if x < 0 || y < 0 || x >= self.width as isize || y >= self.height as isize {
            return 0.0;
        }
        self.data[y as usize * self.width + x as usize]
    }
}

/// Separable 5x5 Gaussian blur with replicated borders
fn gaussian_blur(src: &Plane) -> Plane {
    let (w, h) = (src.width, src.height);
    let mut horizontal = Plane::zeros(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in KERNEL.iter().enumerate() {
                acc += weight * src.at(x as isize + k as isize - 2, y as isize);
            }
            horizontal.data[y * w + x] = acc;
        }
    }

    let mut out = Plane::zeros(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (k, weight) in KERNEL.iter().enumerate() {
                acc += weight * horizontal.at(x as isize, y as isize + k as isize - 2);
            }
            out.data[y * w + x] = acc;
        }
    }
    out
}

/// Canny edge detector: blur, Sobel gradient (L1 magnitude), non-maximum
/// suppression and hysteresis. Edge pixels are 255, everything else 0.
pub fn canny(gray: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = (gray.width() as usize, gray.height() as usize);
    let mut out = GrayImage::new(gray.width(), gray.height());
    if w == 0 || h == 0 {
        return out;
    }

    let smooth = gaussian_blur(&Plane::from_gray(gray));

    let mut magnitude = Plane::zeros(w, h);
    let mut gx = vec![0.0f32; w * h];
    let mut gy = vec![0.0f32; w * h];
    for y in 0..h as isize {
        for x in 0..w as isize {
            let dx = (smooth.at(x + 1, y - 1) + 2.0 * smooth.at(x + 1, y) + smooth.at(x + 1, y + 1))
                - (smooth.at(x - 1, y - 1) + 2.0 * smooth.at(x - 1, y) + smooth.at(x - 1, y + 1));
            let dy = (smooth.at(x - 1, y + 1) + 2.0 * smooth.at(x, y + 1) + smooth.at(x + 1, y + 1))
                - (smooth.at(x - 1, y - 1) + 2.0 * smooth.at(x, y - 1) + smooth.at(x + 1, y - 1));
            let idx = y as usize * w + x as usize;
            gx[idx] = dx;
            gy[idx] = dy;
            magnitude.data[idx] = dx.abs() + dy.abs();
        }
    }

    // 0 = suppressed, 1 = weak, 2 = strong
    let mut class = vec![0u8; w * h];
    let mut queue = VecDeque::new();
    for y in 0..h as isize {
        for x in 0..w as isize {
            let idx = y as usize * w + x as usize;
            let mag = magnitude.data[idx];
            if mag <= low {
                continue;
            }

            let (ax, ay) = (gx[idx].abs(), gy[idx].abs());
            // (prev, next) neighbours across the edge; prev has the smaller index
            let (prev, next) = if ay <= ax * TAN_22_5 {
                (magnitude.at_or_zero(x - 1, y), magnitude.at_or_zero(x + 1, y))
            } else if ay >= ax * TAN_67_5 {
                (magnitude.at_or_zero(x, y - 1), magnitude.at_or_zero(x, y + 1))
            } else if (gx[idx] > 0.0) == (gy[idx] > 0.0) {
                (magnitude.at_or_zero(x - 1, y - 1), magnitude.at_or_zero(x + 1, y + 1))
            } else {
                (magnitude.at_or_zero(x + 1, y - 1), magnitude.at_or_zero(x - 1, y + 1))
            };

            if mag > prev && mag >= next {
                if mag > high {
                    class[idx] = 2;
                    queue.push_back((x as usize, y as usize));
                } else {
                    class[idx] = 1;
                }
            }
        }
    }

    // Hysteresis: grow strong edges through connected weak pixels
    while let Some((x, y)) = queue.pop_front() {
        out.put_pixel(x as u32, y as u32, Luma([255]));
        for (nx, ny) in neighbours(x, y, w, h) {
            let nidx = ny * w + nx;
            if class[nidx] == 1 {
                class[nidx] = 2;
                queue.push_back((nx, ny));
            }
        }
    }

    out
}

/// 8-neighbourhood of a pixel, clipped to the image
fn neighbours(x: usize, y: usize, w: usize, h: usize) -> impl Iterator<Item = (usize, usize)> {
    let x0 = x.saturating_sub(1);
    let y0 = y.saturating_sub(1);
    let x1 = (x + 1).min(w - 1);
    let y1 = (y + 1).min(h - 1);
    (y0..=y1)
        .flat_map(move |ny| (x0..=x1).map(move |nx| (nx, ny)))
        .filter(move |&(nx, ny)| nx != x || ny != y)
}

/// Binary mask of pixels at or above `level`
pub fn threshold(gray: &GrayImage, level: u8) -> GrayImage {
    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = if pixel.0[0] >= level { 255 } else { 0 };
    }
    out
}

/// 3x3 binary dilation; closes one-pixel gaps in edge outlines
pub fn dilate(mask: &GrayImage) -> GrayImage {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let mut out = GrayImage::new(mask.width(), mask.height());
    for (x, y, pixel) in mask.enumerate_pixels() {
        if pixel.0[0] == 0 {
            continue;
        }
        out.put_pixel(x, y, Luma([255]));
        for (nx, ny) in neighbours(x as usize, y as usize, w, h) {
            out.put_pixel(nx as u32, ny as u32, Luma([255]));
        }
    }
    out
}

/// Number of non-zero pixels
pub fn count_nonzero(mask: &GrayImage) -> usize {
    mask.as_raw().iter().filter(|&&v| v != 0).count()
}

/// Bounding boxes of the 8-connected foreground components, in raster order
/// of each component's first pixel
pub fn component_boxes(mask: &GrayImage) -> Vec<Rect> {
    let (w, h) = (mask.width() as usize, mask.height() as usize);
    let raw = mask.as_raw();
    let mut seen = vec![false; w * h];
    let mut boxes = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..w * h {
        if raw[start] == 0 || seen[start] {
            continue;
        }
        seen[start] = true;
        queue.push_back((start % w, start / w));
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (usize::MAX, usize::MAX, 0, 0);

        while let Some((x, y)) = queue.pop_front() {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
            for (nx, ny) in neighbours(x, y, w, h) {
                let nidx = ny * w + nx;
                if raw[nidx] != 0 && !seen[nidx] {
                    seen[nidx] = true;
                    queue.push_back((nx, ny));
                }
            }
        }

        boxes.push(Rect::new(
            min_x as u32,
            min_y as u32,
            (max_x - min_x + 1) as u32,
            (max_y - min_y + 1) as u32,
        ));
    }

    boxes
}

/// Drop every box enclosed by another one, keeping the input order
///
/// Bounding-box containment stands in for contour nesting: an outline drawn
/// inside another outline is not an outer contour.
pub fn outermost(boxes: Vec<Rect>) -> Vec<Rect> {
    let mut by_area: Vec<usize> = (0..boxes.len()).collect();
    by_area.sort_by(|&a, &b| boxes[b].area().cmp(&boxes[a].area()));

    // An enclosing box is never smaller, so checking the kept ones suffices
    let mut kept: Vec<Rect> = Vec::new();
    let mut keep = vec![false; boxes.len()];
    for i in by_area {
        if !kept.iter().any(|outer| outer.encloses(&boxes[i])) {
            keep[i] = true;
            kept.push(boxes[i]);
        }
    }

    boxes
        .into_iter()
        .zip(keep)
        .filter_map(|(rect, keep)| keep.then_some(rect))
        .collect()
}
