//! Normalised cross-correlation template search.

use image::GrayImage;

/// Summed-area table over pixel values and squared values
struct Integral {
    width: usize,
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sum_sq = vec![0u64; stride * (h + 1)];
        let raw = img.as_raw();
        for y in 0..h {
            let (mut row, mut row_sq) = (0u64, 0u64);
            for x in 0..w {
                let v = raw[y * w + x] as u64;
                row += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row;
                sum_sq[(y + 1) * stride + x + 1] = sum_sq[y * stride + x + 1] + row_sq;
            }
        }
        Self { width: stride, sum, sum_sq }
    }

    fn window(&self, table: &[u64], x: usize, y: usize, w: usize, h: usize) -> u64 {
        let s = self.width;
        table[(y + h) * s + x + w] + table[y * s + x] - table[y * s + x + w] - table[(y + h) * s + x]
    }
}

/// Best match of `template` inside `image`
///
/// Returns the top-left corner of the best window and its correlation
/// coefficient in `[-1, 1]`. Flat windows (zero variance) score 0. The first
/// window in raster order wins ties.
pub fn best_match(image: &GrayImage, template: &GrayImage) -> Option<(u32, u32, f64)> {
    let (iw, ih) = (image.width() as usize, image.height() as usize);
    let (tw, th) = (template.width() as usize, template.height() as usize);
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }

    let n = (tw * th) as f64;
    let t_raw = template.as_raw();
    let t_sum: u64 = t_raw.iter().map(|&v| v as u64).sum();
    let t_sum_sq: u64 = t_raw.iter().map(|&v| (v as u64) * (v as u64)).sum();
    let t_var = t_sum_sq as f64 - (t_sum as f64) * (t_sum as f64) / n;
    if t_var <= 0.0 {
        return None;
    }

    let integral = Integral::new(image);
    let i_raw = image.as_raw();
    let mut best: Option<(u32, u32, f64)> = None;

    for y in 0..=ih - th {
        for x in 0..=iw - tw {
            let w_sum = integral.window(&integral.sum, x, y, tw, th);
            let w_sum_sq = integral.window(&integral.sum_sq, x, y, tw, th);
            let w_var = w_sum_sq as f64 - (w_sum as f64) * (w_sum as f64) / n;

            let score = if w_var <= 0.0 {
                0.0
            } else {
                let mut cross = 0u64;
                for ty in 0..th {
                    let irow = &i_raw[(y + ty) * iw + x..(y + ty) * iw + x + tw];
                    let trow = &t_raw[ty * tw..(ty + 1) * tw];
                    cross += irow.iter().zip(trow).map(|(&a, &b)| a as u64 * b as u64).sum::<u64>();
                }
                let cov = cross as f64 - (w_sum as f64) * (t_sum as f64) / n;
                cov / (w_var * t_var).sqrt()
            };

            if best.map(|(_, _, s)| score > s).unwrap_or(true) {
                best = Some((x as u32, y as u32, score));
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_best_match_finds_exact_patch() {
        let image = GrayImage::from_fn(40, 30, |x, y| Luma([((x * x * 31 + y * y * 17 + x * y * 7 + x * 3) % 251) as u8]));
        let template = image::imageops::crop_imm(&image, 12, 9, 8, 6).to_image();

        let (x, y, score) = best_match(&image, &template).unwrap();
        assert_eq!((x, y), (12, 9));
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_flat_template_never_matches() {
        let image = GrayImage::from_pixel(10, 10, Luma([10]));
        let template = GrayImage::from_pixel(3, 3, Luma([10]));
        assert!(best_match(&image, &template).is_none());
    }

    #[test]
    fn test_template_larger_than_image() {
        let image = GrayImage::new(4, 4);
        let template = GrayImage::new(5, 2);
        assert!(best_match(&image, &template).is_none());
    }
}
