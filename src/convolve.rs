//! 2D convolution and the convolve-and-subtract primitive.
//!
//! All convolutions here are true convolutions evaluated only where the kernel
//! lies fully inside the input ("valid" mode): an `H x W` input convolved with a
//! `kh x kw` kernel yields `(H - kh + 1) x (W - kw + 1)` values, the first of which
//! sits under input pixel `(kh / 2, kw / 2)`.

use ndarray::parallel::prelude::*;
use ndarray::{s, Array2, ArrayView2, Axis};
use rustfft::num_complex::Complex;
use rustfft::{FftDirection, FftPlanner};

use crate::image::{MaskPixel, MaskPlane, MaskedImage, MaskedImageView, Pixel};
use crate::{DiffimError, Result};

/// Kernels at least this many pixels go through the FFT path on large inputs.
const FFT_MIN_KERNEL_PIXELS: usize = 225;
const FFT_MIN_IMAGE_PIXELS: usize = 128 * 128;

/// Anything that can be convolved with an image: a fixed kernel image, or a
/// kernel whose shape varies with position.
pub trait ConvolutionKernel: Sync {
    /// (rows, cols); both odd
    fn dimensions(&self) -> (usize, usize);

    /// kernel image at parent position (x, y)
    fn image_at(&self, x: f64, y: f64) -> Array2<f64>;

    /// Valid-mode convolution of `image`, whose first pixel sits at parent
    /// coordinates (x0, y0). Fixed kernels ignore the position.
    fn convolve_valid(&self, image: &ArrayView2<f64>, x0: i32, y0: i32) -> Array2<f64> {
        let (rows, cols) = image.dim();
        let xc = x0 as f64 + ((cols - 1) / 2) as f64;
        let yc = y0 as f64 + ((rows - 1) / 2) as f64;
        convolve(image, &self.image_at(xc, yc).view())
    }
}

/// Additive background model evaluated at parent coordinates.
pub trait Background: Sync {
    fn value_at(&self, x: f64, y: f64) -> f64;
}

impl Background for f64 {
    fn value_at(&self, _x: f64, _y: f64) -> f64 {
        *self
    }
}

#[derive(Clone, Debug)]
pub struct FixedKernel {
    image: Array2<f64>,
}

impl FixedKernel {
    pub fn new(image: Array2<f64>) -> Result<Self> {
        let (rows, cols) = image.dim();
        if rows % 2 == 0 || cols % 2 == 0 || rows == 0 || cols == 0 {
            return Err(DiffimError::DimensionMismatch(format!(
                "kernel must have odd dimensions, got {}x{}",
                cols, rows
            )));
        }
        Ok(Self { image })
    }

    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn sum(&self) -> f64 {
        self.image.sum()
    }
}

impl ConvolutionKernel for FixedKernel {
    fn dimensions(&self) -> (usize, usize) {
        self.image.dim()
    }

    fn image_at(&self, _x: f64, _y: f64) -> Array2<f64> {
        self.image.clone()
    }
}

/// Valid-mode convolution; picks the direct or FFT implementation by size.
pub fn convolve(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    if kernel.len() >= FFT_MIN_KERNEL_PIXELS && image.len() >= FFT_MIN_IMAGE_PIXELS {
        convolve_fft(image, kernel)
    } else {
        convolve_direct(image, kernel)
    }
}

/// Direct valid-mode convolution, output rows computed in parallel.
pub fn convolve_direct(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();

    if ker_rows > img_rows || ker_cols > img_cols || ker_rows == 0 || ker_cols == 0 {
        return Array2::zeros((0, 0));
    }
    let out_rows = img_rows - ker_rows + 1;
    let out_cols = img_cols - ker_cols + 1;

    let mut output = Array2::zeros((out_rows, out_cols));
    output
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            for j in 0..out_cols {
                let mut sum = 0.0;
                for ki in 0..ker_rows {
                    for kj in 0..ker_cols {
                        sum += image[[i + ker_rows - 1 - ki, j + ker_cols - 1 - kj]]
                            * kernel[[ki, kj]];
                    }
                }
                row[j] = sum;
            }
        });
    output
}

fn fft_2d(buf: &mut Array2<Complex<f64>>, planner: &mut FftPlanner<f64>, direction: FftDirection) {
    let (rows, cols) = buf.dim();

    let row_fft = planner.plan_fft(cols, direction);
    for mut row in buf.rows_mut() {
        if let Some(slice) = row.as_slice_mut() {
            row_fft.process(slice);
        }
    }

    // columns: transpose into standard layout so each column is contiguous
    let col_fft = planner.plan_fft(rows, direction);
    let mut transposed = buf.t().as_standard_layout().into_owned();
    for mut col in transposed.rows_mut() {
        if let Some(slice) = col.as_slice_mut() {
            col_fft.process(slice);
        }
    }
    buf.assign(&transposed.t());
}

/// Valid-mode convolution through a zero-padded 2D FFT.
pub fn convolve_fft(image: &ArrayView2<f64>, kernel: &ArrayView2<f64>) -> Array2<f64> {
    let (img_rows, img_cols) = image.dim();
    let (ker_rows, ker_cols) = kernel.dim();

    if ker_rows > img_rows || ker_cols > img_cols || ker_rows == 0 || ker_cols == 0 {
        return Array2::zeros((0, 0));
    }
    let rows = img_rows + ker_rows - 1;
    let cols = img_cols + ker_cols - 1;

    let mut img_buf = Array2::from_elem((rows, cols), Complex::new(0.0, 0.0));
    img_buf
        .slice_mut(s![..img_rows, ..img_cols])
        .zip_mut_with(image, |dst, &src| dst.re = src);
    let mut ker_buf = Array2::from_elem((rows, cols), Complex::new(0.0, 0.0));
    ker_buf
        .slice_mut(s![..ker_rows, ..ker_cols])
        .zip_mut_with(kernel, |dst, &src| dst.re = src);

    let mut planner = FftPlanner::new();
    fft_2d(&mut img_buf, &mut planner, FftDirection::Forward);
    fft_2d(&mut ker_buf, &mut planner, FftDirection::Forward);
    img_buf.zip_mut_with(&ker_buf, |a, b| *a *= *b);
    fft_2d(&mut img_buf, &mut planner, FftDirection::Inverse);

    let norm = 1.0 / (rows * cols) as f64;
    img_buf
        .slice(s![ker_rows - 1..img_rows, ker_cols - 1..img_cols])
        .mapv(|c| c.re * norm)
}

/// OR of every mask bit within `half_rows`/`half_cols` of each pixel.
pub fn grow_mask(
    mask: &ArrayView2<MaskPixel>,
    half_rows: usize,
    half_cols: usize,
) -> Array2<MaskPixel> {
    let (rows, cols) = mask.dim();
    let mut horizontal = Array2::<MaskPixel>::zeros((rows, cols));
    for r in 0..rows {
        for c in 0..cols {
            let lo = c.saturating_sub(half_cols);
            let hi = (c + half_cols).min(cols - 1);
            horizontal[[r, c]] = (lo..=hi).fold(0, |acc, k| acc | mask[[r, k]]);
        }
    }
    let mut grown = Array2::<MaskPixel>::zeros((rows, cols));
    for r in 0..rows {
        let lo = r.saturating_sub(half_rows);
        let hi = (r + half_rows).min(rows - 1);
        for c in 0..cols {
            grown[[r, c]] = (lo..=hi).fold(0, |acc, k| acc | horizontal[[k, c]]);
        }
    }
    grown
}

/// The fundamental differencing step: `science - kernel * template - background`.
///
/// The result has the science image's shape and origin. Only pixels at least half
/// a kernel away from every edge are valid; the rest are set to NaN and flagged
/// `EDGE`. Variance propagates as `var(S) + K^2 * var(T)` (kernel taken at the image
/// center) and the template mask is grown by the kernel footprint.
pub fn difference<T, K, B>(
    template: &MaskedImageView<'_, T>,
    science: &MaskedImageView<'_, T>,
    kernel: &K,
    background: &B,
) -> Result<MaskedImage<T>>
where
    T: Pixel,
    K: ConvolutionKernel + ?Sized,
    B: Background + ?Sized,
{
    if !template.same_shape(science) {
        return Err(DiffimError::DimensionMismatch(format!(
            "template {}x{} vs science {}x{}",
            template.width(),
            template.height(),
            science.width(),
            science.height()
        )));
    }
    let (rows, cols) = (science.height(), science.width());
    let (ker_rows, ker_cols) = kernel.dimensions();
    if ker_rows > rows || ker_cols > cols {
        return Err(DiffimError::DimensionMismatch(format!(
            "kernel {}x{} larger than image {}x{}",
            ker_cols, ker_rows, cols, rows
        )));
    }
    let (cy, cx) = (ker_rows / 2, ker_cols / 2);

    let convolved = kernel.convolve_valid(&template.image_f64().view(), template.x0, template.y0);
    let center = science.bbox().center();
    let ksq = kernel.image_at(center.x, center.y).mapv(|v| v * v);
    let convolved_var = convolve(&template.variance_f64().view(), &ksq.view());
    let template_bits = grow_mask(&template.mask, cy, cx);

    let edge = MaskPlane::Edge.bit();
    let mut out = MaskedImage::<T>::new(cols, rows).with_origin(science.x0, science.y0);
    for r in 0..rows {
        for c in 0..cols {
            let interior = r >= cy && r + cy < rows && c >= cx && c + cx < cols;
            if !interior {
                out.image[[r, c]] = T::nan();
                out.variance[[r, c]] = T::nan();
                out.mask[[r, c]] = science.mask[[r, c]] | edge;
                continue;
            }
            let x = (science.x0 + c as i32) as f64;
            let y = (science.y0 + r as i32) as f64;
            let value = science.image[[r, c]].as_f64()
                - convolved[[r - cy, c - cx]]
                - background.value_at(x, y);
            let variance = science.variance[[r, c]].as_f64() + convolved_var[[r - cy, c - cx]];
            out.image[[r, c]] = T::from_f64_cast(value);
            out.variance[[r, c]] = T::from_f64_cast(variance);
            out.mask[[r, c]] = science.mask[[r, c]] | template_bits[[r, c]];
        }
    }
    Ok(out)
}

/// Gaussian kernel image of odd `size`, normalized to unit sum.
pub fn gaussian_kernel(size: usize, sigma: f64) -> Array2<f64> {
    let mut kernel = Array2::zeros((size, size));
    let center = (size / 2) as f64;
    for ((r, c), v) in kernel.indexed_iter_mut() {
        let dx = c as f64 - center;
        let dy = r as f64 - center;
        *v = (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
    }
    let sum = kernel.sum();
    if sum > 0.0 {
        kernel.mapv_inplace(|v| v / sum);
    }
    kernel
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_convolve_direct_flips_kernel() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 9.0]];
        // impulse one pixel right of center shifts the image right
        let kernel = array![[0.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, 0.0]];
        let out = convolve_direct(&image.view(), &kernel.view());
        assert_eq!(out.dim(), (1, 1));
        assert_eq!(out[[0, 0]], 4.0);
    }

    #[test]
    fn test_fft_matches_direct() {
        let image = Array2::from_shape_fn((40, 37), |(r, c)| ((r * 7 + c * 3) % 11) as f64 - 4.0);
        let kernel = Array2::from_shape_fn((5, 7), |(r, c)| (r as f64 + 1.0) * (c as f64 - 2.5));
        let direct = convolve_direct(&image.view(), &kernel.view());
        let fft = convolve_fft(&image.view(), &kernel.view());
        assert_eq!(direct.dim(), fft.dim());
        for (a, b) in direct.iter().zip(fft.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_grow_mask() {
        let mut mask = Array2::<MaskPixel>::zeros((5, 5));
        mask[[2, 2]] = 4;
        let grown = grow_mask(&mask.view(), 1, 1);
        assert_eq!(grown[[1, 1]], 4);
        assert_eq!(grown[[3, 3]], 4);
        assert_eq!(grown[[0, 0]], 0);
        assert_eq!(grown[[2, 4]], 0);
    }

    #[test]
    fn test_difference_of_exact_convolution_is_zero() {
        let size = 31;
        let mut template = MaskedImage::<f64>::new(size, size);
        template.fill_variance(1.0);
        for ((r, c), v) in template.image.indexed_iter_mut() {
            *v = ((r as f64 - 15.0).powi(2) + (c as f64 - 14.0).powi(2)).sqrt().cos() + 2.0;
        }
        let kernel = FixedKernel::new(gaussian_kernel(7, 1.3)).unwrap();

        let mut science = template.clone();
        let conv = convolve(&template.image.view(), &kernel.image().view());
        science.image.slice_mut(s![3..size - 3, 3..size - 3]).assign(&conv);
        science.image.mapv_inplace(|v| v + 10.0);

        let diff = difference(&template.view(), &science.view(), &kernel, &10.0).unwrap();
        let edge = MaskPlane::Edge.bit();
        for ((r, c), v) in diff.image.indexed_iter() {
            let interior = (3..size - 3).contains(&r) && (3..size - 3).contains(&c);
            if interior {
                assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-12);
                assert_eq!(diff.mask[[r, c]] & edge, 0);
            } else {
                assert!(v.is_nan());
                assert_ne!(diff.mask[[r, c]] & edge, 0);
            }
        }
        // variance = 1 + sum(K^2)
        let ksq: f64 = kernel.image().iter().map(|v| v * v).sum();
        assert_abs_diff_eq!(diff.variance[[10, 10]], 1.0 + ksq, epsilon = 1e-12);
    }

    #[test]
    fn test_difference_rejects_shape_mismatch() {
        let a = MaskedImage::<f32>::new(10, 10);
        let b = MaskedImage::<f32>::new(11, 10);
        let kernel = FixedKernel::new(gaussian_kernel(3, 1.0)).unwrap();
        assert!(difference(&a.view(), &b.view(), &kernel, &0.0).is_err());
    }

    #[test]
    fn test_fixed_kernel_requires_odd() {
        assert!(FixedKernel::new(Array2::zeros((4, 5))).is_err());
        assert!(FixedKernel::new(Array2::zeros((5, 5))).is_ok());
    }
}
