//! Basis kernels for PSF matching.
//!
//! A [`BasisSet`] is an ordered list of fixed kernels of a common odd size; the
//! position of a kernel in the list is the position of its coefficient in every
//! linear solve.

use ndarray::{s, Array1, Array2};
use ndarray_inverse::Inverse;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::linalg::{solve_normal_equations, symmetric_eigen};
use crate::spatial_function::{n_terms, term_powers};
use crate::{DiffimError, Result};

/// Below this L2 norm a renormalized kernel has no component independent of
/// the first kernel.
const DEPENDENT_NORM: f64 = 1e-10;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundaryStyle {
    /// stencils falling off the kernel are skipped
    Unwrapped,
    /// stencils wrap around the kernel edges
    Wrapped,
    /// stencils falling off the kernel drop to the highest order that fits
    #[default]
    Tapered,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DifferenceStyle {
    Forward,
    #[default]
    Central,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LambdaType {
    /// lambda = lambda_value
    #[default]
    Absolute,
    /// lambda = lambda_value * tr(M) / tr(H)
    Relative,
    /// the scanned lambda with the least risk against a truncated
    /// pseudo-inverse solution
    MinimizeBiasedRisk,
    /// the scanned lambda with the least risk against the plain least-squares
    /// solution
    MinimizeUnbiasedRisk,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LambdaStepType {
    Linear,
    /// `min`, `max` and `step` are powers of ten
    #[default]
    Log,
}

/// Grid of lambdas scanned by the risk-minimizing lambda types.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct LambdaSteps {
    pub step_type: LambdaStepType,
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Default for LambdaSteps {
    fn default() -> Self {
        Self {
            step_type: LambdaStepType::Log,
            min: -1.0,
            max: 2.0,
            step: 0.1,
        }
    }
}

impl LambdaSteps {
    /// `min, min + step, ...` up to and including `max`
    pub fn values(&self) -> Vec<f64> {
        let n = ((self.max - self.min) / self.step + 1e-9).floor() as usize + 1;
        (0..n)
            .map(|i| {
                let v = self.min + i as f64 * self.step;
                match self.step_type {
                    LambdaStepType::Linear => v,
                    LambdaStepType::Log => 10f64.powf(v),
                }
            })
            .collect()
    }

    fn validate(&self) -> Result<()> {
        let finite = self.min.is_finite() && self.max.is_finite() && self.step.is_finite();
        if !finite || !(self.step > 0.0) || self.max < self.min {
            return Err(DiffimError::InvalidBasisConfig(format!(
                "lambda steps need min <= max and a positive step, got {} to {} by {}",
                self.min, self.max, self.step
            )));
        }
        if self.step_type == LambdaStepType::Linear && self.min < 0.0 {
            return Err(DiffimError::InvalidBasisConfig(format!(
                "linear lambda steps must start at a non-negative value, got {}",
                self.min
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct RegularizationConfig {
    /// derivative order penalized (0, 1 or 2)
    pub order: usize,
    pub boundary: BoundaryStyle,
    pub difference: DifferenceStyle,
    pub lambda_type: LambdaType,
    pub lambda_value: f64,
    /// only used by the risk-minimizing lambda types
    pub lambda_steps: LambdaSteps,
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        Self {
            order: 2,
            boundary: BoundaryStyle::Tapered,
            difference: DifferenceStyle::Central,
            lambda_type: LambdaType::Absolute,
            lambda_value: 0.2,
            lambda_steps: LambdaSteps::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "family", rename_all = "kebab-case")]
pub enum BasisConfig {
    /// Gaussians of width `sigmas[g]` times all 2D polynomials up to `degrees[g]`
    AlardLupton {
        kernel_size: usize,
        sigmas: Vec<f64>,
        degrees: Vec<usize>,
    },
    /// one kernel per pixel
    DeltaFunction {
        kernel_size: usize,
        #[serde(default)]
        regularization: Option<RegularizationConfig>,
    },
}

impl Default for BasisConfig {
    fn default() -> Self {
        BasisConfig::AlardLupton {
            kernel_size: 21,
            sigmas: vec![0.7, 1.5, 3.0],
            degrees: vec![4, 3, 2],
        }
    }
}

impl BasisConfig {
    pub fn kernel_size(&self) -> usize {
        match self {
            BasisConfig::AlardLupton { kernel_size, .. } => *kernel_size,
            BasisConfig::DeltaFunction { kernel_size, .. } => *kernel_size,
        }
    }

    /// closed-form number of kernels this configuration produces
    pub fn count(&self) -> usize {
        match self {
            BasisConfig::AlardLupton { degrees, .. } => degrees.iter().map(|d| n_terms(*d)).sum(),
            BasisConfig::DeltaFunction { kernel_size, .. } => kernel_size * kernel_size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let size = self.kernel_size();
        if size < 3 || size % 2 == 0 {
            return Err(DiffimError::InvalidBasisConfig(format!(
                "kernel size must be odd and at least 3, got {}",
                size
            )));
        }
        match self {
            BasisConfig::AlardLupton { sigmas, degrees, .. } => {
                if sigmas.is_empty() {
                    return Err(DiffimError::InvalidBasisConfig(
                        "no gaussians configured".to_string(),
                    ));
                }
                if sigmas.len() != degrees.len() {
                    return Err(DiffimError::InvalidBasisConfig(format!(
                        "{} gaussian widths but {} degrees",
                        sigmas.len(),
                        degrees.len()
                    )));
                }
                if let Some(s) = sigmas.iter().find(|s| !(**s > 0.0 && s.is_finite())) {
                    return Err(DiffimError::InvalidBasisConfig(format!(
                        "gaussian width must be positive, got {}",
                        s
                    )));
                }
            }
            BasisConfig::DeltaFunction { regularization, .. } => {
                if let Some(reg) = regularization {
                    if reg.order > 2 {
                        return Err(DiffimError::InvalidBasisConfig(format!(
                            "regularization order must be 0, 1 or 2, got {}",
                            reg.order
                        )));
                    }
                    if !(reg.lambda_value >= 0.0) {
                        return Err(DiffimError::InvalidBasisConfig(format!(
                            "regularization strength must be non-negative, got {}",
                            reg.lambda_value
                        )));
                    }
                    reg.lambda_steps.validate()?;
                }
            }
        }
        Ok(())
    }
}

/// One fixed kernel of a basis set.
#[derive(Clone, Debug, PartialEq)]
pub struct BasisKernel {
    pub index: usize,
    image: Array2<f64>,
}

impl BasisKernel {
    pub fn image(&self) -> &Array2<f64> {
        &self.image
    }

    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    pub fn sum(&self) -> f64 {
        self.image.sum()
    }
}

/// Tikhonov penalty `lambda * a^T H a` on the kernel coefficients.
#[derive(Clone, Debug)]
pub struct Regularization {
    pub h: Array2<f64>,
    pub lambda_type: LambdaType,
    pub lambda_value: f64,
    pub lambda_steps: LambdaSteps,
}

impl Regularization {
    /// `H` padded with zeros to `n_params` coefficients; the trailing ones
    /// (background) are not penalized.
    pub fn penalty(&self, n_params: usize) -> Array2<f64> {
        let n = self.h.nrows();
        let mut h = Array2::zeros((n_params, n_params));
        h.slice_mut(s![..n, ..n]).assign(&self.h);
        h
    }

    /// Strength to apply to the normal equations `m x = b`, whose leading
    /// block belongs to the kernel coefficients. `max_condition` truncates the
    /// reference solution of the biased risk estimate.
    pub fn lambda(&self, m: &Array2<f64>, b: &Array1<f64>, max_condition: f64) -> Result<f64> {
        match self.lambda_type {
            LambdaType::Absolute => Ok(self.lambda_value),
            LambdaType::Relative => {
                let n = self.h.nrows();
                let tr_h = self.h.diag().sum();
                if tr_h > 0.0 {
                    Ok(self.lambda_value * m.slice(s![..n, ..n]).diag().sum() / tr_h)
                } else {
                    Ok(self.lambda_value)
                }
            }
            LambdaType::MinimizeBiasedRisk => self.minimize_risk(m, b, Some(max_condition)),
            LambdaType::MinimizeUnbiasedRisk => self.minimize_risk(m, b, None),
        }
    }

    /// Scan `lambda_steps` for the least estimated risk
    /// `|a|^2 + 2 (tr((M + lambda H)^-1) - a . a_ref)`, where `a` solves the
    /// regularized system and `a_ref = M^+ b`. With `truncate`, eigenvalues of
    /// `M` more than that factor below the largest are left out of `M^+`.
    fn minimize_risk(&self, m: &Array2<f64>, b: &Array1<f64>, truncate: Option<f64>) -> Result<f64> {
        let h = self.penalty(m.nrows());
        let (values, vectors) = symmetric_eigen(m);
        let e_max = values.iter().copied().fold(0.0_f64, f64::max);
        let inverse_values = values.mapv(|v| {
            let keep = match truncate {
                Some(tol) => v > 0.0 && e_max / v <= tol,
                None => v.abs() > e_max * f64::EPSILON,
            };
            if keep {
                1.0 / v
            } else {
                0.0
            }
        });
        let reference = vectors.dot(&(&inverse_values * &vectors.t().dot(b)));

        let mut best: Option<(f64, f64)> = None;
        for lambda in self.lambda_steps.values() {
            let m_lambda = m + &(&h * lambda);
            let (a, _) = solve_normal_equations(&m_lambda, b)?;
            let trace_inverse = m_lambda
                .inv()
                .ok_or_else(|| {
                    DiffimError::IllConditionedFit(format!(
                        "regularized normal equations are singular at lambda {:.3e}",
                        lambda
                    ))
                })?
                .diag()
                .sum();
            let risk = a.dot(&a) + 2.0 * (trace_inverse - a.dot(&reference));
            trace!("lambda {:.3e}: risk {:.5e}", lambda, risk);
            if best.map_or(true, |(_, r)| risk < r) {
                best = Some((lambda, risk));
            }
        }
        let (lambda, risk) = best.ok_or_else(|| {
            DiffimError::InvalidBasisConfig("no lambda steps to scan".to_string())
        })?;
        debug!("minimum risk {:.3e} at lambda {:.3e}", risk, lambda);
        Ok(lambda)
    }
}

#[derive(Clone, Debug)]
pub struct BasisSet {
    kernels: Vec<BasisKernel>,
    first_term_is_flux: bool,
    regularization: Option<Regularization>,
}

impl BasisSet {
    pub fn build(config: &BasisConfig) -> Result<Self> {
        config.validate()?;
        let basis = match config {
            BasisConfig::AlardLupton {
                kernel_size,
                sigmas,
                degrees,
            } => {
                Self::from_images(alard_lupton_basis(*kernel_size, sigmas, degrees)?, true)?
            }
            BasisConfig::DeltaFunction {
                kernel_size,
                regularization,
            } => {
                let mut basis = Self::from_images(delta_function_images(*kernel_size), false)?;
                if let Some(reg) = regularization {
                    let h = finite_difference_regularization(
                        *kernel_size,
                        *kernel_size,
                        reg.order,
                        reg.boundary,
                        reg.difference,
                    );
                    basis.regularization = Some(Regularization {
                        h,
                        lambda_type: reg.lambda_type,
                        lambda_value: reg.lambda_value,
                        lambda_steps: reg.lambda_steps,
                    });
                }
                basis
            }
        };
        debug!("built basis of {} kernels", basis.len());
        Ok(basis)
    }

    /// Wrap already-built kernel images. All must share one odd size.
    pub fn from_images(images: Vec<Array2<f64>>, first_term_is_flux: bool) -> Result<Self> {
        let first = images
            .first()
            .ok_or_else(|| DiffimError::InvalidBasisConfig("basis has no kernels".to_string()))?;
        let dim = first.dim();
        if dim.0 < 3 || dim.1 < 3 || dim.0 % 2 == 0 || dim.1 % 2 == 0 {
            return Err(DiffimError::InvalidBasisConfig(format!(
                "kernel dimensions must be odd and at least 3, got {}x{}",
                dim.1, dim.0
            )));
        }
        if images.iter().any(|im| im.dim() != dim) {
            return Err(DiffimError::InvalidBasisConfig(
                "basis kernels differ in size".to_string(),
            ));
        }
        Ok(Self {
            kernels: images
                .into_iter()
                .enumerate()
                .map(|(index, image)| BasisKernel { index, image })
                .collect(),
            first_term_is_flux,
            regularization: None,
        })
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn kernels(&self) -> &[BasisKernel] {
        &self.kernels
    }

    /// (rows, cols)
    pub fn dimensions(&self) -> (usize, usize) {
        self.kernels[0].image.dim()
    }

    /// Whether kernel 0 carries the flux and every other kernel sums to zero.
    pub fn first_term_is_flux(&self) -> bool {
        self.first_term_is_flux
    }

    pub fn regularization(&self) -> Option<&Regularization> {
        self.regularization.as_ref()
    }

    /// Kernel image for a coefficient vector.
    pub fn combine(&self, coeffs: &[f64]) -> Result<Array2<f64>> {
        if coeffs.len() != self.len() {
            return Err(DiffimError::DimensionMismatch(format!(
                "{} coefficients for {} basis kernels",
                coeffs.len(),
                self.len()
            )));
        }
        let mut out = Array2::zeros(self.dimensions());
        for (kernel, c) in self.kernels.iter().zip(coeffs) {
            out.scaled_add(*c, &kernel.image);
        }
        Ok(out)
    }
}

/// Gaussian-times-polynomial kernels, unnormalized; groups in configuration
/// order, terms within a group by total degree then power of y.
pub fn alard_lupton_images(kernel_size: usize, sigmas: &[f64], degrees: &[usize]) -> Vec<Array2<f64>> {
    let half = (kernel_size / 2) as f64;
    let mut images = Vec::with_capacity(degrees.iter().map(|d| n_terms(*d)).sum());
    for (sigma, degree) in sigmas.iter().zip(degrees) {
        for index in 0..n_terms(*degree) {
            let (px, py) = term_powers(index);
            let image = Array2::from_shape_fn((kernel_size, kernel_size), |(r, c)| {
                let x = c as f64 - half;
                let y = r as f64 - half;
                (-(x * x + y * y) / (2.0 * sigma * sigma)).exp() * x.powi(px as i32) * y.powi(py as i32)
            });
            images.push(image);
        }
    }
    images
}

/// One unit impulse per pixel, row-major.
pub fn delta_function_images(kernel_size: usize) -> Vec<Array2<f64>> {
    (0..kernel_size * kernel_size)
        .map(|p| {
            let mut image = Array2::zeros((kernel_size, kernel_size));
            image[[p / kernel_size, p % kernel_size]] = 1.0;
            image
        })
        .collect()
}

fn unit_sum(mut image: Array2<f64>) -> Result<Array2<f64>> {
    let sum = image.sum();
    if !(sum.abs() > f64::EPSILON) {
        return Err(DiffimError::InvalidBasisConfig(
            "first basis kernel has zero sum".to_string(),
        ));
    }
    image.mapv_inplace(|v| v / sum);
    Ok(image)
}

/// Remove `sum(image) * first` from `image` and scale what is left to unit L2
/// norm. `None` if nothing is left.
fn zero_sum_unit_norm(first: &Array2<f64>, mut image: Array2<f64>) -> Option<Array2<f64>> {
    let sum = image.sum();
    image.scaled_add(-sum, first);
    let norm = image.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm < DEPENDENT_NORM {
        return None;
    }
    image.mapv_inplace(|v| v / norm);
    Some(image)
}

/// Scale the first kernel to unit sum; make every later kernel zero-sum by
/// removing its projection on the first, then scale it to unit L2 norm.
/// Kernels that vanish in the process are dropped.
pub fn renormalize_kernel_list(images: Vec<Array2<f64>>) -> Result<Vec<Array2<f64>>> {
    let mut iter = images.into_iter();
    let first = unit_sum(
        iter.next()
            .ok_or_else(|| DiffimError::InvalidBasisConfig("basis has no kernels".to_string()))?,
    )?;

    let mut out = vec![first];
    for (i, image) in iter.enumerate() {
        match zero_sum_unit_norm(&out[0], image) {
            Some(image) => out.push(image),
            None => debug!("dropping basis kernel {}: no independent component", i + 1),
        }
    }
    Ok(out)
}

/// Renormalized Alard-Lupton kernels, as [`renormalize_kernel_list`] but
/// refusing to drop any: the basis size is fixed by the configuration.
fn alard_lupton_basis(kernel_size: usize, sigmas: &[f64], degrees: &[usize]) -> Result<Vec<Array2<f64>>> {
    let labels: Vec<(usize, (usize, usize))> = degrees
        .iter()
        .enumerate()
        .flat_map(|(g, d)| (0..n_terms(*d)).map(move |t| (g, term_powers(t))))
        .collect();
    let mut images = alard_lupton_images(kernel_size, sigmas, degrees).into_iter();
    let first = unit_sum(
        images
            .next()
            .ok_or_else(|| DiffimError::InvalidBasisConfig("basis has no kernels".to_string()))?,
    )?;

    let mut out = vec![first];
    for ((group, (px, py)), image) in labels.into_iter().skip(1).zip(images) {
        let image = zero_sum_unit_norm(&out[0], image).ok_or_else(|| {
            DiffimError::InvalidBasisConfig(format!(
                "gaussian {} (sigma {}) term x^{} y^{} is linearly dependent on the first kernel",
                group, sigmas[group], px, py
            ))
        })?;
        out.push(image);
    }
    Ok(out)
}

/// 1D difference weights at integer offsets
fn stencil(order: usize, style: DifferenceStyle) -> Vec<(i64, f64)> {
    match (order, style) {
        (0, _) => vec![(0, 1.0)],
        (1, DifferenceStyle::Forward) => vec![(0, -1.0), (1, 1.0)],
        (1, DifferenceStyle::Central) => vec![(-1, -0.5), (1, 0.5)],
        (_, DifferenceStyle::Forward) => vec![(0, 1.0), (1, -2.0), (2, 1.0)],
        (_, DifferenceStyle::Central) => vec![(-1, 1.0), (0, -2.0), (1, 1.0)],
    }
}

/// Penalty matrix `H = B^T B` over a `width x height` delta-function basis,
/// where each row of `B` applies a finite-difference stencil of `order` along
/// x or y at one kernel pixel.
pub fn finite_difference_regularization(
    width: usize,
    height: usize,
    order: usize,
    boundary: BoundaryStyle,
    style: DifferenceStyle,
) -> Array2<f64> {
    let n = width * height;
    let mut rows: Vec<Array1<f64>> = Vec::new();

    // one axis is enough for order 0
    let axes: &[(i64, i64)] = if order == 0 { &[(1, 0)] } else { &[(1, 0), (0, 1)] };
    for r in 0..height as i64 {
        for c in 0..width as i64 {
            for (ax, ay) in axes {
                let mut ord = order;
                loop {
                    let mut row = Array1::<f64>::zeros(n);
                    let mut fits = true;
                    for (offset, weight) in stencil(ord, style) {
                        let mut x = c + ax * offset;
                        let mut y = r + ay * offset;
                        let inside = (0..width as i64).contains(&x) && (0..height as i64).contains(&y);
                        if !inside {
                            if boundary == BoundaryStyle::Wrapped {
                                x = x.rem_euclid(width as i64);
                                y = y.rem_euclid(height as i64);
                            } else {
                                fits = false;
                                break;
                            }
                        }
                        row[(y as usize) * width + x as usize] += weight;
                    }
                    if fits {
                        rows.push(row);
                        break;
                    }
                    if boundary == BoundaryStyle::Tapered && ord > 0 {
                        ord -= 1;
                    } else {
                        break;
                    }
                }
            }
        }
    }

    let mut b = Array2::<f64>::zeros((rows.len(), n));
    for (i, row) in rows.iter().enumerate() {
        b.row_mut(i).assign(row);
    }
    b.t().dot(&b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_alard_lupton_count_and_shape() {
        let config = BasisConfig::AlardLupton {
            kernel_size: 19,
            sigmas: vec![0.7, 1.5, 3.0],
            degrees: vec![4, 2, 2],
        };
        let basis = BasisSet::build(&config).unwrap();
        assert_eq!(basis.len(), 15 + 6 + 6);
        assert_eq!(basis.len(), config.count());
        for k in basis.kernels() {
            assert_eq!(k.width() % 2, 1);
            assert_eq!(k.height() % 2, 1);
        }
        assert!(basis.first_term_is_flux());
    }

    #[test]
    fn test_alard_lupton_normalization() {
        let basis = BasisSet::build(&BasisConfig::default()).unwrap();
        assert_abs_diff_eq!(basis.kernels()[0].sum(), 1.0, epsilon = 1e-12);
        for k in &basis.kernels()[1..] {
            assert_abs_diff_eq!(k.sum(), 0.0, epsilon = 1e-10);
            let norm: f64 = k.image().iter().map(|v| v * v).sum();
            assert_abs_diff_eq!(norm, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_delta_function_basis() {
        let config = BasisConfig::DeltaFunction {
            kernel_size: 5,
            regularization: None,
        };
        let basis = BasisSet::build(&config).unwrap();
        assert_eq!(basis.len(), 25);
        assert!(!basis.first_term_is_flux());
        assert!(basis.regularization().is_none());
        assert_eq!(basis.kernels()[7].image()[[1, 2]], 1.0);
        assert_eq!(basis.kernels()[7].sum(), 1.0);
    }

    #[test]
    fn test_invalid_configs() {
        let even = BasisConfig::DeltaFunction {
            kernel_size: 4,
            regularization: None,
        };
        assert!(matches!(
            BasisSet::build(&even),
            Err(DiffimError::InvalidBasisConfig(_))
        ));
        let empty = BasisConfig::AlardLupton {
            kernel_size: 11,
            sigmas: vec![],
            degrees: vec![],
        };
        assert!(matches!(
            BasisSet::build(&empty),
            Err(DiffimError::InvalidBasisConfig(_))
        ));
        let mismatched = BasisConfig::AlardLupton {
            kernel_size: 11,
            sigmas: vec![1.0, 2.0],
            degrees: vec![1],
        };
        assert!(BasisSet::build(&mismatched).is_err());
        assert!(BasisSet::from_images(vec![], true).is_err());
    }

    #[test]
    fn test_combine() {
        let basis = BasisSet::build(&BasisConfig::DeltaFunction {
            kernel_size: 3,
            regularization: None,
        })
        .unwrap();
        let coeffs: Vec<f64> = (0..9).map(|i| i as f64).collect();
        let image = basis.combine(&coeffs).unwrap();
        assert_eq!(image[[2, 1]], 7.0);
        assert!(basis.combine(&coeffs[..3]).is_err());
    }

    #[test]
    fn test_regularization_annihilates_smooth_kernels() {
        // second differences vanish on planes
        let h = finite_difference_regularization(
            5,
            5,
            2,
            BoundaryStyle::Unwrapped,
            DifferenceStyle::Forward,
        );
        let plane = Array1::from_iter((0..25).map(|p| 1.0 + 0.3 * (p % 5) as f64 - 0.2 * (p / 5) as f64));
        assert_abs_diff_eq!(plane.dot(&h.dot(&plane)), 0.0, epsilon = 1e-12);

        // but not on a bump
        let mut bump = Array1::zeros(25);
        bump[12] = 1.0;
        assert!(bump.dot(&h.dot(&bump)) > 0.0);
    }

    #[test]
    fn test_regularization_boundary_styles() {
        let unwrapped = finite_difference_regularization(
            4,
            4,
            1,
            BoundaryStyle::Unwrapped,
            DifferenceStyle::Forward,
        );
        let wrapped =
            finite_difference_regularization(4, 4, 1, BoundaryStyle::Wrapped, DifferenceStyle::Forward);
        let tapered =
            finite_difference_regularization(4, 4, 1, BoundaryStyle::Tapered, DifferenceStyle::Forward);
        // a constant kernel has no gradient, except where tapering falls back to order 0
        let ones = Array1::from_elem(16, 1.0);
        assert_abs_diff_eq!(ones.dot(&unwrapped.dot(&ones)), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ones.dot(&wrapped.dot(&ones)), 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(ones.dot(&tapered.dot(&ones)), 8.0, epsilon = 1e-12);
        // symmetric and positive semi-definite
        for h in [&unwrapped, &wrapped, &tapered] {
            assert_eq!(h.dim(), (16, 16));
            for i in 0..16 {
                assert!(h[[i, i]] >= 0.0);
                for j in 0..16 {
                    assert_abs_diff_eq!(h[[i, j]], h[[j, i]]);
                }
            }
        }
    }

    #[test]
    fn test_relative_lambda() {
        let reg = Regularization {
            h: Array2::eye(3) * 2.0,
            lambda_type: LambdaType::Relative,
            lambda_value: 0.5,
            lambda_steps: LambdaSteps::default(),
        };
        // the trailing background row does not count towards tr(M)
        let mut m = Array2::eye(4) * 10.0;
        m[[3, 3]] = 1e6;
        let b = Array1::zeros(4);
        assert_abs_diff_eq!(reg.lambda(&m, &b, 1e10).unwrap(), 0.5 * 30.0 / 6.0);
        let h = reg.penalty(4);
        assert_eq!(h[[2, 2]], 2.0);
        assert_eq!(h[[3, 3]], 0.0);
    }

    #[test]
    fn test_lambda_steps() {
        let linear = LambdaSteps {
            step_type: LambdaStepType::Linear,
            min: 0.0,
            max: 1.0,
            step: 0.25,
        };
        assert_eq!(linear.values(), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        let log = LambdaSteps::default().values();
        assert_eq!(log.len(), 31);
        assert_abs_diff_eq!(log[0], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(log[30], 100.0, epsilon = 1e-9);

        let backwards = BasisConfig::DeltaFunction {
            kernel_size: 5,
            regularization: Some(RegularizationConfig {
                lambda_steps: LambdaSteps {
                    min: 2.0,
                    max: -1.0,
                    ..Default::default()
                },
                ..Default::default()
            }),
        };
        assert!(matches!(
            BasisSet::build(&backwards),
            Err(DiffimError::InvalidBasisConfig(_))
        ));
    }

    #[test]
    fn test_risk_minimizing_lambda_is_a_scanned_step() {
        // noisy observation of a smooth vector: some smoothing must pay off
        let n = 6;
        let h = finite_difference_regularization(n, 1, 1, BoundaryStyle::Unwrapped, DifferenceStyle::Forward);
        let m = Array2::eye(n) * 0.5;
        let truth = Array1::from_elem(n, 1.0);
        let noise = Array1::from(vec![0.9, -1.1, 0.8, -0.7, 1.2, -1.0]);
        let b = m.dot(&(&truth + &noise));
        for lambda_type in [LambdaType::MinimizeBiasedRisk, LambdaType::MinimizeUnbiasedRisk] {
            let reg = Regularization {
                h: h.clone(),
                lambda_type,
                lambda_value: 0.0,
                lambda_steps: LambdaSteps::default(),
            };
            let lambda = reg.lambda(&m, &b, 1e10).unwrap();
            assert!(lambda >= 0.1 - 1e-12 && lambda <= 100.0 + 1e-9, "lambda {}", lambda);
            assert!(
                reg.lambda_steps
                    .values()
                    .iter()
                    .any(|v| (v - lambda).abs() < 1e-12),
                "lambda {} is not on the grid",
                lambda
            );
            // the alternating noise is worth smoothing away
            assert!(lambda > 0.2, "lambda {}", lambda);
        }
    }

    #[test]
    fn test_dependent_alard_lupton_kernels_are_rejected() {
        let repeated = BasisConfig::AlardLupton {
            kernel_size: 11,
            sigmas: vec![1.0, 1.0],
            degrees: vec![0, 0],
        };
        match BasisSet::build(&repeated) {
            Err(DiffimError::InvalidBasisConfig(msg)) => {
                assert!(msg.contains("gaussian 1"), "{}", msg)
            }
            other => panic!("expected InvalidBasisConfig, got {:?}", other.map(|b| b.len())),
        }
        // a gaussian narrower than a pixel has no room for x or y terms
        let narrow = BasisConfig::AlardLupton {
            kernel_size: 11,
            sigmas: vec![0.1, 2.0],
            degrees: vec![2, 0],
        };
        match BasisSet::build(&narrow) {
            Err(DiffimError::InvalidBasisConfig(msg)) => {
                assert!(msg.contains("gaussian 0"), "{}", msg)
            }
            other => panic!("expected InvalidBasisConfig, got {:?}", other.map(|b| b.len())),
        }
    }

    #[test]
    fn test_renormalize_drops_dependent_kernels() {
        let a = Array2::from_shape_fn((3, 3), |(r, c)| if r == 1 && c == 1 { 2.0 } else { 0.5 });
        let b = Array2::from_shape_fn((3, 3), |(r, _)| r as f64);
        let images = renormalize_kernel_list(vec![a.clone(), a * 3.0, b]).unwrap();
        assert_eq!(images.len(), 2);
        assert_abs_diff_eq!(images[0].sum(), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(images[1].sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_config_yaml_tag() {
        let yaml = "family: delta-function\nkernel_size: 7\nregularization:\n  order: 1\n  lambda_type: minimize_unbiased_risk\n  lambda_steps:\n    step_type: linear\n    min: 0.5\n    max: 5.0\n    step: 0.5\n";
        let config: BasisConfig = serde_yaml::from_str(yaml).unwrap();
        match config {
            BasisConfig::DeltaFunction {
                kernel_size,
                regularization: Some(reg),
            } => {
                assert_eq!(kernel_size, 7);
                assert_eq!(reg.order, 1);
                assert_eq!(reg.boundary, BoundaryStyle::Tapered);
                assert_eq!(reg.lambda_type, LambdaType::MinimizeUnbiasedRisk);
                assert_eq!(reg.lambda_steps.step_type, LambdaStepType::Linear);
                assert_eq!(reg.lambda_steps.values().len(), 10);
            }
            other => panic!("unexpected config {:?}", other),
        }
    }
}
