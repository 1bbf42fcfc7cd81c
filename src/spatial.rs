//! The spatially varying kernel and background, and the global least-squares
//! solve that ties every candidate's kernel coefficients to smooth functions of
//! position.

use ndarray::parallel::prelude::*;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use tracing::{debug, warn};

use crate::basis::BasisSet;
use crate::candidate::{CandidateStatus, KernelCandidate, SolutionKind};
use crate::convolve::{convolve, ConvolutionKernel};
use crate::geom::{BBox, Vec2D};
use crate::image::Pixel;
use crate::linalg::{pseudo_solve, solve_normal_equations, SolvedBy};
use crate::spatial_function::{n_terms, SpatialBasis, SpatialFunction, SpatialModelType};
use crate::{DiffimError, Result};

const PSEUDO_INVERSE_RCOND: f64 = 1e-12;

/// A linear combination of basis kernels whose coefficients are functions of
/// position.
#[derive(Clone, Debug)]
pub struct SpatialKernel {
    basis: BasisSet,
    /// one row per basis kernel, one column per spatial term
    coeffs: Array2<f64>,
    function: SpatialFunction,
    constant_first_term: bool,
}

impl SpatialKernel {
    pub fn new(
        basis: BasisSet,
        function: SpatialFunction,
        coeffs: Array2<f64>,
        constant_first_term: bool,
    ) -> Result<Self> {
        let expected = (basis.len(), n_terms(function.order));
        if coeffs.dim() != expected {
            return Err(DiffimError::DimensionMismatch(format!(
                "spatial coefficients {:?}, expected {:?}",
                coeffs.dim(),
                expected
            )));
        }
        Ok(Self {
            basis,
            coeffs,
            function,
            constant_first_term,
        })
    }

    pub fn basis(&self) -> &BasisSet {
        &self.basis
    }

    pub fn coeffs(&self) -> &Array2<f64> {
        &self.coeffs
    }

    pub fn order(&self) -> usize {
        self.function.order
    }

    pub fn constant_first_term(&self) -> bool {
        self.constant_first_term
    }

    /// basis coefficients at (x, y)
    pub fn coefficients_at(&self, x: f64, y: f64) -> Array1<f64> {
        let terms = self.function.terms(&Vec2D { x, y });
        self.coeffs.dot(&terms)
    }

    pub fn kernel_sum_at(&self, x: f64, y: f64) -> f64 {
        let coeffs = self.coefficients_at(x, y);
        self.basis
            .kernels()
            .iter()
            .zip(coeffs.iter())
            .map(|(k, c)| c * k.sum())
            .sum()
    }
}

impl ConvolutionKernel for SpatialKernel {
    fn dimensions(&self) -> (usize, usize) {
        self.basis.dimensions()
    }

    fn image_at(&self, x: f64, y: f64) -> Array2<f64> {
        let coeffs = self.coefficients_at(x, y);
        let mut out = Array2::zeros(self.basis.dimensions());
        for (kernel, c) in self.basis.kernels().iter().zip(coeffs.iter()) {
            out.scaled_add(*c, kernel.image());
        }
        out
    }

    /// Convolve with every basis kernel, then combine per pixel with the
    /// coefficients at that pixel's parent position.
    fn convolve_valid(&self, image: &ArrayView2<f64>, x0: i32, y0: i32) -> Array2<f64> {
        let (ker_rows, ker_cols) = self.dimensions();
        let convolved: Vec<Array2<f64>> = self
            .basis
            .kernels()
            .iter()
            .map(|k| convolve(image, &k.image().view()))
            .collect();
        let (rows, cols) = convolved[0].dim();
        let (cy, cx) = ((ker_rows / 2) as i32, (ker_cols / 2) as i32);

        let mut output = Array2::zeros((rows, cols));
        output
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .enumerate()
            .for_each(|(r, mut row)| {
                let y = (y0 + cy + r as i32) as f64;
                for c in 0..cols {
                    let x = (x0 + cx + c as i32) as f64;
                    let coeffs = self.coefficients_at(x, y);
                    row[c] = convolved
                        .iter()
                        .zip(coeffs.iter())
                        .map(|(conv, a)| a * conv[[r, c]])
                        .sum();
                }
            });
        output
    }
}

/// The fitted spatial kernel and background.
#[derive(Clone, Debug)]
pub struct SpatialModel {
    pub kernel: SpatialKernel,
    pub background: SpatialFunction,
    /// how the kernel coefficients were solved; `PseudoInverse` marks a
    /// singular system that was only fit in the least-norm sense
    pub solved_by: SolvedBy,
}

impl SpatialModel {
    pub fn kernel_image_at(&self, x: f64, y: f64) -> Array2<f64> {
        self.kernel.image_at(x, y)
    }

    pub fn kernel_sum_at(&self, x: f64, y: f64) -> f64 {
        self.kernel.kernel_sum_at(x, y)
    }

    pub fn background_at(&self, x: f64, y: f64) -> f64 {
        self.background.eval(&Vec2D { x, y })
    }
}

/// Global least-squares fit of spatial coefficients over GOOD candidates.
///
/// Each candidate contributes its single-kernel coefficients `c_i`, weighted by
/// the kernel block `W_i` of its normal equations: the solve minimizes
/// `sum_i (P_i a - c_i)^T W_i (P_i a - c_i)` where `P_i` evaluates the spatial
/// terms at the candidate's center.
pub struct SpatialKernelSolver<'b> {
    basis: &'b BasisSet,
    bbox: BBox,
    kernel_order: usize,
    bg_order: usize,
    model_type: SpatialModelType,
    fit_for_background: bool,
}

struct Observation {
    pos: Vec2D,
    coeffs: Array1<f64>,
    weights: Array2<f64>,
    background: f64,
    background_weight: f64,
}

impl<'b> SpatialKernelSolver<'b> {
    pub fn new(
        basis: &'b BasisSet,
        bbox: BBox,
        kernel_order: usize,
        bg_order: usize,
        model_type: SpatialModelType,
        fit_for_background: bool,
    ) -> Self {
        Self {
            basis,
            bbox,
            kernel_order,
            bg_order,
            model_type,
            fit_for_background,
        }
    }

    fn constant_first_term(&self) -> bool {
        self.basis.first_term_is_flux()
    }

    /// fewest GOOD candidates that constrain the model
    pub fn required_candidates(&self) -> usize {
        let kernel = n_terms(self.kernel_order);
        if self.fit_for_background {
            kernel.max(n_terms(self.bg_order))
        } else {
            kernel
        }
    }

    fn observations<T: Pixel>(
        &self,
        candidates: &[&KernelCandidate<'_, T>],
        kind: SolutionKind,
    ) -> Result<Vec<Observation>> {
        let mut obs = Vec::new();
        for cand in candidates.iter().filter(|c| c.status() == CandidateStatus::Good) {
            let solution = cand.solution(kind)?;
            if solution.coeffs.len() != self.basis.len() {
                return Err(DiffimError::DimensionMismatch(format!(
                    "candidate {} has {} coefficients for {} basis kernels",
                    cand.id(),
                    solution.coeffs.len(),
                    self.basis.len()
                )));
            }
            obs.push(Observation {
                pos: cand.center(),
                coeffs: Array1::from_vec(solution.coeffs.clone()),
                weights: solution.kernel_weights(),
                background: solution.background,
                background_weight: solution.background_weight(),
            });
        }
        let required = self.required_candidates();
        if obs.len() < required {
            return Err(DiffimError::DegenerateSpatialModel {
                available: obs.len(),
                required,
            });
        }
        Ok(obs)
    }

    /// Fit the spatial model to the GOOD candidates among `candidates`. At
    /// spatial order 0 the kernel is a matrix-weighted mean of the
    /// per-candidate coefficients.
    pub fn solve<T: Pixel>(
        &self,
        candidates: &[&KernelCandidate<'_, T>],
        kind: SolutionKind,
    ) -> Result<SpatialModel> {
        let obs = self.observations(candidates, kind)?;
        let (coeffs, solved_by) = if self.kernel_order == 0 {
            self.weighted_mean(&obs)?
        } else {
            self.assemble_and_solve(&obs)?
        };
        self.finish(&obs, coeffs, solved_by)
    }

    /// The general assembly, at any order including 0.
    pub fn solve_polynomial<T: Pixel>(
        &self,
        candidates: &[&KernelCandidate<'_, T>],
        kind: SolutionKind,
    ) -> Result<SpatialModel> {
        let obs = self.observations(candidates, kind)?;
        let (coeffs, solved_by) = self.assemble_and_solve(&obs)?;
        self.finish(&obs, coeffs, solved_by)
    }

    fn finish(&self, obs: &[Observation], coeffs: Array2<f64>, solved_by: SolvedBy) -> Result<SpatialModel> {
        let function = SpatialFunction::new(self.model_type, self.kernel_order, self.bbox);
        let kernel = SpatialKernel::new(self.basis.clone(), function, coeffs, self.constant_first_term())?;
        let background = self.solve_background(obs)?;
        Ok(SpatialModel {
            kernel,
            background,
            solved_by,
        })
    }

    fn solve_system(&self, m: &Array2<f64>, b: &Array1<f64>) -> Result<(Array1<f64>, SolvedBy)> {
        match solve_normal_equations(m, b) {
            Ok(solution) => Ok(solution),
            Err(DiffimError::IllConditionedFit(msg)) => {
                warn!("spatial solve falling back to pseudo-inverse: {}", msg);
                Ok((pseudo_solve(m, b, PSEUDO_INVERSE_RCOND)?, SolvedBy::PseudoInverse))
            }
            Err(e) => Err(e),
        }
    }

    fn weighted_mean(&self, obs: &[Observation]) -> Result<(Array2<f64>, SolvedBy)> {
        let n = self.basis.len();
        let mut m = Array2::<f64>::zeros((n, n));
        let mut b = Array1::<f64>::zeros(n);
        for o in obs {
            m += &o.weights;
            b += &o.weights.dot(&o.coeffs);
        }
        let (x, solved_by) = self.solve_system(&m, &b)?;
        Ok((x.insert_axis(Axis(1)), solved_by))
    }

    fn assemble_and_solve(&self, obs: &[Observation]) -> Result<(Array2<f64>, SolvedBy)> {
        let n_basis = self.basis.len();
        let nt = n_terms(self.kernel_order);
        let constant = self.constant_first_term();
        // unknowns of basis k start at offsets[k] and span widths[k]
        let widths: Vec<usize> = (0..n_basis)
            .map(|k| if constant && k == 0 { 1 } else { nt })
            .collect();
        let offsets: Vec<usize> = widths
            .iter()
            .scan(0, |acc, w| {
                let start = *acc;
                *acc += w;
                Some(start)
            })
            .collect();
        let n_unknowns: usize = widths.iter().sum();

        let function = SpatialFunction::new(self.model_type, self.kernel_order, self.bbox);
        let mut m = Array2::<f64>::zeros((n_unknowns, n_unknowns));
        let mut b = Array1::<f64>::zeros(n_unknowns);
        for o in obs {
            let phi = function.terms(&o.pos);
            let wc = o.weights.dot(&o.coeffs);
            for k in 0..n_basis {
                for t in 0..widths[k] {
                    b[offsets[k] + t] += wc[k] * phi[t];
                }
                for l in 0..n_basis {
                    let w = o.weights[[k, l]];
                    if w == 0.0 {
                        continue;
                    }
                    for t in 0..widths[k] {
                        for u in 0..widths[l] {
                            m[[offsets[k] + t, offsets[l] + u]] += w * phi[t] * phi[u];
                        }
                    }
                }
            }
        }
        debug!(
            "spatial system: {} unknowns from {} candidates",
            n_unknowns,
            obs.len()
        );
        let (x, solved_by) = self.solve_system(&m, &b)?;

        let mut coeffs = Array2::<f64>::zeros((n_basis, nt));
        for k in 0..n_basis {
            for t in 0..widths[k] {
                coeffs[[k, t]] = x[offsets[k] + t];
            }
        }
        Ok((coeffs, solved_by))
    }

    fn solve_background(&self, obs: &[Observation]) -> Result<SpatialFunction> {
        if !self.fit_for_background {
            return Ok(SpatialFunction::new(self.model_type, 0, self.bbox));
        }
        let mut function = SpatialFunction::new(self.model_type, self.bg_order, self.bbox);
        let positions: Vec<Vec2D> = obs.iter().map(|o| o.pos).collect();
        let values: Vec<f64> = obs.iter().map(|o| o.background).collect();
        let weights: Vec<f64> = obs.iter().map(|o| o.background_weight).collect();
        function.solve_for_coeffs(&positions, &values, &weights)?;
        Ok(function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::BasisConfig;
    use approx::assert_abs_diff_eq;

    fn basis() -> BasisSet {
        BasisSet::build(&BasisConfig::AlardLupton {
            kernel_size: 7,
            sigmas: vec![1.0, 2.0],
            degrees: vec![1, 0],
        })
        .unwrap()
    }

    #[test]
    fn test_constant_kernel_matches_basis_combination() {
        let basis = basis();
        let coeffs = Array2::from_shape_vec((4, 1), vec![1.2, 0.1, -0.05, 0.3]).unwrap();
        let function = SpatialFunction::new(SpatialModelType::Polynomial, 0, BBox::new(0, 0, 99, 99));
        let kernel = SpatialKernel::new(basis.clone(), function, coeffs, true).unwrap();
        let expected = basis.combine(&[1.2, 0.1, -0.05, 0.3]).unwrap();
        let image = kernel.image_at(13.0, 71.0);
        for (a, b) in image.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-14);
        }
        // only the first kernel carries flux
        assert_abs_diff_eq!(kernel.kernel_sum_at(40.0, 2.0), 1.2, epsilon = 1e-12);
    }

    #[test]
    fn test_varying_kernel_convolution_matches_local_kernel() {
        let basis = basis();
        let mut coeffs = Array2::zeros((4, 3));
        coeffs[[0, 0]] = 1.0;
        coeffs[[1, 1]] = 0.4;
        coeffs[[2, 2]] = -0.3;
        coeffs[[3, 0]] = 0.2;
        let function = SpatialFunction::new(SpatialModelType::Chebyshev1, 1, BBox::new(0, 0, 49, 49));
        let kernel = SpatialKernel::new(basis, function, coeffs, true).unwrap();

        let image = Array2::from_shape_fn((30, 30), |(r, c)| ((r * 31 + c * 17) % 13) as f64);
        let (x0, y0) = (10, 5);
        let out = kernel.convolve_valid(&image.view(), x0, y0);
        assert_eq!(out.dim(), (24, 24));
        // output pixel (r, c) sits at image pixel (r + 3, c + 3)
        for (r, c) in [(0, 0), (11, 20), (23, 23)] {
            let local = kernel.image_at((x0 + 3 + c as i32) as f64, (y0 + 3 + r as i32) as f64);
            let window = image.slice(ndarray::s![r..r + 7, c..c + 7]);
            let expected = convolve(&window, &local.view())[[0, 0]];
            assert_abs_diff_eq!(out[[r, c]], expected, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_rejects_wrong_coefficient_shape() {
        let function = SpatialFunction::new(SpatialModelType::Polynomial, 2, BBox::new(0, 0, 9, 9));
        assert!(SpatialKernel::new(basis(), function, Array2::zeros((4, 3)), true).is_err());
    }

    #[test]
    fn test_required_candidates() {
        let basis = basis();
        let bbox = BBox::new(0, 0, 99, 99);
        let solver = SpatialKernelSolver::new(&basis, bbox, 1, 2, SpatialModelType::Polynomial, true);
        assert_eq!(solver.required_candidates(), 6);
        let solver = SpatialKernelSolver::new(&basis, bbox, 2, 2, SpatialModelType::Polynomial, false);
        assert_eq!(solver.required_candidates(), 6);
        let solver = SpatialKernelSolver::new(&basis, bbox, 0, 0, SpatialModelType::Polynomial, false);
        assert_eq!(solver.required_candidates(), 1);
    }

    fn observation(x: f64, y: f64, coeffs: &[f64]) -> Observation {
        Observation {
            pos: Vec2D { x, y },
            coeffs: Array1::from_vec(coeffs.to_vec()),
            weights: Array2::eye(coeffs.len()),
            background: 0.0,
            background_weight: 1.0,
        }
    }

    #[test]
    fn test_singular_spatial_system_uses_pseudo_inverse() {
        let basis = basis();
        let bbox = BBox::new(0, 0, 99, 99);
        let solver = SpatialKernelSolver::new(&basis, bbox, 1, 0, SpatialModelType::Polynomial, false);
        let c = [1.0, 0.2, -0.1, 0.05];

        // spread positions pin down the linear terms
        let spread = [
            observation(10.0, 10.0, &c),
            observation(90.0, 10.0, &c),
            observation(50.0, 80.0, &c),
        ];
        let (_, solved_by) = solver.assemble_and_solve(&spread).unwrap();
        assert_ne!(solved_by, SolvedBy::PseudoInverse);

        // a single position leaves the gradients free
        let stacked = [
            observation(20.0, 30.0, &c),
            observation(20.0, 30.0, &c),
            observation(20.0, 30.0, &c),
        ];
        let (coeffs, solved_by) = solver.assemble_and_solve(&stacked).unwrap();
        assert_eq!(solved_by, SolvedBy::PseudoInverse);
        let model = solver.finish(&stacked, coeffs, solved_by).unwrap();
        assert_eq!(model.solved_by, SolvedBy::PseudoInverse);
        let at = model.kernel.coefficients_at(20.0, 30.0);
        for (a, b) in at.iter().zip(c.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-8);
        }
    }
}
