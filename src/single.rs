//! Least-squares fit of one kernel (and optionally a constant background) to
//! one candidate's stamp pair.

use ndarray::{s, Array1, Array2};
use rayon::prelude::*;
use tracing::debug;

use crate::basis::BasisSet;
use crate::candidate::{
    CandidateFit, CandidateStatus, FitStatistics, KernelCandidate, KernelSolution, RejectionReason,
    SolutionKind,
};
use crate::clipping::median;
use crate::config::PsfMatchConfig;
use crate::convolve::{convolve, difference, grow_mask, FixedKernel};
use crate::image::Pixel;
use crate::linalg::{condition_number, solve_normal_equations};
use crate::{DiffimError, Result};

pub struct SingleKernelSolver<'b> {
    basis: &'b BasisSet,
    config: &'b PsfMatchConfig,
}

impl<'b> SingleKernelSolver<'b> {
    pub fn new(basis: &'b BasisSet, config: &'b PsfMatchConfig) -> Self {
        Self { basis, config }
    }

    pub fn n_params(&self) -> usize {
        self.basis.len() + usize::from(self.config.fit_for_background)
    }

    /// Fit `cand` without touching it. Failures here concern this candidate only.
    pub fn fit<T: Pixel>(&self, cand: &KernelCandidate<'_, T>) -> Result<CandidateFit<T>> {
        let first = self.fit_with_variance(cand, None)?;
        if !self.config.iterate_single_kernel {
            return Ok(first);
        }
        self.fit_with_variance(cand, Some(&first.difference.variance.mapv(|v| v.as_f64())))
    }

    /// One solve of the normal equations. `variance` overrides the default
    /// `var(T) + var(S)` weighting; it has the stamp's shape.
    fn fit_with_variance<T: Pixel>(
        &self,
        cand: &KernelCandidate<'_, T>,
        variance: Option<&Array2<f64>>,
    ) -> Result<CandidateFit<T>> {
        let template = cand.template();
        let science = cand.science();
        let (rows, cols) = (science.height(), science.width());
        let (ker_rows, ker_cols) = self.basis.dimensions();
        if ker_rows > rows || ker_cols > cols {
            return Err(DiffimError::IllConditionedFit(format!(
                "stamp {}x{} smaller than kernel {}x{}",
                cols, rows, ker_cols, ker_rows
            )));
        }
        let (cy, cx) = (ker_rows / 2, ker_cols / 2);
        let (valid_rows, valid_cols) = (rows - ker_rows + 1, cols - ker_cols + 1);

        let template_image = template.image_f64();
        let convolved: Vec<Array2<f64>> = self
            .basis
            .kernels()
            .iter()
            .map(|k| convolve(&template_image.view(), &k.image().view()))
            .collect();

        let stamp_variance = match variance {
            Some(v) => v.clone(),
            None => template.variance_f64() + science.variance_f64(),
        };
        let bad = self.config.bad_bits();
        let template_bits = grow_mask(&template.mask, cy, cx);

        // usable pixels, as stamp indices
        let mut pixels = Vec::with_capacity(valid_rows * valid_cols);
        for r in cy..cy + valid_rows {
            for c in cx..cx + valid_cols {
                let masked = (science.mask[[r, c]] | template_bits[[r, c]]) & bad != 0;
                let value = science.image[[r, c]].as_f64();
                let var = stamp_variance[[r, c]];
                if !masked && value.is_finite() && var.is_finite() && var > 0.0 {
                    pixels.push((r, c));
                }
            }
        }

        let n_basis = self.basis.len();
        let n_params = self.n_params();
        if pixels.len() < n_params {
            return Err(DiffimError::IllConditionedFit(format!(
                "{} usable pixels for {} parameters",
                pixels.len(),
                n_params
            )));
        }

        let flat_variance = if self.config.constant_variance_weighting {
            let values: Vec<f64> = pixels.iter().map(|&(r, c)| stamp_variance[[r, c]]).collect();
            let med = median(&values);
            Some(if med > 0.0 && med.is_finite() { med } else { 1.0 })
        } else {
            None
        };

        // weighted design matrix, one row per pixel
        let mut design = Array2::<f64>::zeros((pixels.len(), n_params));
        let mut weighted = Array2::<f64>::zeros((pixels.len(), n_params));
        let mut target = Array1::<f64>::zeros(pixels.len());
        for (i, &(r, c)) in pixels.iter().enumerate() {
            let w = 1.0 / flat_variance.unwrap_or(stamp_variance[[r, c]]);
            for (k, conv) in convolved.iter().enumerate() {
                design[[i, k]] = conv[[r - cy, c - cx]];
            }
            if self.config.fit_for_background {
                design[[i, n_basis]] = 1.0;
            }
            weighted.row_mut(i).assign(&(&design.row(i) * w));
            target[i] = science.image[[r, c]].as_f64();
        }
        let mut m = design.t().dot(&weighted);
        let b = weighted.t().dot(&target);

        let lambda = match self.basis.regularization() {
            Some(reg) => {
                let lambda = reg.lambda(&m, &b, self.config.max_condition_number)?;
                debug!("candidate {} regularized with lambda {:.3e}", cand.id(), lambda);
                m.scaled_add(lambda, &reg.penalty(n_params));
                lambda
            }
            None => 0.0,
        };

        if self.config.check_condition_number {
            let cond = condition_number(&m);
            if cond > self.config.max_condition_number {
                return Err(DiffimError::IllConditionedFit(format!(
                    "condition number {:.3e} exceeds {:.3e}",
                    cond, self.config.max_condition_number
                )));
            }
        }

        let (x, solved_by) = solve_normal_equations(&m, &b)?;
        let coeffs = x.slice(s![..n_basis]).to_vec();
        let background = if self.config.fit_for_background { x[n_basis] } else { 0.0 };
        let kernel = FixedKernel::new(self.basis.combine(&coeffs)?)?;

        let diff = difference(template, science, &kernel, &background)?;
        let stats = FitStatistics::measure(&diff, bad, n_params);
        if !stats.is_finite() {
            return Err(DiffimError::NumericOverflow(format!(
                "candidate {} residuals are not finite",
                cand.id()
            )));
        }

        Ok(CandidateFit {
            solution: KernelSolution {
                coeffs,
                background,
                kernel,
                m,
                b,
                solved_by,
                lambda,
            },
            difference: diff,
            stats,
        })
    }

    /// Fit `cand` and record the outcome: the solution on success, `BAD` with a
    /// reason on a candidate-local failure or a residual outlier.
    pub fn build<T: Pixel>(&self, cand: &mut KernelCandidate<'_, T>, kind: SolutionKind) -> Result<()> {
        match self.fit(cand) {
            Ok(fit) => {
                let stats = fit.stats.clone();
                cand.set_fit(kind, fit);
                let outlier = self.config.single_kernel_clipping
                    && (stats.residual_mean.abs() > self.config.candidate_residual_mean_max
                        || stats.residual_rms > self.config.candidate_residual_std_max);
                if outlier {
                    debug!(
                        "candidate {} rejected: residual mean {:.3}, rms {:.3}",
                        cand.id(),
                        stats.residual_mean,
                        stats.residual_rms
                    );
                    cand.reject(RejectionReason::ResidualOutlier);
                } else {
                    debug!("candidate {} fit, rchi2 {:.3}", cand.id(), stats.rchi2);
                    cand.set_status(CandidateStatus::Good);
                }
                Ok(())
            }
            Err(e) if e.is_candidate_local() => {
                debug!("candidate {} rejected: {}", cand.id(), e);
                let reason = match e {
                    DiffimError::NumericOverflow(_) => RejectionReason::NumericOverflow,
                    _ => RejectionReason::IllConditionedFit,
                };
                cand.clear_fit(kind);
                cand.reject(reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Fit every candidate given, in parallel. Returns how many ended up GOOD.
    pub fn build_all<T: Pixel>(
        &self,
        candidates: Vec<&mut KernelCandidate<'_, T>>,
        kind: SolutionKind,
    ) -> Result<usize> {
        candidates
            .into_par_iter()
            .map(|cand| -> Result<usize> {
                self.build(cand, kind)?;
                Ok(usize::from(cand.status() == CandidateStatus::Good))
            })
            .sum()
    }
}
