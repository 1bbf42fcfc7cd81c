//! Kernel candidates: a template/science stamp pair at a known position, the
//! kernels fitted to it and the statistics of its residuals.

use ndarray::{Array1, Array2};

use crate::convolve::FixedKernel;
use crate::geom::{BBox, Vec2D};
use crate::image::{MaskPixel, MaskPlane, MaskedImage, MaskedImageView, Pixel};
use crate::linalg::SolvedBy;
use crate::{DiffimError, Result};

/// Reported in place of a chi-square that is not finite.
pub const CHI2_SENTINEL: f64 = 1e30;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CandidateStatus {
    #[default]
    Unknown,
    Good,
    Bad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionReason {
    /// singular or underdetermined normal equations
    IllConditionedFit,
    /// residuals not finite
    NumericOverflow,
    /// single-kernel residual mean or scatter out of range
    ResidualOutlier,
    KernelSumOutlier,
    /// chi-square or residuals too large under the spatial model
    SpatialOutlier,
}

/// Which basis a solution was fitted with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolutionKind {
    Original,
    Pca,
}

/// Residual statistics over the valid, unmasked pixels of a difference image.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FitStatistics {
    pub chi2: f64,
    pub npix: usize,
    pub dof: usize,
    pub rchi2: f64,
    /// mean of residual / sigma
    pub residual_mean: f64,
    /// standard deviation of residual / sigma
    pub residual_rms: f64,
}

impl FitStatistics {
    /// Measure `diff`, skipping `EDGE` pixels and any carrying `bad_bits`.
    /// `n_params` free parameters are removed from the degrees of freedom.
    pub fn measure<T: Pixel>(diff: &MaskedImage<T>, bad_bits: MaskPixel, n_params: usize) -> Self {
        let skip = bad_bits | MaskPlane::Edge.bit();
        let mut chi2 = 0.0;
        let mut sum = 0.0;
        let mut sum_sq = 0.0;
        let mut npix = 0usize;
        let mut finite = true;
        for ((value, variance), mask) in diff.image.iter().zip(diff.variance.iter()).zip(diff.mask.iter()) {
            if mask & skip != 0 {
                continue;
            }
            let (value, variance) = (value.as_f64(), variance.as_f64());
            let z = value / variance.sqrt();
            if !z.is_finite() {
                finite = false;
            }
            chi2 += value * value / variance;
            sum += z;
            sum_sq += z * z;
            npix += 1;
        }

        let dof = npix.saturating_sub(n_params).max(1);
        if !finite || npix == 0 {
            return Self {
                chi2: CHI2_SENTINEL,
                npix,
                dof,
                rchi2: CHI2_SENTINEL,
                residual_mean: f64::NAN,
                residual_rms: f64::NAN,
            };
        }
        let mean = sum / npix as f64;
        let var = (sum_sq / npix as f64 - mean * mean).max(0.0);
        let rchi2 = chi2 / dof as f64;
        Self {
            chi2,
            npix,
            dof,
            rchi2: if rchi2.is_finite() { rchi2 } else { CHI2_SENTINEL },
            residual_mean: mean,
            residual_rms: var.sqrt(),
        }
    }

    /// whether every value is a real measurement rather than the sentinel
    pub fn is_finite(&self) -> bool {
        self.rchi2 < CHI2_SENTINEL && self.residual_mean.is_finite() && self.residual_rms.is_finite()
    }
}

/// Solution of one candidate's normal equations.
#[derive(Clone, Debug)]
pub struct KernelSolution {
    pub coeffs: Vec<f64>,
    pub background: f64,
    pub kernel: FixedKernel,
    /// normal-equations matrix as solved (kernel block first, then background)
    pub m: Array2<f64>,
    pub b: Array1<f64>,
    pub solved_by: SolvedBy,
    /// regularization strength added to `m`, 0 without regularization
    pub lambda: f64,
}

impl KernelSolution {
    pub fn kernel_sum(&self) -> f64 {
        self.kernel.sum()
    }

    /// the kernel-coefficient block of the normal equations
    pub fn kernel_weights(&self) -> Array2<f64> {
        let n = self.coeffs.len();
        self.m.slice(ndarray::s![..n, ..n]).to_owned()
    }

    /// inverse-variance weight of the background term, 0 when not fitted
    pub fn background_weight(&self) -> f64 {
        let n = self.coeffs.len();
        if self.m.nrows() > n {
            self.m[[n, n]]
        } else {
            0.0
        }
    }
}

/// A fitted solution with its difference image and residual statistics.
#[derive(Clone, Debug)]
pub struct CandidateFit<T: Pixel> {
    pub solution: KernelSolution,
    pub difference: MaskedImage<T>,
    pub stats: FitStatistics,
}

#[derive(Debug)]
pub struct KernelCandidate<'a, T: Pixel> {
    id: usize,
    center: Vec2D,
    template: MaskedImageView<'a, T>,
    science: MaskedImageView<'a, T>,
    status: CandidateStatus,
    rejection: Option<RejectionReason>,
    original: Option<CandidateFit<T>>,
    pca: Option<CandidateFit<T>>,
    spatial_stats: Option<FitStatistics>,
}

impl<'a, T: Pixel> KernelCandidate<'a, T> {
    pub fn new(
        id: usize,
        center: Vec2D,
        template: MaskedImageView<'a, T>,
        science: MaskedImageView<'a, T>,
    ) -> Result<Self> {
        if !template.same_shape(&science) || template.bbox() != science.bbox() {
            return Err(DiffimError::DimensionMismatch(format!(
                "candidate {}: template stamp {:?} and science stamp {:?} differ",
                id,
                template.bbox(),
                science.bbox()
            )));
        }
        Ok(Self {
            id,
            center,
            template,
            science,
            status: CandidateStatus::Unknown,
            rejection: None,
            original: None,
            pca: None,
            spatial_stats: None,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn center(&self) -> Vec2D {
        self.center
    }

    pub fn bbox(&self) -> BBox {
        self.science.bbox()
    }

    pub fn template(&self) -> &MaskedImageView<'a, T> {
        &self.template
    }

    pub fn science(&self) -> &MaskedImageView<'a, T> {
        &self.science
    }

    pub fn status(&self) -> CandidateStatus {
        self.status
    }

    pub fn rejection(&self) -> Option<RejectionReason> {
        self.rejection
    }

    pub fn set_status(&mut self, status: CandidateStatus) {
        self.status = status;
        if status != CandidateStatus::Bad {
            self.rejection = None;
        }
    }

    pub fn reject(&mut self, reason: RejectionReason) {
        self.status = CandidateStatus::Bad;
        self.rejection = Some(reason);
    }

    /// Explicitly bring a candidate back for re-evaluation.
    pub fn reset(&mut self) {
        self.set_status(CandidateStatus::Unknown);
    }

    pub fn is_built(&self, kind: SolutionKind) -> bool {
        self.fit_slot(kind).is_some()
    }

    fn fit_slot(&self, kind: SolutionKind) -> Option<&CandidateFit<T>> {
        match kind {
            SolutionKind::Original => self.original.as_ref(),
            SolutionKind::Pca => self.pca.as_ref(),
        }
    }

    pub fn fit(&self, kind: SolutionKind) -> Result<&CandidateFit<T>> {
        self.fit_slot(kind)
            .ok_or(DiffimError::NotInitialized { id: self.id })
    }

    pub fn set_fit(&mut self, kind: SolutionKind, fit: CandidateFit<T>) {
        match kind {
            SolutionKind::Original => self.original = Some(fit),
            SolutionKind::Pca => self.pca = Some(fit),
        }
    }

    pub fn clear_fit(&mut self, kind: SolutionKind) {
        match kind {
            SolutionKind::Original => self.original = None,
            SolutionKind::Pca => self.pca = None,
        }
    }

    pub fn solution(&self, kind: SolutionKind) -> Result<&KernelSolution> {
        Ok(&self.fit(kind)?.solution)
    }

    pub fn kernel_image(&self, kind: SolutionKind) -> Result<&Array2<f64>> {
        Ok(self.solution(kind)?.kernel.image())
    }

    pub fn kernel_sum(&self, kind: SolutionKind) -> Result<f64> {
        Ok(self.solution(kind)?.kernel_sum())
    }

    pub fn background(&self, kind: SolutionKind) -> Result<f64> {
        Ok(self.solution(kind)?.background)
    }

    pub fn difference(&self, kind: SolutionKind) -> Result<&MaskedImage<T>> {
        Ok(&self.fit(kind)?.difference)
    }

    pub fn stats(&self, kind: SolutionKind) -> Result<&FitStatistics> {
        Ok(&self.fit(kind)?.stats)
    }

    /// Ranking score, lower is better: reduced chi-square of the original fit.
    pub fn rating(&self) -> f64 {
        self.original
            .as_ref()
            .map(|fit| fit.stats.rchi2)
            .unwrap_or(CHI2_SENTINEL)
    }

    /// statistics under the latest spatial model
    pub fn spatial_stats(&self) -> Option<&FitStatistics> {
        self.spatial_stats.as_ref()
    }

    pub fn set_spatial_stats(&mut self, stats: FitStatistics) {
        self.spatial_stats = Some(stats);
    }
}
