//! Scoring candidates against the spatial model.

use rayon::prelude::*;
use tracing::debug;

use crate::candidate::{CandidateStatus, FitStatistics, KernelCandidate, RejectionReason};
use crate::config::PsfMatchConfig;
use crate::convolve::{difference, FixedKernel};
use crate::image::Pixel;
use crate::spatial::SpatialModel;
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Outcome {
    Accepted,
    Rejected,
    /// already BAD; statistics refreshed only
    Skipped,
}

/// Residuals of each candidate under the model held fixed.
pub fn spatial_residual_stats<T: Pixel>(
    cand: &KernelCandidate<'_, T>,
    model: &SpatialModel,
    bad_bits: u32,
) -> Result<FitStatistics> {
    let center = cand.center();
    let kernel = FixedKernel::new(model.kernel_image_at(center.x, center.y))?;
    let background = model.background_at(center.x, center.y);
    let diff = difference(cand.template(), cand.science(), &kernel, &background)?;
    Ok(FitStatistics::measure(&diff, bad_bits, 0))
}

/// Marks candidates BAD when they disagree with the spatial model, and keeps
/// count of how many it looked at and threw out.
pub struct AssessmentController<'m> {
    model: &'m SpatialModel,
    config: &'m PsfMatchConfig,
    pub n_processed: usize,
    pub n_rejected: usize,
}

impl<'m> AssessmentController<'m> {
    pub fn new(model: &'m SpatialModel, config: &'m PsfMatchConfig) -> Self {
        Self {
            model,
            config,
            n_processed: 0,
            n_rejected: 0,
        }
    }

    fn assess<T: Pixel>(&self, cand: &mut KernelCandidate<'_, T>) -> Result<Outcome> {
        let stats = spatial_residual_stats(cand, self.model, self.config.bad_bits())?;
        let was_bad = cand.status() == CandidateStatus::Bad;
        cand.set_spatial_stats(stats.clone());
        if was_bad {
            return Ok(Outcome::Skipped);
        }

        let reason = if !stats.is_finite() {
            Some(RejectionReason::NumericOverflow)
        } else if stats.rchi2 > self.config.max_reduced_chi2 {
            Some(RejectionReason::SpatialOutlier)
        } else if self.config.spatial_kernel_clipping
            && (stats.residual_mean.abs() > self.config.candidate_residual_mean_max
                || stats.residual_rms > self.config.candidate_residual_std_max)
        {
            Some(RejectionReason::SpatialOutlier)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                debug!(
                    "candidate {} rejected by spatial model: rchi2 {:.3}, mean {:.3}, rms {:.3}",
                    cand.id(),
                    stats.rchi2,
                    stats.residual_mean,
                    stats.residual_rms
                );
                cand.reject(reason);
                Ok(Outcome::Rejected)
            }
            None => {
                cand.set_status(CandidateStatus::Good);
                Ok(Outcome::Accepted)
            }
        }
    }

    /// Assess every candidate given, in parallel. BAD candidates get fresh
    /// statistics but are never brought back. Returns the number rejected in
    /// this call.
    pub fn assess_all<T: Pixel>(&mut self, candidates: Vec<&mut KernelCandidate<'_, T>>) -> Result<usize> {
        let outcomes = candidates
            .into_par_iter()
            .map(|cand| self.assess(cand))
            .collect::<Result<Vec<Outcome>>>()?;

        let processed = outcomes.iter().filter(|o| **o != Outcome::Skipped).count();
        let rejected = outcomes.iter().filter(|o| **o == Outcome::Rejected).count();
        self.n_processed += processed;
        self.n_rejected += rejected;
        Ok(rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basis::{BasisConfig, BasisSet};
    use crate::geom::{BBox, Vec2D};
    use crate::image::MaskedImage;
    use crate::linalg::SolvedBy;
    use crate::spatial::SpatialKernel;
    use crate::spatial_function::{SpatialFunction, SpatialModelType};
    use ndarray::Array2;

    fn identity_model() -> SpatialModel {
        let basis = BasisSet::build(&BasisConfig::DeltaFunction {
            kernel_size: 3,
            regularization: None,
        })
        .unwrap();
        let bbox = BBox::new(0, 0, 99, 99);
        let mut coeffs = Array2::zeros((9, 1));
        coeffs[[4, 0]] = 1.0;
        let function = SpatialFunction::new(SpatialModelType::Polynomial, 0, bbox);
        SpatialModel {
            kernel: SpatialKernel::new(basis, function.clone(), coeffs, false).unwrap(),
            background: function,
            solved_by: SolvedBy::Cholesky,
        }
    }

    fn stamp(offset: f64) -> MaskedImage<f64> {
        let mut mi = MaskedImage::new(11, 11).with_origin(20, 20);
        mi.fill_variance(0.5);
        for ((r, c), v) in mi.image.indexed_iter_mut() {
            *v = (r * c) as f64 + offset;
        }
        mi
    }

    #[test]
    fn test_rejects_inconsistent_candidate_only() {
        let model = identity_model();
        let config = PsfMatchConfig::default();
        let template = stamp(0.0);
        let matching = stamp(0.0);
        let offset = stamp(5.0);
        let center = Vec2D { x: 25.0, y: 25.0 };
        let mut good = KernelCandidate::new(0, center, template.view(), matching.view()).unwrap();
        let mut bad = KernelCandidate::new(1, center, template.view(), offset.view()).unwrap();
        good.set_status(CandidateStatus::Good);
        bad.set_status(CandidateStatus::Good);

        let mut controller = AssessmentController::new(&model, &config);
        let rejected = controller.assess_all(vec![&mut good, &mut bad]).unwrap();
        assert_eq!(rejected, 1);
        assert_eq!(controller.n_processed, 2);
        assert_eq!(controller.n_rejected, 1);
        assert_eq!(good.status(), CandidateStatus::Good);
        assert_eq!(bad.status(), CandidateStatus::Bad);
        assert_eq!(good.spatial_stats().unwrap().rchi2, 0.0);

        // a second pass refreshes statistics but keeps the rejection
        let rejected = controller.assess_all(vec![&mut good, &mut bad]).unwrap();
        assert_eq!(rejected, 0);
        assert_eq!(bad.status(), CandidateStatus::Bad);
        assert!(bad.spatial_stats().unwrap().rchi2 > 3.0);
        assert_eq!(controller.n_processed, 3);
    }
}
