//! The outlier-rejection loop that drives single-kernel fits, the spatial
//! solve and assessment to a stable spatial model.

use tracing::{debug, info, warn};

use crate::assess::AssessmentController;
use crate::basis::BasisSet;
use crate::candidate::{CandidateStatus, KernelCandidate, SolutionKind};
use crate::cells::KernelCellSet;
use crate::clipping::clip_kernel_sums;
use crate::config::PsfMatchConfig;
use crate::convolve::difference;
use crate::footprint::{make_candidates, Ineligible};
use crate::geom::Vec2D;
use crate::image::{MaskedImage, Pixel};
use crate::pca::build_pca_basis;
use crate::single::SingleKernelSolver;
use crate::spatial::{SpatialKernelSolver, SpatialModel};
use crate::{DiffimError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitStatus {
    /// an assessment pass rejected nothing
    Converged,
    /// stopped at the iteration cap with the last model
    IterationLimit,
    /// the last model rejected every candidate it was assessed against
    AllRejected,
}

#[derive(Clone, Debug)]
pub struct FitResult {
    pub model: SpatialModel,
    /// `Original`, or `Pca` when the model is expressed in a PCA basis
    pub kind: SolutionKind,
    pub status: FitStatus,
    pub iterations: usize,
    pub n_good: usize,
    pub n_bad: usize,
}

impl FitResult {
    /// the basis the spatial kernel is expressed in
    pub fn basis(&self) -> &BasisSet {
        self.model.kernel.basis()
    }
}

pub struct PsfMatch {
    config: PsfMatchConfig,
    basis: BasisSet,
}

impl PsfMatch {
    pub fn new(config: PsfMatchConfig) -> Result<Self> {
        config.validate()?;
        let basis = BasisSet::build(&config.basis)?;
        Ok(Self { config, basis })
    }

    pub fn config(&self) -> &PsfMatchConfig {
        &self.config
    }

    pub fn basis(&self) -> &BasisSet {
        &self.basis
    }

    /// Form candidates at `positions` and grid them over the science image.
    pub fn make_cell_set<'a, T: Pixel>(
        &self,
        template: &'a MaskedImage<T>,
        science: &'a MaskedImage<T>,
        positions: &[Vec2D],
    ) -> Result<(KernelCellSet<'a, T>, Vec<(Vec2D, Ineligible)>)> {
        let list = make_candidates(template, science, positions, &self.config)?;
        let cells = KernelCellSet::from_candidates(
            science.bbox(),
            self.config.size_cell_x,
            self.config.size_cell_y,
            list.candidates,
        )?;
        Ok((cells, list.ineligible))
    }

    /// Fit single kernels to every selected candidate still lacking one,
    /// until the selection holds only fitted candidates.
    fn build_selected<T: Pixel>(
        &self,
        cells: &mut KernelCellSet<'_, T>,
        solver: &SingleKernelSolver<'_>,
    ) -> Result<()> {
        loop {
            cells.sort_cells();
            let unbuilt: Vec<usize> = cells
                .selection(self.config.n_star_per_cell)
                .into_iter()
                .filter(|&i| !cells.candidates()[i].is_built(SolutionKind::Original))
                .collect();
            if unbuilt.is_empty() {
                return Ok(());
            }
            let n_good = solver.build_all(cells.select_mut(&unbuilt), SolutionKind::Original)?;
            debug!("built {} single kernels, {} good", unbuilt.len(), n_good);
        }
    }

    fn selected_good<'c, 'a, T: Pixel>(
        &self,
        cells: &'c KernelCellSet<'a, T>,
        kind: SolutionKind,
    ) -> Vec<&'c KernelCandidate<'a, T>> {
        cells
            .selection(self.config.n_star_per_cell)
            .into_iter()
            .map(|i| &cells.candidates()[i])
            .filter(|c| c.status() == CandidateStatus::Good && c.is_built(kind))
            .collect()
    }

    /// Run the fit. Candidate statuses and diagnostics are left in `cells`
    /// whatever the outcome. `NoGoodCandidates` only when no spatial model
    /// could be solved at all; once one exists it is returned, even if it
    /// rejects every candidate.
    pub fn fit<T: Pixel>(&self, cells: &mut KernelCellSet<'_, T>) -> Result<FitResult> {
        let n_candidates = cells.len();
        let single = SingleKernelSolver::new(&self.basis, &self.config);
        let max_iterations = self.config.max_spatial_iterations;

        let mut iteration = 0;
        loop {
            iteration += 1;
            self.build_selected(cells, &single)?;

            if self.config.kernel_sum_clipping {
                let selection = cells.selection(self.config.n_star_per_cell);
                let clipped = clip_kernel_sums(
                    &mut cells.select_mut(&selection),
                    SolutionKind::Original,
                    self.config.max_ksum_sigma,
                )?;
                if !clipped.is_empty() {
                    debug!("kernel sum clipping rejected {:?}", clipped);
                    self.build_selected(cells, &single)?;
                }
            }

            let (kind, pca_basis) = if self.config.use_pca_for_spatial_kernel {
                let good = self.selected_good(cells, SolutionKind::Original);
                if good.is_empty() {
                    return Err(DiffimError::NoGoodCandidates { n_candidates });
                }
                let pca = build_pca_basis(
                    &good,
                    self.config.num_principal_components,
                    self.config.subtract_mean_for_pca,
                )?;
                let selection = cells.selection(self.config.n_star_per_cell);
                SingleKernelSolver::new(&pca, &self.config)
                    .build_all(cells.select_mut(&selection), SolutionKind::Pca)?;
                (SolutionKind::Pca, Some(pca))
            } else {
                (SolutionKind::Original, None)
            };
            let basis = pca_basis.as_ref().unwrap_or(&self.basis);

            let good = self.selected_good(cells, kind);
            if good.is_empty() {
                return Err(DiffimError::NoGoodCandidates { n_candidates });
            }
            let model = SpatialKernelSolver::new(
                basis,
                *cells.bbox(),
                self.config.spatial_kernel_order,
                self.config.spatial_bg_order,
                self.config.spatial_model_type,
                self.config.fit_for_background,
            )
            .solve(&good, kind)?;

            // judge the selection; refresh diagnostics of everything already rejected
            let mut to_assess = cells.selection(self.config.n_star_per_cell);
            to_assess.extend(
                cells
                    .candidates()
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.status() == CandidateStatus::Bad)
                    .map(|(i, _)| i),
            );
            let mut controller = AssessmentController::new(&model, &self.config);
            let rejected = controller.assess_all(cells.select_mut(&to_assess))?;

            let n_good = cells.count(CandidateStatus::Good);
            let n_bad = cells.count(CandidateStatus::Bad);
            info!(
                "iteration {}: {} candidates assessed, {} rejected, {} good, {} bad",
                iteration, controller.n_processed, rejected, n_good, n_bad
            );
            let status = if n_good == 0 {
                warn!("spatial model rejected every candidate; keeping it anyway");
                FitStatus::AllRejected
            } else if rejected == 0 {
                FitStatus::Converged
            } else if iteration >= max_iterations {
                warn!(
                    "spatial fit still rejecting candidates after {} iterations; keeping last model",
                    iteration
                );
                FitStatus::IterationLimit
            } else {
                continue;
            };
            return Ok(FitResult {
                model,
                kind,
                status,
                iterations: iteration,
                n_good,
                n_bad,
            });
        }
    }

    /// Difference of full images under a fitted model.
    pub fn subtract<T: Pixel>(
        &self,
        template: &MaskedImage<T>,
        science: &MaskedImage<T>,
        result: &FitResult,
    ) -> Result<MaskedImage<T>> {
        difference(
            &template.view(),
            &science.view(),
            &result.model.kernel,
            &result.model.background,
        )
    }
}
