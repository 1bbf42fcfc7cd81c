use std::fs::File;

use serde::{Deserialize, Serialize};

use crate::basis::BasisConfig;
use crate::image::{MaskPixel, MaskPlane};
use crate::spatial_function::SpatialModelType;
use crate::{DiffimError, Result};

/// Settings of the whole PSF-matching fit.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(default)]
pub struct PsfMatchConfig {
    pub basis: BasisConfig,

    pub use_pca_for_spatial_kernel: bool,
    /// size of the PCA basis, mean kernel included
    pub num_principal_components: usize,
    pub subtract_mean_for_pca: bool,

    pub spatial_kernel_order: usize,
    pub spatial_bg_order: usize,
    pub spatial_model_type: SpatialModelType,
    pub fit_for_background: bool,

    pub size_cell_x: usize,
    pub size_cell_y: usize,
    pub n_star_per_cell: usize,
    pub max_spatial_iterations: usize,

    pub bad_mask_planes: Vec<MaskPlane>,
    pub constant_variance_weighting: bool,
    pub iterate_single_kernel: bool,

    pub max_reduced_chi2: f64,
    pub single_kernel_clipping: bool,
    pub spatial_kernel_clipping: bool,
    /// in units of sigma
    pub candidate_residual_mean_max: f64,
    pub candidate_residual_std_max: f64,
    pub kernel_sum_clipping: bool,
    pub max_ksum_sigma: f64,
    pub check_condition_number: bool,
    pub max_condition_number: f64,

    /// half-size of candidate stamps
    pub fp_grow_pix: usize,
}

impl Default for PsfMatchConfig {
    fn default() -> Self {
        Self {
            basis: BasisConfig::default(),
            use_pca_for_spatial_kernel: false,
            num_principal_components: 5,
            subtract_mean_for_pca: true,
            spatial_kernel_order: 2,
            spatial_bg_order: 1,
            spatial_model_type: SpatialModelType::Polynomial,
            fit_for_background: true,
            size_cell_x: 128,
            size_cell_y: 128,
            n_star_per_cell: 3,
            max_spatial_iterations: 3,
            bad_mask_planes: vec![
                MaskPlane::NoData,
                MaskPlane::Edge,
                MaskPlane::Sat,
                MaskPlane::Bad,
            ],
            constant_variance_weighting: false,
            iterate_single_kernel: false,
            max_reduced_chi2: 3.0,
            single_kernel_clipping: true,
            spatial_kernel_clipping: true,
            candidate_residual_mean_max: 0.25,
            candidate_residual_std_max: 1.5,
            kernel_sum_clipping: true,
            max_ksum_sigma: 3.0,
            check_condition_number: false,
            max_condition_number: 5e7,
            fp_grow_pix: 30,
        }
    }
}

impl PsfMatchConfig {
    pub fn from_yaml(filename: &str) -> Result<Self> {
        let f = File::open(filename)?;
        let config: PsfMatchConfig = serde_yaml::from_reader(f)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self, filename: &str) -> Result<()> {
        let f = File::create(filename)?;
        serde_yaml::to_writer(f, self)?;
        Ok(())
    }

    pub fn bad_bits(&self) -> MaskPixel {
        MaskPlane::bitmask(&self.bad_mask_planes)
    }

    pub fn validate(&self) -> Result<()> {
        self.basis.validate()?;
        let invalid = |msg: String| Err(DiffimError::InvalidBasisConfig(msg));
        if self.size_cell_x == 0 || self.size_cell_y == 0 {
            return invalid(format!(
                "cell size must be positive, got {}x{}",
                self.size_cell_x, self.size_cell_y
            ));
        }
        if self.n_star_per_cell == 0 {
            return invalid("n_star_per_cell must be positive".to_string());
        }
        if self.use_pca_for_spatial_kernel && self.num_principal_components == 0 {
            return invalid("num_principal_components must be positive".to_string());
        }
        if self.max_spatial_iterations == 0 {
            return invalid("max_spatial_iterations must be positive".to_string());
        }
        let thresholds = [
            ("max_reduced_chi2", self.max_reduced_chi2),
            ("candidate_residual_mean_max", self.candidate_residual_mean_max),
            ("candidate_residual_std_max", self.candidate_residual_std_max),
            ("max_ksum_sigma", self.max_ksum_sigma),
            ("max_condition_number", self.max_condition_number),
        ];
        for (name, value) in thresholds {
            if !(value > 0.0) {
                return invalid(format!("{} must be positive, got {}", name, value));
            }
        }
        let stamp = 2 * self.fp_grow_pix + 1;
        if stamp < self.basis.kernel_size() {
            return invalid(format!(
                "stamps of {} pixels cannot hold kernels of {}",
                stamp,
                self.basis.kernel_size()
            ));
        }
        Ok(())
    }
}
