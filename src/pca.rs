//! Principal-component basis built from the kernels of good candidates.

use ndarray::Array2;
use tracing::debug;

use crate::basis::{renormalize_kernel_list, BasisSet};
use crate::candidate::{CandidateStatus, KernelCandidate, SolutionKind};
use crate::image::Pixel;
use crate::linalg::symmetric_eigen;
use crate::{DiffimError, Result};

/// Eigenvalues below this fraction of the largest carry no signal.
const MIN_EIGENVALUE_FRACTION: f64 = 1e-12;

/// Build a basis of the mean kernel followed by at most `n_components - 1`
/// leading eigen-kernels of the GOOD candidates' `Original` kernels, each kernel
/// first scaled to unit sum. Uses the snapshot method: eigen-decompose the
/// candidates' Gram matrix rather than the pixel covariance.
pub fn build_pca_basis<T: Pixel>(
    candidates: &[&KernelCandidate<'_, T>],
    n_components: usize,
    subtract_mean: bool,
) -> Result<BasisSet> {
    let mut images: Vec<Array2<f64>> = Vec::new();
    for cand in candidates {
        if cand.status() != CandidateStatus::Good {
            continue;
        }
        let image = cand.kernel_image(SolutionKind::Original)?;
        let sum = image.sum();
        if sum.abs() > f64::EPSILON {
            images.push(image / sum);
        }
    }
    if images.is_empty() {
        return Err(DiffimError::DegenerateSpatialModel {
            available: 0,
            required: 1,
        });
    }

    let n = images.len();
    let mut mean = Array2::<f64>::zeros(images[0].dim());
    for image in &images {
        mean += image;
    }
    mean /= n as f64;

    let data: Vec<Array2<f64>> = if subtract_mean {
        images.iter().map(|im| im - &mean).collect()
    } else {
        images
    };

    let gram = Array2::from_shape_fn((n, n), |(i, j)| (&data[i] * &data[j]).sum());
    let (values, vectors) = symmetric_eigen(&gram);
    let largest = values.iter().copied().fold(0.0_f64, f64::max);

    let mut basis_images = vec![mean];
    for k in 0..n.min(n_components.saturating_sub(1)) {
        if !(values[k] > MIN_EIGENVALUE_FRACTION * largest) {
            break;
        }
        let mut eigen_kernel = Array2::<f64>::zeros(data[0].dim());
        for (i, image) in data.iter().enumerate() {
            eigen_kernel.scaled_add(vectors[[i, k]], image);
        }
        basis_images.push(eigen_kernel);
    }
    debug!(
        "PCA basis from {} kernels: mean plus {} components",
        n,
        basis_images.len() - 1
    );

    BasisSet::from_images(renormalize_kernel_list(basis_images)?, true)
}
