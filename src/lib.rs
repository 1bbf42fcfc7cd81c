//! PSF-matching kernel fitting for image differencing.
//!
//! A template image is convolved with a spatially varying kernel, built from
//! a fixed basis and fitted on isolated sources, and subtracted from a
//! science image.

mod errors;
pub mod assess;
pub mod basis;
pub mod candidate;
pub mod cells;
pub mod cli;
pub mod clipping;
pub mod config;
pub mod convolve;
pub mod fitter;
pub mod footprint;
pub mod geom;
pub mod image;
pub mod io;
pub mod linalg;
pub mod pca;
pub mod single;
pub mod spatial;
pub mod spatial_function;
#[cfg(feature = "python")]
mod python;

pub use crate::basis::{BasisConfig, BasisSet};
pub use crate::candidate::{CandidateStatus, KernelCandidate, RejectionReason, SolutionKind};
pub use crate::cells::KernelCellSet;
pub use crate::config::PsfMatchConfig;
pub use crate::errors::{DiffimError, Result};
pub use crate::fitter::{FitResult, FitStatus, PsfMatch};
pub use crate::geom::{BBox, Vec2D};
pub use crate::image::{MaskPlane, MaskedImage, MaskedImageView};
pub use crate::spatial::{SpatialKernel, SpatialModel};
