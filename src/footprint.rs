//! Turning candidate positions into stamp pairs.

use ndarray::ArrayView2;
use tracing::info;

use crate::candidate::KernelCandidate;
use crate::config::PsfMatchConfig;
use crate::geom::{BBox, Vec2D};
use crate::image::{MaskPixel, MaskedImage, Pixel};
use crate::{DiffimError, Result};

/// OR of every mask value in the region.
pub fn find_set_bits(mask: &ArrayView2<MaskPixel>) -> MaskPixel {
    mask.fold(0, |acc, m| acc | m)
}

/// Why a position did not become a candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ineligible {
    OutsideImage,
    /// the stamp carries configured bad bits in the template or science mask
    BadPixels { bits: MaskPixel },
    /// truncated at the image edge to less than a kernel
    StampTooSmall,
}

/// Square stamp of half-size `grow` around the pixel containing `center`.
/// Near the image edge the stamp shrinks symmetrically so that the center
/// stays in the middle. `None` when the center lies outside `image` or is not
/// a finite position.
pub fn stamp_bbox(center: &Vec2D, grow: usize, image: &BBox) -> Option<BBox> {
    if !image.contains_point(center) {
        return None;
    }
    let (cx, cy) = (center.x.floor() as i32, center.y.floor() as i32);
    let half_x = (grow as i32).min(cx - image.min_x).min(image.max_x - cx);
    let half_y = (grow as i32).min(cy - image.min_y).min(image.max_y - cy);
    Some(BBox::new(cx - half_x, cy - half_y, cx + half_x, cy + half_y))
}

/// Candidates that were formed, and the positions that were not.
#[derive(Debug)]
pub struct CandidateList<'a, T: Pixel> {
    pub candidates: Vec<KernelCandidate<'a, T>>,
    pub ineligible: Vec<(Vec2D, Ineligible)>,
}

/// Form a candidate at each position, numbered in order of acceptance.
pub fn make_candidates<'a, T: Pixel>(
    template: &'a MaskedImage<T>,
    science: &'a MaskedImage<T>,
    positions: &[Vec2D],
    config: &PsfMatchConfig,
) -> Result<CandidateList<'a, T>> {
    if template.bbox() != science.bbox() {
        return Err(DiffimError::DimensionMismatch(format!(
            "template {:?} and science {:?} do not overlap exactly",
            template.bbox(),
            science.bbox()
        )));
    }
    let image = science.bbox();
    let bad = config.bad_bits();
    let kernel_size = config.basis.kernel_size();

    let mut candidates = Vec::new();
    let mut ineligible = Vec::new();
    for pos in positions {
        let Some(stamp) = stamp_bbox(pos, config.fp_grow_pix, &image) else {
            ineligible.push((*pos, Ineligible::OutsideImage));
            continue;
        };
        if stamp.width() < kernel_size || stamp.height() < kernel_size {
            ineligible.push((*pos, Ineligible::StampTooSmall));
            continue;
        }
        let t = template.sub_image(&stamp)?;
        let s = science.sub_image(&stamp)?;
        let bits = (find_set_bits(&t.mask) | find_set_bits(&s.mask)) & bad;
        if bits != 0 {
            ineligible.push((*pos, Ineligible::BadPixels { bits }));
            continue;
        }
        candidates.push(KernelCandidate::new(candidates.len(), *pos, t, s)?);
    }
    info!(
        "selected {} / {} positions as kernel candidates",
        candidates.len(),
        positions.len()
    );
    Ok(CandidateList {
        candidates,
        ineligible,
    })
}
