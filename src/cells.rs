//! Spatial cells: a tiling of the fit region, each cell ranking the candidates
//! that fall inside it.

use std::collections::HashSet;

use crate::candidate::{CandidateStatus, KernelCandidate};
use crate::geom::BBox;
use crate::image::Pixel;
use crate::{DiffimError, Result};

/// One tile; holds indices into the owning set's candidate list, best first.
#[derive(Clone, Debug)]
pub struct SpatialCell {
    bbox: BBox,
    members: Vec<usize>,
}

impl SpatialCell {
    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn members(&self) -> &[usize] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug)]
pub struct KernelCellSet<'a, T: Pixel> {
    bbox: BBox,
    nx: usize,
    size_x: usize,
    size_y: usize,
    cells: Vec<SpatialCell>,
    candidates: Vec<KernelCandidate<'a, T>>,
}

impl<'a, T: Pixel> KernelCellSet<'a, T> {
    /// Tile `bbox` with cells of `size_x` by `size_y`; the last row and column
    /// are truncated to the box.
    pub fn new(bbox: BBox, size_x: usize, size_y: usize) -> Result<Self> {
        if size_x == 0 || size_y == 0 || bbox.is_empty() {
            return Err(DiffimError::InvalidBasisConfig(format!(
                "cannot tile {:?} with {}x{} cells",
                bbox, size_x, size_y
            )));
        }
        let nx = bbox.width().div_ceil(size_x);
        let ny = bbox.height().div_ceil(size_y);
        let mut cells = Vec::with_capacity(nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                let min_x = bbox.min_x + (i * size_x) as i32;
                let min_y = bbox.min_y + (j * size_y) as i32;
                let cell = BBox::new(
                    min_x,
                    min_y,
                    (min_x + size_x as i32 - 1).min(bbox.max_x),
                    (min_y + size_y as i32 - 1).min(bbox.max_y),
                );
                cells.push(SpatialCell {
                    bbox: cell,
                    members: vec![],
                });
            }
        }
        Ok(Self {
            bbox,
            nx,
            size_x,
            size_y,
            cells,
            candidates: vec![],
        })
    }

    /// Build a set and insert every candidate.
    pub fn from_candidates(
        bbox: BBox,
        size_x: usize,
        size_y: usize,
        candidates: Vec<KernelCandidate<'a, T>>,
    ) -> Result<Self> {
        let mut set = Self::new(bbox, size_x, size_y)?;
        for cand in candidates {
            set.insert(cand)?;
        }
        Ok(set)
    }

    /// Place a candidate in the cell containing its center.
    pub fn insert(&mut self, cand: KernelCandidate<'a, T>) -> Result<()> {
        let center = cand.center();
        if !self.bbox.contains_point(&center) {
            return Err(DiffimError::OutOfBounds(format!(
                "candidate {} at ({}, {}) outside {:?}",
                cand.id(),
                center.x,
                center.y,
                self.bbox
            )));
        }
        let i = (center.x.floor() as i32 - self.bbox.min_x) as usize / self.size_x;
        let j = (center.y.floor() as i32 - self.bbox.min_y) as usize / self.size_y;
        let index = self.candidates.len();
        self.candidates.push(cand);
        self.cells[j * self.nx + i].members.push(index);
        Ok(())
    }

    pub fn bbox(&self) -> &BBox {
        &self.bbox
    }

    pub fn cells(&self) -> &[SpatialCell] {
        &self.cells
    }

    pub fn candidates(&self) -> &[KernelCandidate<'a, T>] {
        &self.candidates
    }

    pub fn candidates_mut(&mut self) -> &mut [KernelCandidate<'a, T>] {
        &mut self.candidates
    }

    pub fn candidate(&self, id: usize) -> Option<&KernelCandidate<'a, T>> {
        self.candidates.iter().find(|c| c.id() == id)
    }

    pub fn candidate_mut(&mut self, id: usize) -> Option<&mut KernelCandidate<'a, T>> {
        self.candidates.iter_mut().find(|c| c.id() == id)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn count(&self, status: CandidateStatus) -> usize {
        self.candidates.iter().filter(|c| c.status() == status).count()
    }

    /// Order each cell's members: non-BAD first, then by rating, best first.
    pub fn sort_cells(&mut self) {
        let candidates = &self.candidates;
        for cell in &mut self.cells {
            cell.members.sort_by(|&a, &b| {
                let (ca, cb) = (&candidates[a], &candidates[b]);
                let bad_a = ca.status() == CandidateStatus::Bad;
                let bad_b = cb.status() == CandidateStatus::Bad;
                bad_a
                    .cmp(&bad_b)
                    .then(ca.rating().total_cmp(&cb.rating()))
                    .then(ca.id().cmp(&cb.id()))
            });
        }
    }

    /// Indices of the first `n_per_cell` non-BAD candidates of every cell, in
    /// current rank order.
    pub fn selection(&self, n_per_cell: usize) -> Vec<usize> {
        self.cells
            .iter()
            .flat_map(|cell| {
                cell.members
                    .iter()
                    .copied()
                    .filter(|&i| self.candidates[i].status() != CandidateStatus::Bad)
                    .take(n_per_cell)
            })
            .collect()
    }

    /// Mutable access to the candidates at `indices`.
    pub fn select_mut(&mut self, indices: &[usize]) -> Vec<&mut KernelCandidate<'a, T>> {
        let wanted: HashSet<usize> = indices.iter().copied().collect();
        self.candidates
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| wanted.contains(i))
            .map(|(_, c)| c)
            .collect()
    }
}
