//! Masked images: an intensity plane, a variance plane and a bitmask plane of
//! identical shape, positioned in parent coordinates by an integer origin.
//!
//! Arrays are indexed `[[row, col]]`, i.e. `[[y - y0, x - x0]]`.

use ndarray::{s, Array2, ArrayView2};
use rustfft::num_traits::Float;
use serde::{Deserialize, Serialize};

use crate::geom::BBox;
use crate::{DiffimError, Result};

pub type MaskPixel = u32;

/// Pixel value types a masked image may carry.
pub trait Pixel: Float + Send + Sync + std::fmt::Debug + 'static {
    fn as_f64(self) -> f64;
    fn from_f64_cast(value: f64) -> Self;
}

impl Pixel for f32 {
    fn as_f64(self) -> f64 {
        self as f64
    }
    fn from_f64_cast(value: f64) -> Self {
        value as f32
    }
}

impl Pixel for f64 {
    fn as_f64(self) -> f64 {
        self
    }
    fn from_f64_cast(value: f64) -> Self {
        value
    }
}

/// Named mask planes with fixed bit positions.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MaskPlane {
    Bad,
    Sat,
    Intrp,
    Cr,
    Edge,
    Detected,
    DetectedNegative,
    Suspect,
    NoData,
}

impl MaskPlane {
    pub fn bit(self) -> MaskPixel {
        let position = match self {
            MaskPlane::Bad => 0,
            MaskPlane::Sat => 1,
            MaskPlane::Intrp => 2,
            MaskPlane::Cr => 3,
            MaskPlane::Edge => 4,
            MaskPlane::Detected => 5,
            MaskPlane::DetectedNegative => 6,
            MaskPlane::Suspect => 7,
            MaskPlane::NoData => 8,
        };
        1 << position
    }

    pub fn bitmask(planes: &[MaskPlane]) -> MaskPixel {
        planes.iter().fold(0, |acc, plane| acc | plane.bit())
    }
}

#[derive(Clone, Debug)]
pub struct MaskedImage<T: Pixel> {
    pub image: Array2<T>,
    pub variance: Array2<T>,
    pub mask: Array2<MaskPixel>,
    pub x0: i32,
    pub y0: i32,
}

/// A borrowed rectangular region of a [`MaskedImage`]; shares the parent's storage.
#[derive(Clone, Debug)]
pub struct MaskedImageView<'a, T: Pixel> {
    pub image: ArrayView2<'a, T>,
    pub variance: ArrayView2<'a, T>,
    pub mask: ArrayView2<'a, MaskPixel>,
    pub x0: i32,
    pub y0: i32,
}

fn check_inside(outer: &BBox, inner: &BBox) -> Result<()> {
    if outer.contains_box(inner) {
        Ok(())
    } else {
        Err(DiffimError::OutOfBounds(format!(
            "sub-region {:?} not contained in {:?}",
            inner, outer
        )))
    }
}

impl<T: Pixel> MaskedImage<T> {
    /// zero image, zero variance, clear mask
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            image: Array2::zeros((height, width)),
            variance: Array2::zeros((height, width)),
            mask: Array2::zeros((height, width)),
            x0: 0,
            y0: 0,
        }
    }

    pub fn from_arrays(
        image: Array2<T>,
        variance: Array2<T>,
        mask: Array2<MaskPixel>,
    ) -> Result<Self> {
        if image.dim() != variance.dim() || image.dim() != mask.dim() {
            return Err(DiffimError::DimensionMismatch(format!(
                "image {:?}, variance {:?}, mask {:?}",
                image.dim(),
                variance.dim(),
                mask.dim()
            )));
        }
        Ok(Self { image, variance, mask, x0: 0, y0: 0 })
    }

    pub fn with_origin(mut self, x0: i32, y0: i32) -> Self {
        self.x0 = x0;
        self.y0 = y0;
        self
    }

    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    pub fn bbox(&self) -> BBox {
        BBox::from_extent(self.x0, self.y0, self.width(), self.height())
    }

    pub fn view(&self) -> MaskedImageView<'_, T> {
        MaskedImageView {
            image: self.image.view(),
            variance: self.variance.view(),
            mask: self.mask.view(),
            x0: self.x0,
            y0: self.y0,
        }
    }

    /// View of `bbox` (parent coordinates); fails if it leaves the image.
    pub fn sub_image(&self, bbox: &BBox) -> Result<MaskedImageView<'_, T>> {
        self.view().sub_image(bbox)
    }

    /// set one pixel given in parent coordinates
    pub fn set(&mut self, x: i32, y: i32, value: T, mask: MaskPixel, variance: T) -> Result<()> {
        let bbox = self.bbox();
        if !bbox.contains(x, y) {
            return Err(DiffimError::OutOfBounds(format!(
                "pixel ({}, {}) outside {:?}",
                x, y, bbox
            )));
        }
        let idx = [(y - self.y0) as usize, (x - self.x0) as usize];
        self.image[idx] = value;
        self.mask[idx] = mask;
        self.variance[idx] = variance;
        Ok(())
    }

    pub fn fill_variance(&mut self, value: T) {
        self.variance.fill(value);
    }
}

impl<'a, T: Pixel> MaskedImageView<'a, T> {
    pub fn width(&self) -> usize {
        self.image.ncols()
    }

    pub fn height(&self) -> usize {
        self.image.nrows()
    }

    pub fn bbox(&self) -> BBox {
        BBox::from_extent(self.x0, self.y0, self.width(), self.height())
    }

    pub fn sub_image(&self, bbox: &BBox) -> Result<MaskedImageView<'a, T>> {
        check_inside(&self.bbox(), bbox)?;
        let r0 = (bbox.min_y - self.y0) as usize;
        let c0 = (bbox.min_x - self.x0) as usize;
        let r1 = r0 + bbox.height();
        let c1 = c0 + bbox.width();
        Ok(MaskedImageView {
            image: self.image.clone().slice_move(s![r0..r1, c0..c1]),
            variance: self.variance.clone().slice_move(s![r0..r1, c0..c1]),
            mask: self.mask.clone().slice_move(s![r0..r1, c0..c1]),
            x0: bbox.min_x,
            y0: bbox.min_y,
        })
    }

    pub fn same_shape(&self, other: &MaskedImageView<'_, T>) -> bool {
        self.image.dim() == other.image.dim()
    }

    pub fn image_f64(&self) -> Array2<f64> {
        self.image.mapv(|v| v.as_f64())
    }

    pub fn variance_f64(&self) -> Array2<f64> {
        self.variance.mapv(|v| v.as_f64())
    }

    pub fn to_owned(&self) -> MaskedImage<T> {
        MaskedImage {
            image: self.image.to_owned(),
            variance: self.variance.to_owned(),
            mask: self.mask.to_owned(),
            x0: self.x0,
            y0: self.y0,
        }
    }
}
