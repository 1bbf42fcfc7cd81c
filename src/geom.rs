use std::ops::Sub;

use serde::{Deserialize, Serialize};

/// A position in parent pixel coordinates; pixel (i, j) covers [i, i+1) x [j, j+1).
#[derive(Clone, Debug, Copy, Deserialize, PartialEq, Serialize)]
pub struct Vec2D {
    pub x: f64,
    pub y: f64,
}

impl Sub for Vec2D {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Vec2D {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

/// Integer pixel box with inclusive corners, in parent image coordinates.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct BBox {
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
}

impl BBox {
    pub fn new(min_x: i32, min_y: i32, max_x: i32, max_y: i32) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    /// box starting at (x0, y0) covering width x height pixels
    pub fn from_extent(x0: i32, y0: i32, width: usize, height: usize) -> Self {
        Self {
            min_x: x0,
            min_y: y0,
            max_x: x0 + width as i32 - 1,
            max_y: y0 + height as i32 - 1,
        }
    }

    pub fn width(&self) -> usize {
        (self.max_x - self.min_x + 1).max(0) as usize
    }

    pub fn height(&self) -> usize {
        (self.max_y - self.min_y + 1).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.max_x < self.min_x || self.max_y < self.min_y
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// a point belongs to the pixel it falls in; NaN or infinite points
    /// belong to none
    pub fn contains_point(&self, pos: &Vec2D) -> bool {
        pos.x.is_finite()
            && pos.y.is_finite()
            && self.contains(pos.x.floor() as i32, pos.y.floor() as i32)
    }

    pub fn contains_box(&self, other: &BBox) -> bool {
        !other.is_empty()
            && self.contains(other.min_x, other.min_y)
            && self.contains(other.max_x, other.max_y)
    }

    pub fn center(&self) -> Vec2D {
        Vec2D {
            x: 0.5 * (self.min_x + self.max_x) as f64,
            y: 0.5 * (self.min_y + self.max_y) as f64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_roundtrip() {
        let bbox = BBox::from_extent(10, 20, 5, 7);
        assert_eq!(bbox.width(), 5);
        assert_eq!(bbox.height(), 7);
        assert_eq!(bbox.max_x, 14);
        assert_eq!(bbox.max_y, 26);
    }

    #[test]
    fn test_contains_point_floors() {
        let bbox = BBox::new(0, 0, 9, 9);
        assert!(bbox.contains_point(&Vec2D { x: 9.9, y: 0.0 }));
        assert!(!bbox.contains_point(&Vec2D { x: 10.0, y: 0.0 }));
        assert!(!bbox.contains_point(&Vec2D { x: -0.1, y: 3.0 }));
        // NaN would otherwise floor to pixel 0
        assert!(!bbox.contains_point(&Vec2D { x: f64::NAN, y: 3.0 }));
        assert!(!bbox.contains_point(&Vec2D { x: 2.0, y: f64::INFINITY }));
    }

    #[test]
    fn test_contains_box() {
        let a = BBox::new(0, 0, 9, 9);
        let b = BBox::new(5, -3, 20, 4);
        assert!(a.contains_box(&BBox::new(2, 2, 3, 3)));
        assert!(!a.contains_box(&b));
    }

    #[test]
    fn test_offset_from_center() {
        let bbox = BBox::new(0, 0, 9, 5);
        let offset = Vec2D { x: 1.0, y: 2.0 } - bbox.center();
        assert_eq!(offset, Vec2D { x: -3.5, y: -0.5 });
    }
}
