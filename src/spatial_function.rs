use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

use crate::convolve::Background;
use crate::geom::{BBox, Vec2D};
use crate::linalg::solve_normal_equations;
use crate::{DiffimError, Result};

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpatialModelType {
    #[default]
    Polynomial,
    Chebyshev1,
}

/// number of terms of a 2D function of total degree `order`
pub fn n_terms(order: usize) -> usize {
    (order + 1) * (order + 2) / 2
}

/// Powers (px, py) of term `index`: ordered by total degree, then by
/// increasing power of y.
pub fn term_powers(index: usize) -> (usize, usize) {
    let n = ((-1.0 + (1.0 + 8.0 * (index as f64)).sqrt()) / 2.0).floor() as usize;
    let k = index - n * (n + 1) / 2;
    (n - k, k)
}

fn chebyshev(n: usize, u: f64) -> f64 {
    match n {
        0 => 1.0,
        1 => u,
        _ => {
            let (mut prev, mut cur) = (1.0, u);
            for _ in 2..=n {
                let next = 2.0 * u * cur - prev;
                prev = cur;
                cur = next;
            }
            cur
        }
    }
}

pub trait SpatialBasis {
    /// the sample function returns the value of the bivariate term with a given
    /// index, at coordinate (x,y)
    fn sample(&self, pos: &Vec2D, index: usize) -> f64;
    fn get_coeffs(&self) -> &[f64];
    fn set_coeffs(&mut self, coeffs: Vec<f64>);

    fn n_terms(&self) -> usize {
        self.get_coeffs().len()
    }

    /// all terms at one position
    fn terms(&self, pos: &Vec2D) -> Array1<f64> {
        Array1::from_iter((0..self.n_terms()).map(|index| self.sample(pos, index)))
    }

    fn eval(&self, pos: &Vec2D) -> f64 {
        self.get_coeffs()
            .iter()
            .enumerate()
            .map(|(index, c)| c * self.sample(pos, index))
            .sum()
    }

    /// Weighted least-squares fit of the coefficients to scattered values.
    fn solve_for_coeffs(&mut self, positions: &[Vec2D], values: &[f64], weights: &[f64]) -> Result<()> {
        if positions.len() != values.len() || positions.len() != weights.len() {
            return Err(DiffimError::DimensionMismatch(format!(
                "{} positions, {} values, {} weights",
                positions.len(),
                values.len(),
                weights.len()
            )));
        }
        let n = self.n_terms();
        let n_used = weights.iter().filter(|w| **w > 0.0).count();
        if n_used < n {
            return Err(DiffimError::DegenerateSpatialModel {
                available: n_used,
                required: n,
            });
        }

        let mut m = Array2::<f64>::zeros((n, n));
        let mut b = Array1::<f64>::zeros(n);
        for ((pos, value), weight) in positions.iter().zip(values).zip(weights) {
            let phi = self.terms(pos);
            for i in 0..n {
                b[i] += weight * value * phi[i];
                for j in 0..n {
                    m[[i, j]] += weight * phi[i] * phi[j];
                }
            }
        }
        let (coeffs, _) = solve_normal_equations(&m, &b)?;
        self.set_coeffs(coeffs.to_vec());
        Ok(())
    }
}

/// A polynomial or Chebyshev function of position over a bounding box, whose
/// coordinates are mapped onto [-1, 1] before evaluation.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SpatialFunction {
    pub kind: SpatialModelType,
    pub order: usize,
    pub bbox: BBox,
    pub coeffs: Vec<f64>,
}

impl SpatialFunction {
    pub fn new(kind: SpatialModelType, order: usize, bbox: BBox) -> Self {
        Self {
            kind,
            order,
            bbox,
            coeffs: vec![0.0; n_terms(order)],
        }
    }

    pub fn with_coeffs(mut self, coeffs: Vec<f64>) -> Result<Self> {
        if coeffs.len() != n_terms(self.order) {
            return Err(DiffimError::DimensionMismatch(format!(
                "order {} needs {} coefficients, got {}",
                self.order,
                n_terms(self.order),
                coeffs.len()
            )));
        }
        self.coeffs = coeffs;
        Ok(self)
    }

    fn normalize(&self, pos: &Vec2D) -> (f64, f64) {
        let offset = *pos - self.bbox.center();
        let half_x = (0.5 * (self.bbox.max_x - self.bbox.min_x) as f64).max(0.5);
        let half_y = (0.5 * (self.bbox.max_y - self.bbox.min_y) as f64).max(0.5);
        (offset.x / half_x, offset.y / half_y)
    }
}

impl SpatialBasis for SpatialFunction {
    fn sample(&self, pos: &Vec2D, index: usize) -> f64 {
        let (px, py) = term_powers(index);
        let (u, v) = self.normalize(pos);
        match self.kind {
            SpatialModelType::Polynomial => u.powi(px as i32) * v.powi(py as i32),
            SpatialModelType::Chebyshev1 => chebyshev(px, u) * chebyshev(py, v),
        }
    }

    fn get_coeffs(&self) -> &[f64] {
        &self.coeffs
    }

    fn set_coeffs(&mut self, coeffs: Vec<f64>) {
        self.coeffs = coeffs;
    }
}

impl Background for SpatialFunction {
    fn value_at(&self, x: f64, y: f64) -> f64 {
        self.eval(&Vec2D { x, y })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_term_ordering() {
        let powers: Vec<_> = (0..6).map(term_powers).collect();
        assert_eq!(powers, vec![(0, 0), (1, 0), (0, 1), (2, 0), (1, 1), (0, 2)]);
        assert_eq!(term_powers(9), (0, 3));
    }

    #[test]
    fn test_term_count() {
        assert_eq!(n_terms(0), 1);
        assert_eq!(n_terms(1), 3);
        assert_eq!(n_terms(2), 6);
        assert_eq!(n_terms(3), 10);
    }

    #[test]
    fn test_chebyshev_values() {
        assert_abs_diff_eq!(chebyshev(2, 0.5), -0.5, epsilon = 1e-15);
        assert_abs_diff_eq!(chebyshev(3, 0.5), -1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(chebyshev(4, 1.0), 1.0, epsilon = 1e-15);
    }

    #[test]
    fn test_fit_recovers_plane() {
        let bbox = BBox::new(0, 0, 99, 99);
        let mut func = SpatialFunction::new(SpatialModelType::Chebyshev1, 1, bbox);
        let truth = |p: &Vec2D| 3.0 + 0.02 * p.x - 0.01 * p.y;
        let positions: Vec<Vec2D> = (0..5)
            .flat_map(|i| (0..5).map(move |j| Vec2D { x: 10.0 + 20.0 * i as f64, y: 5.0 + 18.0 * j as f64 }))
            .collect();
        let values: Vec<f64> = positions.iter().map(truth).collect();
        let weights = vec![1.0; positions.len()];
        func.solve_for_coeffs(&positions, &values, &weights).unwrap();

        for pos in [Vec2D { x: 0.0, y: 0.0 }, Vec2D { x: 77.0, y: 31.5 }] {
            assert_abs_diff_eq!(func.eval(&pos), truth(&pos), epsilon = 1e-9);
            assert_abs_diff_eq!(func.value_at(pos.x, pos.y), truth(&pos), epsilon = 1e-9);
        }
    }

    #[test]
    fn test_fit_needs_enough_points() {
        let mut func = SpatialFunction::new(SpatialModelType::Polynomial, 2, BBox::new(0, 0, 9, 9));
        let positions = vec![Vec2D { x: 1.0, y: 1.0 }; 4];
        let res = func.solve_for_coeffs(&positions, &[1.0; 4], &[1.0; 4]);
        assert!(matches!(
            res,
            Err(DiffimError::DegenerateSpatialModel { available: 4, required: 6 })
        ));
    }

    #[test]
    fn test_with_coeffs_checks_length() {
        let func = SpatialFunction::new(SpatialModelType::Polynomial, 1, BBox::new(0, 0, 9, 9));
        assert!(func.clone().with_coeffs(vec![1.0, 2.0]).is_err());
        let func = func.with_coeffs(vec![1.0, 0.0, 0.0]).unwrap();
        assert_abs_diff_eq!(func.eval(&Vec2D { x: 3.0, y: 8.0 }), 1.0);
    }
}
