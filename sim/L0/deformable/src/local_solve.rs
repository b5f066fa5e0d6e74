//! Safeguarded per-particle Newton step.
//!
//! Each particle's local system is a 3×3 symmetric Hessian `H` and a residual
//! `r`. The step is `Δx = H⁻¹(-r)`, computed with the closed-form cofactor
//! inverse.
//!
//! Conditioning is judged on the determinant:
//!
//! ```text
//! |det H| ≤ small  or  |det H| ≥ large   →  ill-conditioned
//! ```
//!
//! An ill-conditioned Hessian is rescaled by its largest-magnitude entry and
//! tested again; if it is still ill-conditioned the particle is skipped.
//! Both comparisons are inclusive, so a determinant that lands exactly on a
//! threshold always takes the rescale path.

use nalgebra::{Matrix3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Determinant bounds of a usable local Hessian.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConditioningThresholds {
    /// Determinants with magnitude at or below this are near-singular.
    pub small: f64,
    /// Determinants with magnitude at or above this overflow.
    pub large: f64,
}

impl Default for ConditioningThresholds {
    fn default() -> Self {
        Self {
            small: 1e-8,
            large: 1e30,
        }
    }
}

impl ConditioningThresholds {
    /// Whether `det` lies outside the open interval `(small, large)`.
    #[must_use]
    pub fn is_ill_conditioned(&self, det: f64) -> bool {
        let magnitude = det.abs();
        !(magnitude > self.small && magnitude < self.large)
    }
}

/// Outcome of a local solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalSolve {
    /// Position increment for the particle.
    Step(Vector3<f64>),
    /// The Hessian stayed ill-conditioned after rescaling.
    IllConditioned,
}

/// Transposed cofactor matrix (adjugate) of `m`.
fn adjugate(m: &Matrix3<f64>) -> Matrix3<f64> {
    let c00 = m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)];
    let c01 = m[(1, 2)] * m[(2, 0)] - m[(1, 0)] * m[(2, 2)];
    let c02 = m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)];
    let c10 = m[(0, 2)] * m[(2, 1)] - m[(0, 1)] * m[(2, 2)];
    let c11 = m[(0, 0)] * m[(2, 2)] - m[(0, 2)] * m[(2, 0)];
    let c12 = m[(0, 1)] * m[(2, 0)] - m[(0, 0)] * m[(2, 1)];
    let c20 = m[(0, 1)] * m[(1, 2)] - m[(0, 2)] * m[(1, 1)];
    let c21 = m[(0, 2)] * m[(1, 0)] - m[(0, 0)] * m[(1, 2)];
    let c22 = m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)];

    // Row i of the adjugate is column i of the cofactor matrix.
    Matrix3::new(c00, c10, c20, c01, c11, c21, c02, c12, c22)
}

/// Determinant by cofactor expansion along the first row.
fn determinant(m: &Matrix3<f64>) -> f64 {
    m[(0, 0)] * (m[(1, 1)] * m[(2, 2)] - m[(1, 2)] * m[(2, 1)])
        - m[(0, 1)] * (m[(1, 0)] * m[(2, 2)] - m[(1, 2)] * m[(2, 0)])
        + m[(0, 2)] * (m[(1, 0)] * m[(2, 1)] - m[(1, 1)] * m[(2, 0)])
}

/// Solve `H Δx = -r` for one particle.
#[must_use]
pub fn solve_local(
    residual: &Vector3<f64>,
    hessian: &Matrix3<f64>,
    thresholds: &ConditioningThresholds,
) -> LocalSolve {
    let mut scale = 1.0;
    let mut h = *hessian;
    let mut det = determinant(&h);

    if thresholds.is_ill_conditioned(det) {
        scale = h.amax();
        if scale == 0.0 || !scale.is_finite() {
            return LocalSolve::IllConditioned;
        }
        h /= scale;
        det = determinant(&h);
        if thresholds.is_ill_conditioned(det) {
            return LocalSolve::IllConditioned;
        }
    }

    let dx = adjugate(&h) * (-residual) / (det * scale);
    if dx.iter().all(|c| c.is_finite()) {
        LocalSolve::Step(dx)
    } else {
        LocalSolve::IllConditioned
    }
}
