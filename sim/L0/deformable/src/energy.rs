//! Constraint energies: the solver's plugin surface.
//!
//! A constraint kind contributes, for one particle of one of its elements, the
//! gradient and Hessian of its energy with respect to that particle. The
//! solver registers kinds per constraint group and dispatches to them while
//! accumulating a particle's local Newton system.
//!
//! Contributions are scaled by `dt²` so they live in the same units as the
//! inertial term `m(P - x̃)`:
//!
//! ```text
//! r += dt² · ∂E/∂x_slot
//! H += dt² · ∂²E/∂x_slot²
//! ```

use nalgebra::{Matrix3, Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{DeformableError, Result};
use crate::types::ParticleSet;

/// Residual and Hessian contribution of one constraint kind.
///
/// `element` is the element index local to the kind (global element index
/// minus the kind's registered offset) and `slot` is the position of the
/// particle inside that element.
pub trait ResidualHessian: Send + Sync {
    /// Add this element's contribution for the particle at `slot`.
    fn accumulate(
        &self,
        particles: &ParticleSet,
        element: usize,
        slot: usize,
        dt: f64,
        residual: &mut Vector3<f64>,
        hessian: &mut Matrix3<f64>,
    );
}

impl<F> ResidualHessian for F
where
    F: Fn(&ParticleSet, usize, usize, f64, &mut Vector3<f64>, &mut Matrix3<f64>) + Send + Sync,
{
    fn accumulate(
        &self,
        particles: &ParticleSet,
        element: usize,
        slot: usize,
        dt: f64,
        residual: &mut Vector3<f64>,
        hessian: &mut Matrix3<f64>,
    ) {
        self(particles, element, slot, dt, residual, hessian);
    }
}

/// Per-particle Hessian augmentation (boundary conditions, regularization).
///
/// Applied after every constraint contribution.
pub trait PerNodeHessian: Send + Sync {
    /// Modify the accumulated Hessian of `particle`.
    fn augment(&self, particle: usize, dt: f64, hessian: &mut Matrix3<f64>);
}

impl<F> PerNodeHessian for F
where
    F: Fn(usize, f64, &mut Matrix3<f64>) + Send + Sync,
{
    fn augment(&self, particle: usize, dt: f64, hessian: &mut Matrix3<f64>) {
        self(particle, dt, hessian);
    }
}

/// Linear springs, `E = ½·k·(|x₁ - x₀| - L)²` per edge.
///
/// The Hessian drops the negative transverse term of compressed springs so
/// every contribution stays positive semi-definite.
///
/// Register it with a range of exactly [`SpringEnergy::len`] elements;
/// element indices past the last spring contribute nothing.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpringEnergy {
    edges: Vec<[usize; 2]>,
    rest_lengths: Vec<f64>,
    stiffness: f64,
}

impl SpringEnergy {
    /// Create springs with explicit rest lengths.
    ///
    /// # Errors
    ///
    /// Returns an error if the edge and rest-length counts differ, a rest
    /// length is negative, or the stiffness is not positive.
    pub fn new(edges: Vec<[usize; 2]>, rest_lengths: Vec<f64>, stiffness: f64) -> Result<Self> {
        if edges.len() != rest_lengths.len() {
            return Err(DeformableError::invalid_constraint(format!(
                "{} springs but {} rest lengths",
                edges.len(),
                rest_lengths.len()
            )));
        }
        if rest_lengths.iter().any(|&l| l < 0.0 || !l.is_finite()) {
            return Err(DeformableError::invalid_constraint(
                "spring rest lengths must be finite and non-negative",
            ));
        }
        if stiffness <= 0.0 || !stiffness.is_finite() {
            return Err(DeformableError::invalid_constraint(format!(
                "spring stiffness must be positive, got {stiffness}"
            )));
        }
        Ok(Self {
            edges,
            rest_lengths,
            stiffness,
        })
    }

    /// Create springs whose rest lengths are the current edge lengths.
    ///
    /// # Errors
    ///
    /// Returns an error if an edge references a missing particle or the
    /// stiffness is not positive.
    pub fn from_positions(
        edges: Vec<[usize; 2]>,
        positions: &[Point3<f64>],
        stiffness: f64,
    ) -> Result<Self> {
        let mut rest_lengths = Vec::with_capacity(edges.len());
        for &[a, b] in &edges {
            let (Some(pa), Some(pb)) = (positions.get(a), positions.get(b)) else {
                return Err(DeformableError::index_out_of_bounds(format!(
                    "spring ({a}, {b}) with {} particles",
                    positions.len()
                )));
            };
            rest_lengths.push((pb - pa).norm());
        }
        Self::new(edges, rest_lengths, stiffness)
    }

    /// The spring edges, in registration order.
    #[must_use]
    pub fn edges(&self) -> &[[usize; 2]] {
        &self.edges
    }

    /// Rest length of each spring.
    #[must_use]
    pub fn rest_lengths(&self) -> &[f64] {
        &self.rest_lengths
    }

    /// Spring stiffness.
    #[must_use]
    pub const fn stiffness(&self) -> f64 {
        self.stiffness
    }

    /// Number of springs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether there are no springs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Total elastic energy at the current estimates `P`.
    #[must_use]
    pub fn energy(&self, particles: &ParticleSet) -> f64 {
        self.edges
            .iter()
            .zip(&self.rest_lengths)
            .map(|(&[a, b], &rest)| {
                let stretch = (particles.p(b) - particles.p(a)).norm() - rest;
                0.5 * self.stiffness * stretch * stretch
            })
            .sum()
    }
}

impl ResidualHessian for SpringEnergy {
    fn accumulate(
        &self,
        particles: &ParticleSet,
        element: usize,
        slot: usize,
        dt: f64,
        residual: &mut Vector3<f64>,
        hessian: &mut Matrix3<f64>,
    ) {
        // A kind registered over more elements than springs ignores the rest.
        let (Some(&[a, b]), Some(&rest)) = (self.edges.get(element), self.rest_lengths.get(element))
        else {
            return;
        };

        let diff = particles.p(b) - particles.p(a);
        let length = diff.norm();
        if length < 1e-12 {
            return;
        }
        let n = diff / length;
        let dt2 = dt * dt;

        // ∂E/∂x₁ = k(l - L)n, ∂E/∂x₀ = -k(l - L)n
        let sign = if slot == 0 { -1.0 } else { 1.0 };
        *residual += n * (sign * dt2 * self.stiffness * (length - rest));

        let nnt = n * n.transpose();
        let transverse = (1.0 - rest / length).max(0.0);
        *hessian +=
            (nnt + (Matrix3::identity() - nnt) * transverse) * (dt2 * self.stiffness);
    }
}
