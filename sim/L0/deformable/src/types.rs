//! Particle storage for deformable bodies.
//!
//! [`ParticleSet`] is the shared particle store the solver reads from and
//! writes into. It is owned by the caller; the solver keeps only indices and
//! its own per-particle scratch.
//!
//! Each particle carries:
//!
//! - `X`: position at the end of the previous time step
//! - `V`: velocity at the end of the previous time step
//! - `P`: current position estimate (the solver's unknown)
//! - mass and inverse mass (inverse mass 0 means pinned)

use nalgebra::{Point3, Vector3};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Structure-of-arrays particle store.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ParticleSet {
    x: Vec<Point3<f64>>,
    v: Vec<Vector3<f64>>,
    p: Vec<Point3<f64>>,
    mass: Vec<f64>,
    inv_mass: Vec<f64>,
}

impl ParticleSet {
    /// Create an empty particle set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty particle set with room for `capacity` particles.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            v: Vec::with_capacity(capacity),
            p: Vec::with_capacity(capacity),
            mass: Vec::with_capacity(capacity),
            inv_mass: Vec::with_capacity(capacity),
        }
    }

    /// Create a particle set at rest from positions and masses.
    ///
    /// Missing masses default to 1. A mass that is not strictly positive and
    /// finite produces a pinned particle.
    #[must_use]
    pub fn from_positions(positions: &[Point3<f64>], masses: &[f64]) -> Self {
        let mut set = Self::with_capacity(positions.len());
        for (i, &position) in positions.iter().enumerate() {
            set.add_particle(position, masses.get(i).copied().unwrap_or(1.0));
        }
        set
    }

    /// Add a particle at rest and return its index.
    pub fn add_particle(&mut self, position: Point3<f64>, mass: f64) -> usize {
        let (mass, inv_mass) = if mass > 0.0 && mass.is_finite() {
            (mass, 1.0 / mass)
        } else {
            (0.0, 0.0)
        };
        self.x.push(position);
        self.v.push(Vector3::zeros());
        self.p.push(position);
        self.mass.push(mass);
        self.inv_mass.push(inv_mass);
        self.x.len() - 1
    }

    /// Number of particles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether the set holds no particles.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Previous-step positions (`X`).
    #[must_use]
    pub fn previous_positions(&self) -> &[Point3<f64>] {
        &self.x
    }

    /// Previous-step velocities (`V`).
    #[must_use]
    pub fn velocities(&self) -> &[Vector3<f64>] {
        &self.v
    }

    /// Current position estimates (`P`).
    #[must_use]
    pub fn positions(&self) -> &[Point3<f64>] {
        &self.p
    }

    /// Mutable current position estimates (`P`).
    pub fn positions_mut(&mut self) -> &mut [Point3<f64>] {
        &mut self.p
    }

    /// Mutable positions alongside the inverse masses.
    pub fn positions_and_inverse_masses_mut(&mut self) -> (&mut [Point3<f64>], &[f64]) {
        (&mut self.p, &self.inv_mass)
    }

    /// Per-particle masses (0 for pinned particles).
    #[must_use]
    pub fn masses(&self) -> &[f64] {
        &self.mass
    }

    /// Per-particle inverse masses (0 for pinned particles).
    #[must_use]
    pub fn inverse_masses(&self) -> &[f64] {
        &self.inv_mass
    }

    /// Previous-step position of particle `i`.
    #[must_use]
    pub fn x(&self, i: usize) -> Point3<f64> {
        self.x[i]
    }

    /// Previous-step velocity of particle `i`.
    #[must_use]
    pub fn v(&self, i: usize) -> Vector3<f64> {
        self.v[i]
    }

    /// Current position estimate of particle `i`.
    #[must_use]
    pub fn p(&self, i: usize) -> Point3<f64> {
        self.p[i]
    }

    /// Mass of particle `i`.
    #[must_use]
    pub fn mass(&self, i: usize) -> f64 {
        self.mass[i]
    }

    /// Inverse mass of particle `i`.
    #[must_use]
    pub fn inv_mass(&self, i: usize) -> f64 {
        self.inv_mass[i]
    }

    /// Overwrite the current position estimate of particle `i`.
    pub fn set_position(&mut self, i: usize, position: Point3<f64>) {
        if i < self.p.len() {
            self.p[i] = position;
        }
    }

    /// Overwrite the previous-step velocity of particle `i`.
    pub fn set_velocity(&mut self, i: usize, velocity: Vector3<f64>) {
        if i < self.v.len() {
            self.v[i] = velocity;
        }
    }

    /// Pin particle `i` (infinite mass, never moved by the solver).
    pub fn pin(&mut self, i: usize) {
        if i < self.inv_mass.len() {
            self.inv_mass[i] = 0.0;
        }
    }

    /// Unpin particle `i`, restoring the inverse of its stored mass.
    ///
    /// Particles created with a non-positive mass stay pinned.
    pub fn unpin(&mut self, i: usize) {
        if i < self.inv_mass.len() && self.mass[i] > 0.0 {
            self.inv_mass[i] = 1.0 / self.mass[i];
        }
    }

    /// Check if particle `i` is pinned.
    #[must_use]
    pub fn is_pinned(&self, i: usize) -> bool {
        self.inv_mass.get(i).is_none_or(|&w| w == 0.0)
    }

    /// Set `P = X + dt·V + dt²·g` for every free particle.
    ///
    /// This is the usual initial guess for an implicit step and matches the
    /// inertial target the solver captures in `init`.
    pub fn predict(&mut self, dt: f64, gravity: Vector3<f64>) {
        for i in 0..self.p.len() {
            if self.inv_mass[i] > 0.0 {
                self.p[i] = self.x[i] + self.v[i] * dt + gravity * (dt * dt);
            }
        }
    }

    /// Commit the current estimate: `V = (P - X)/dt`, `X = P`.
    pub fn finish_step(&mut self, dt: f64) {
        let dt = dt.max(1e-10);
        for i in 0..self.p.len() {
            if self.inv_mass[i] > 0.0 {
                self.v[i] = (self.p[i] - self.x[i]) / dt;
                self.x[i] = self.p[i];
            } else {
                self.p[i] = self.x[i];
            }
        }
    }

    /// Total mass of the free particles.
    #[must_use]
    pub fn total_mass(&self) -> f64 {
        self.mass
            .iter()
            .zip(&self.inv_mass)
            .filter(|&(_, &w)| w > 0.0)
            .map(|(&m, _)| m)
            .sum()
    }

    /// Axis-aligned bounding box of the previous-step positions.
    #[must_use]
    pub fn bounding_box(&self) -> (Point3<f64>, Point3<f64>) {
        let Some(first) = self.x.first() else {
            return (Point3::origin(), Point3::origin());
        };

        let mut min = *first;
        let mut max = *first;
        for p in &self.x {
            min = min.inf(p);
            max = max.sup(p);
        }
        (min, max)
    }

    /// Length of the bounding box diagonal.
    #[must_use]
    pub fn bounding_box_diagonal(&self) -> f64 {
        let (min, max) = self.bounding_box();
        (max - min).norm()
    }
}
