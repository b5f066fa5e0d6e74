//! Coloring-parallel Gauss-Seidel Newton solver for deformable bodies.
//!
//! Each particle's position is updated by one Newton step on its local
//! energy (inertia plus every incident constraint), using the most recent
//! positions of its neighbors.
//!
//! # Algorithm Overview
//!
//! ```text
//! init (once per time step):
//!   x̃ = X + dt·V + dt²·g
//!   X_k = X_k_1 = P
//!   clear transient constraints
//!
//! apply (once per outer iteration):
//!   for each color (sequential):
//!     for each particle of the color (parallel batches):
//!       r, H = inertia + static + dynamic + transient + per-node terms
//!       Δx = H⁻¹(-r)          (skip if ill-conditioned or |Δx| > max_dx)
//!     write P += Δx           (color barrier)
//!   if SOR enabled and past warm-up:
//!     P = ω(P - X_k_1) + X_k_1
//!   X_k_1 = X_k, X_k = P
//! ```
//!
//! # Concurrency
//!
//! Particles of one color share no element, so none of them reads a
//! position another one writes. Steps of a color are computed in parallel
//! from a read-only view of the particle store and written back once the
//! whole color is done; colors run strictly in sequence so later colors see
//! the positions written by earlier ones.

use std::sync::Arc;

use nalgebra::{Matrix3, Point3, Vector3};
use rayon::prelude::*;
use tracing::{debug, trace, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::coloring::{color_particles, is_valid_coloring, particles_per_color};
use crate::energy::{PerNodeHessian, ResidualHessian};
use crate::error::{DeformableError, Result};
use crate::local_solve::{ConditioningThresholds, LocalSolve, solve_local};
use crate::registry::{ConstraintCategory, ConstraintGroup};
use crate::types::ParticleSet;

/// Configuration for the Gauss-Seidel solver.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussSeidelConfig {
    /// Solve for static equilibrium instead of an implicit time step.
    pub quasistatic: bool,

    /// Enable successive over-relaxation after each sweep.
    pub enable_sor: bool,

    /// Over-relaxation factor ω. Values above 1 extrapolate, below 1 damp.
    pub omega_sor: f64,

    /// SOR only runs once the iteration counter exceeds this value.
    pub sor_warmup_iterations: u32,

    /// Number of particles handed to one parallel task.
    pub batch_size: usize,

    /// Colors with fewer particles than this run on the calling thread.
    pub serial_threshold: usize,

    /// Largest accepted step, as a fraction of the initial bounding-box
    /// diagonal.
    pub max_dx_ratio: f64,

    /// Local Hessians with `|det|` at or below this are rescaled or skipped.
    pub det_small_threshold: f64,

    /// Local Hessians with `|det|` at or above this are rescaled or skipped.
    pub det_large_threshold: f64,

    /// Validate adjacency on every dynamic/transient registration.
    pub check_incident_elements: bool,
}

impl Default for GaussSeidelConfig {
    fn default() -> Self {
        Self {
            quasistatic: false,
            enable_sor: false,
            omega_sor: 1.6,
            sor_warmup_iterations: 1,
            batch_size: 256,
            serial_threshold: 1024,
            max_dx_ratio: 1.0,
            det_small_threshold: 1e-8,
            det_large_threshold: 1e30,
            check_incident_elements: false,
        }
    }
}

impl GaussSeidelConfig {
    /// Config for equilibrium solves.
    #[must_use]
    pub const fn quasistatic() -> Self {
        Self {
            quasistatic: true,
            enable_sor: false,
            omega_sor: 1.6,
            sor_warmup_iterations: 1,
            batch_size: 256,
            serial_threshold: 1024,
            max_dx_ratio: 1.0,
            det_small_threshold: 1e-8,
            det_large_threshold: 1e30,
            check_incident_elements: false,
        }
    }

    /// Config with SOR acceleration enabled.
    #[must_use]
    pub const fn accelerated() -> Self {
        Self {
            quasistatic: false,
            enable_sor: true,
            omega_sor: 1.6,
            sor_warmup_iterations: 1,
            batch_size: 256,
            serial_threshold: 1024,
            max_dx_ratio: 1.0,
            det_small_threshold: 1e-8,
            det_large_threshold: 1e30,
            check_incident_elements: false,
        }
    }

    /// Set quasistatic mode.
    #[must_use]
    pub const fn with_quasistatic(mut self, quasistatic: bool) -> Self {
        self.quasistatic = quasistatic;
        self
    }

    /// Enable SOR with the given factor.
    #[must_use]
    pub const fn with_sor(mut self, omega: f64) -> Self {
        self.enable_sor = true;
        self.omega_sor = omega;
        self
    }

    /// Set the SOR warm-up threshold.
    #[must_use]
    pub const fn with_sor_warmup(mut self, iterations: u32) -> Self {
        self.sor_warmup_iterations = iterations;
        self
    }

    /// Set the parallel batch size and serial threshold.
    #[must_use]
    pub const fn with_parallelism(mut self, batch_size: usize, serial_threshold: usize) -> Self {
        self.batch_size = batch_size;
        self.serial_threshold = serial_threshold;
        self
    }

    /// Set the maximum step ratio.
    #[must_use]
    pub const fn with_max_dx_ratio(mut self, ratio: f64) -> Self {
        self.max_dx_ratio = ratio;
        self
    }

    /// Enable adjacency validation on every dynamic/transient registration.
    #[must_use]
    pub const fn with_incident_checks(mut self, check: bool) -> Self {
        self.check_incident_elements = check;
        self
    }

    /// Determinant thresholds for the local solve.
    #[must_use]
    pub const fn conditioning(&self) -> ConditioningThresholds {
        ConditioningThresholds {
            small: self.det_small_threshold,
            large: self.det_large_threshold,
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-positive relaxation factor, step ratio or
    /// batch size, or for inconsistent determinant thresholds.
    pub fn validate(&self) -> Result<()> {
        if !(self.omega_sor > 0.0 && self.omega_sor < 2.0) {
            return Err(DeformableError::invalid_config(format!(
                "omega_sor must lie in (0, 2), got {}",
                self.omega_sor
            )));
        }
        if !(self.max_dx_ratio > 0.0) {
            return Err(DeformableError::invalid_config(format!(
                "max_dx_ratio must be positive, got {}",
                self.max_dx_ratio
            )));
        }
        if self.batch_size == 0 {
            return Err(DeformableError::invalid_config("batch_size must be non-zero"));
        }
        if !(self.det_small_threshold >= 0.0 && self.det_small_threshold < self.det_large_threshold)
        {
            return Err(DeformableError::invalid_config(format!(
                "determinant thresholds must satisfy 0 <= small < large, got {} and {}",
                self.det_small_threshold, self.det_large_threshold
            )));
        }
        Ok(())
    }
}

/// Statistics from one `apply` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ApplyStats {
    /// Iteration index of this call (0 for the first call after `init`).
    pub iteration: u32,
    /// Number of colors swept.
    pub num_colors: usize,
    /// Particles whose position was updated.
    pub particles_updated: usize,
    /// Particles skipped because their Hessian stayed ill-conditioned.
    pub ill_conditioned: usize,
    /// Particles skipped because their step exceeded the displacement bound.
    pub excessive_displacement: usize,
    /// Whether the SOR extrapolation ran.
    pub sor_applied: bool,
}

impl ApplyStats {
    /// Total particles skipped this call.
    #[must_use]
    pub const fn failures(&self) -> usize {
        self.ill_conditioned + self.excessive_displacement
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParticleUpdate {
    Step(Vector3<f64>),
    IllConditioned,
    TooFar,
}

/// Gauss-Seidel main constraint solver.
pub struct GaussSeidelSolver {
    config: GaussSeidelConfig,
    num_particles: usize,

    static_group: ConstraintGroup,
    dynamic_group: ConstraintGroup,
    transient_group: ConstraintGroup,
    per_node_hessians: Vec<Arc<dyn PerNodeHessian>>,

    static_colors: Option<Vec<Option<usize>>>,
    colors: Vec<Option<usize>>,
    particles_per_color: Vec<Vec<usize>>,
    coloring_dirty: bool,

    xtilde: Vec<Point3<f64>>,
    x_k: Vec<Point3<f64>>,
    x_k_1: Vec<Point3<f64>>,
    dt: f64,
    gravity: Vector3<f64>,
    max_dx: f64,
    iteration: u32,
    initialized: bool,
    stats: ApplyStats,
}

impl std::fmt::Debug for GaussSeidelSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GaussSeidelSolver")
            .field("config", &self.config)
            .field("num_particles", &self.num_particles)
            .field("static_group", &self.static_group)
            .field("dynamic_group", &self.dynamic_group)
            .field("transient_group", &self.transient_group)
            .field("per_node_hessians", &self.per_node_hessians.len())
            .field("num_colors", &self.particles_per_color.len())
            .field("iteration", &self.iteration)
            .field("max_dx", &self.max_dx)
            .finish_non_exhaustive()
    }
}

impl GaussSeidelSolver {
    /// Create a solver sized for `particles`.
    ///
    /// The displacement bound is derived from the bounding box of the
    /// particles' previous-step positions.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(particles: &ParticleSet, config: GaussSeidelConfig) -> Result<Self> {
        config.validate()?;
        let n = particles.len();
        let mut solver = Self {
            config,
            num_particles: n,
            static_group: ConstraintGroup::new(ConstraintCategory::Static, n),
            dynamic_group: ConstraintGroup::new(ConstraintCategory::Dynamic, n),
            transient_group: ConstraintGroup::new(ConstraintCategory::Transient, n),
            per_node_hessians: Vec::new(),
            static_colors: None,
            colors: vec![None; n],
            particles_per_color: Vec::new(),
            coloring_dirty: true,
            xtilde: vec![Point3::origin(); n],
            x_k: vec![Point3::origin(); n],
            x_k_1: vec![Point3::origin(); n],
            dt: 0.0,
            gravity: Vector3::zeros(),
            max_dx: f64::INFINITY,
            iteration: 0,
            initialized: false,
            stats: ApplyStats::default(),
        };
        solver.update_max_displacement(particles);
        Ok(solver)
    }

    /// Get the solver configuration.
    #[must_use]
    pub const fn config(&self) -> &GaussSeidelConfig {
        &self.config
    }

    /// Replace the solver configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid; the previous
    /// configuration is kept in that case.
    pub fn set_config(&mut self, config: GaussSeidelConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Statistics from the last `apply`.
    #[must_use]
    pub const fn stats(&self) -> &ApplyStats {
        &self.stats
    }

    /// Number of particles the solver is sized for.
    #[must_use]
    pub const fn num_particles(&self) -> usize {
        self.num_particles
    }

    /// Number of `apply` calls since the last `init`.
    #[must_use]
    pub const fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Current displacement bound (infinite when the particles span no volume).
    #[must_use]
    pub const fn max_displacement(&self) -> f64 {
        self.max_dx
    }

    /// Inertial targets captured by the last `init`.
    #[must_use]
    pub fn xtilde(&self) -> &[Point3<f64>] {
        &self.xtilde
    }

    /// SOR history `(X_k, X_k_1)`.
    #[must_use]
    pub fn history(&self) -> (&[Point3<f64>], &[Point3<f64>]) {
        (&self.x_k, &self.x_k_1)
    }

    /// The static constraint group.
    #[must_use]
    pub const fn static_group(&self) -> &ConstraintGroup {
        &self.static_group
    }

    /// The dynamic constraint group.
    #[must_use]
    pub const fn dynamic_group(&self) -> &ConstraintGroup {
        &self.dynamic_group
    }

    /// The transient constraint group.
    #[must_use]
    pub const fn transient_group(&self) -> &ConstraintGroup {
        &self.transient_group
    }

    /// Recompute the displacement bound from the bounding box of `particles`.
    pub fn update_max_displacement(&mut self, particles: &ParticleSet) {
        let diagonal = particles.bounding_box_diagonal();
        self.max_dx = if diagonal > 0.0 {
            diagonal * self.config.max_dx_ratio
        } else {
            f64::INFINITY
        };
    }

    /// Resize every per-particle buffer to exactly `num_particles`.
    ///
    /// Stale entries beyond the new size are dropped, constraints that
    /// reference removed particles are discarded, and the coloring is
    /// rebuilt before the next `apply`.
    ///
    /// The displacement bound is left as is; call
    /// [`Self::update_max_displacement`] with the resized particle set to
    /// derive it from the new bounding box.
    pub fn resize(&mut self, num_particles: usize) {
        self.num_particles = num_particles;
        self.static_group.resize(num_particles);
        self.dynamic_group.resize(num_particles);
        self.transient_group.resize(num_particles);

        self.xtilde.resize(num_particles, Point3::origin());
        self.x_k.resize(num_particles, Point3::origin());
        self.x_k_1.resize(num_particles, Point3::origin());

        self.static_colors = None;
        self.colors = vec![None; num_particles];
        self.particles_per_color.clear();
        self.coloring_dirty = true;
        self.initialized = false;
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Add static elements; returns the index of the first one.
    ///
    /// # Errors
    ///
    /// Returns an error if an element is empty or out of range.
    pub fn add_static_constraints<E: AsRef<[usize]>>(&mut self, elements: &[E]) -> Result<usize> {
        let offset = self.static_group.add_elements(elements, self.num_particles)?;
        self.static_colors = None;
        self.coloring_dirty = true;
        Ok(offset)
    }

    /// Add dynamic elements; returns the index of the first one.
    ///
    /// With `check_incident_elements` (or the config flag) the adjacency is
    /// validated afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if an element is empty or out of range.
    pub fn add_dynamic_constraints<E: AsRef<[usize]>>(
        &mut self,
        elements: &[E],
        check_incident_elements: bool,
    ) -> Result<usize> {
        let offset = self.dynamic_group.add_elements(elements, self.num_particles)?;
        if check_incident_elements || self.config.check_incident_elements {
            self.dynamic_group.check_incident_elements();
        }
        self.coloring_dirty = true;
        Ok(offset)
    }

    /// Add transient elements; returns the index of the first one.
    ///
    /// Transient elements live for one time step: `init` drops them, so add
    /// contacts after `init` and before the first `apply`.
    ///
    /// # Errors
    ///
    /// Returns an error if an element is empty or out of range.
    pub fn add_transient_constraints<E: AsRef<[usize]>>(
        &mut self,
        elements: &[E],
        check_incident_elements: bool,
    ) -> Result<usize> {
        let offset = self.transient_group.add_elements(elements, self.num_particles)?;
        if check_incident_elements || self.config.check_incident_elements {
            self.transient_group.check_incident_elements();
        }
        self.coloring_dirty = true;
        Ok(offset)
    }

    /// Register a static constraint kind covering the next `num_constraints`
    /// static elements; returns its offset.
    pub fn add_static_constraint_residual_and_hessian_range(
        &mut self,
        num_constraints: usize,
        kind: impl ResidualHessian + 'static,
    ) -> usize {
        self.static_group
            .add_residual_and_hessian_range(num_constraints, Arc::new(kind))
    }

    /// Register a dynamic constraint kind; returns its offset.
    pub fn add_dynamic_constraint_residual_and_hessian_range(
        &mut self,
        num_constraints: usize,
        kind: impl ResidualHessian + 'static,
    ) -> usize {
        self.dynamic_group
            .add_residual_and_hessian_range(num_constraints, Arc::new(kind))
    }

    /// Register a transient constraint kind; returns its offset.
    pub fn add_transient_constraint_residual_and_hessian_range(
        &mut self,
        num_constraints: usize,
        kind: impl ResidualHessian + 'static,
    ) -> usize {
        self.transient_group
            .add_residual_and_hessian_range(num_constraints, Arc::new(kind))
    }

    /// Register a per-particle Hessian augmentation.
    pub fn add_per_node_hessian(&mut self, augmentation: impl PerNodeHessian + 'static) {
        self.per_node_hessians.push(Arc::new(augmentation));
    }

    /// Drop every dynamic element and kind; static and transient groups are
    /// untouched.
    pub fn reset_dynamic_constraints(&mut self) {
        self.coloring_dirty |= !self.dynamic_group.is_empty();
        self.dynamic_group.clear();
    }

    /// Drop every transient element and kind.
    pub fn reset_transient_constraints(&mut self) {
        self.coloring_dirty |= !self.transient_group.is_empty();
        self.transient_group.clear();
    }

    // =========================================================================
    // Coloring
    // =========================================================================

    /// Color the particles using the static constraints only and cache the
    /// result as the seed for later colorings.
    ///
    /// Pinned particles are left uncolored. `apply` recolors on its own when
    /// a particle without a color has been unpinned since.
    pub fn init_static_color(&mut self, particles: &ParticleSet) {
        let colors = color_particles(
            self.num_particles,
            particles.inverse_masses(),
            &[&self.static_group],
            None,
        );
        self.particles_per_color = particles_per_color(&colors);
        debug!(
            particles = self.num_particles,
            colors = self.particles_per_color.len(),
            "Computed static coloring"
        );
        self.colors.clone_from(&colors);
        self.static_colors = Some(colors);
        self.coloring_dirty = !self.dynamic_group.is_empty() || !self.transient_group.is_empty();
    }

    /// Rebuild the coloring over all three groups, extending the cached
    /// static coloring.
    pub fn update_color(&mut self, particles: &ParticleSet) {
        if self.static_colors.is_none() {
            self.init_static_color(particles);
            if !self.coloring_dirty {
                return;
            }
        }
        let colors = color_particles(
            self.num_particles,
            particles.inverse_masses(),
            &[&self.static_group, &self.dynamic_group, &self.transient_group],
            self.static_colors.as_deref(),
        );
        self.particles_per_color = particles_per_color(&colors);
        self.colors = colors;
        self.coloring_dirty = false;
        debug!(
            colors = self.particles_per_color.len(),
            dynamic = self.dynamic_group.len(),
            transient = self.transient_group.len(),
            "Rebuilt particle coloring"
        );
    }

    /// Particles grouped by color.
    #[must_use]
    pub fn particles_per_color(&self) -> &[Vec<usize>] {
        &self.particles_per_color
    }

    /// Color of every particle (`None` for pinned particles).
    #[must_use]
    pub fn particle_colors(&self) -> &[Option<usize>] {
        &self.colors
    }

    /// Number of colors in the current coloring.
    #[must_use]
    pub fn num_colors(&self) -> usize {
        self.particles_per_color.len()
    }

    // =========================================================================
    // Time step
    // =========================================================================

    /// Start a time step.
    ///
    /// Captures the inertial targets `x̃ = X + dt·V + dt²·g`, seeds the SOR
    /// history with the current estimates, resets the iteration counter and
    /// clears the transient constraints.
    ///
    /// # Errors
    ///
    /// Returns an error if `particles` does not match the solver size or `dt`
    /// is not positive.
    pub fn init(&mut self, dt: f64, particles: &ParticleSet, gravity: Vector3<f64>) -> Result<()> {
        self.check_size(particles)?;
        if !(dt > 0.0 && dt.is_finite()) {
            return Err(DeformableError::invalid_config(format!(
                "time step must be positive, got {dt}"
            )));
        }

        self.dt = dt;
        self.gravity = gravity;
        let dt2 = dt * dt;
        for i in 0..self.num_particles {
            self.xtilde[i] = particles.x(i) + particles.v(i) * dt + gravity * dt2;
        }
        self.x_k.copy_from_slice(particles.positions());
        self.x_k_1.copy_from_slice(particles.positions());

        self.iteration = 0;
        if !self.transient_group.is_empty() {
            debug!(
                dropped = self.transient_group.len(),
                "Dropped transient constraints from the previous time step"
            );
        }
        self.reset_transient_constraints();
        self.initialized = true;
        Ok(())
    }

    /// Residual and Hessian of `particle`'s local energy.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `init`, with a mismatched particle
    /// set, or with an out-of-range particle.
    pub fn compute_newton_residuals(
        &self,
        particles: &ParticleSet,
        particle: usize,
    ) -> Result<(Vector3<f64>, Matrix3<f64>)> {
        self.check_ready(particles)?;
        if particle >= self.num_particles {
            return Err(DeformableError::index_out_of_bounds(format!(
                "particle {particle} of {}",
                self.num_particles
            )));
        }
        Ok(self.residual_and_hessian(particles, particle))
    }

    /// Norm of the stacked residuals of all free particles.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `init` or with a mismatched
    /// particle set.
    pub fn residual_norm(&self, particles: &ParticleSet) -> Result<f64> {
        self.check_ready(particles)?;
        let sum: f64 = (0..self.num_particles)
            .into_par_iter()
            .filter(|&i| particles.inv_mass(i) > 0.0)
            .map(|i| self.residual_and_hessian(particles, i).0.norm_squared())
            .sum();
        Ok(sum.sqrt())
    }

    /// Run one outer Gauss-Seidel iteration.
    ///
    /// Skipped particles are counted in the returned stats and logged; they
    /// are retried on the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if called before `init`, with a mismatched particle
    /// set, or when a registered element has no constraint kind.
    pub fn apply(&mut self, particles: &mut ParticleSet) -> Result<ApplyStats> {
        self.check_ready(particles)?;
        for group in [&self.static_group, &self.dynamic_group, &self.transient_group] {
            if !group.is_fully_registered() {
                return Err(DeformableError::invalid_constraint(format!(
                    "{} group has {} elements without a registered residual/Hessian kind",
                    group.category(),
                    group.len()
                )));
            }
        }

        let unpinned = self
            .colors
            .iter()
            .zip(particles.inverse_masses())
            .any(|(color, &w)| color.is_none() && w > 0.0);
        if unpinned {
            if self.static_colors.is_some() {
                debug!("Uncolored particle was unpinned, recoloring");
            }
            self.static_colors = None;
            self.coloring_dirty = true;
        }

        if self.coloring_dirty || self.static_colors.is_none() {
            self.update_color(particles);
        }
        debug_assert!(
            is_valid_coloring(
                &self.colors,
                &[&self.static_group, &self.dynamic_group, &self.transient_group]
            ),
            "particle coloring does not separate constrained particles"
        );

        let mut stats = ApplyStats {
            iteration: self.iteration,
            num_colors: self.particles_per_color.len(),
            ..ApplyStats::default()
        };

        for color in 0..self.particles_per_color.len() {
            let updates = self.solve_color(particles, &self.particles_per_color[color]);
            let positions = particles.positions_mut();
            for (particle, update) in updates {
                match update {
                    ParticleUpdate::Step(dx) => {
                        positions[particle] += dx;
                        stats.particles_updated += 1;
                    }
                    ParticleUpdate::IllConditioned => stats.ill_conditioned += 1,
                    ParticleUpdate::TooFar => stats.excessive_displacement += 1,
                }
            }
        }

        if self.config.enable_sor {
            stats.sor_applied = self.apply_sor(particles);
        }

        if stats.failures() > 0 {
            warn!(
                iteration = self.iteration,
                ill_conditioned = stats.ill_conditioned,
                excessive_displacement = stats.excessive_displacement,
                "Gauss-Seidel skipped particle updates"
            );
        }
        trace!(
            iteration = self.iteration,
            colors = stats.num_colors,
            updated = stats.particles_updated,
            sor = stats.sor_applied,
            "Gauss-Seidel iteration complete"
        );

        self.iteration += 1;
        self.stats = stats;
        Ok(stats)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn check_size(&self, particles: &ParticleSet) -> Result<()> {
        if particles.len() == self.num_particles {
            Ok(())
        } else {
            Err(DeformableError::particle_count_mismatch(
                self.num_particles,
                particles.len(),
            ))
        }
    }

    fn check_ready(&self, particles: &ParticleSet) -> Result<()> {
        if !self.initialized {
            return Err(DeformableError::not_initialized(
                "call init before solving a time step",
            ));
        }
        self.check_size(particles)
    }

    fn residual_and_hessian(
        &self,
        particles: &ParticleSet,
        particle: usize,
    ) -> (Vector3<f64>, Matrix3<f64>) {
        let mass = particles.mass(particle);
        let (mut residual, mut hessian) = if self.config.quasistatic {
            (
                -self.gravity * (self.dt * self.dt * mass),
                Matrix3::zeros(),
            )
        } else {
            (
                (particles.p(particle) - self.xtilde[particle]) * mass,
                Matrix3::identity() * mass,
            )
        };

        for group in [&self.static_group, &self.dynamic_group, &self.transient_group] {
            for &incidence in group.incident(particle) {
                group.accumulate(particles, incidence, self.dt, &mut residual, &mut hessian);
            }
        }

        for augmentation in &self.per_node_hessians {
            augmentation.augment(particle, self.dt, &mut hessian);
        }

        (residual, hessian)
    }

    fn solve_particle(&self, particles: &ParticleSet, particle: usize) -> ParticleUpdate {
        let (residual, hessian) = self.residual_and_hessian(particles, particle);
        match solve_local(&residual, &hessian, &self.config.conditioning()) {
            LocalSolve::Step(dx) if dx.norm() > self.max_dx => ParticleUpdate::TooFar,
            LocalSolve::Step(dx) => ParticleUpdate::Step(dx),
            LocalSolve::IllConditioned => ParticleUpdate::IllConditioned,
        }
    }

    /// Compute the steps of one color from a read-only view of the store.
    fn solve_color(&self, particles: &ParticleSet, bucket: &[usize]) -> Vec<(usize, ParticleUpdate)> {
        let free = |p: &usize| particles.inv_mass(*p) > 0.0;
        let solve = |p: usize| (p, self.solve_particle(particles, p));

        if bucket.len() < self.config.serial_threshold {
            bucket.iter().copied().filter(free).map(solve).collect()
        } else {
            bucket
                .par_chunks(self.config.batch_size)
                .flat_map_iter(|batch| batch.iter().copied().filter(free).map(solve))
                .collect()
        }
    }

    /// Extrapolate past the sweep and roll the two-iterate history.
    fn apply_sor(&mut self, particles: &mut ParticleSet) -> bool {
        let extrapolate = self.iteration > self.config.sor_warmup_iterations;
        let omega = self.config.omega_sor;
        let (positions, inv_mass) = particles.positions_and_inverse_masses_mut();

        positions
            .par_iter_mut()
            .zip(self.x_k.par_iter_mut())
            .zip(self.x_k_1.par_iter_mut())
            .zip(inv_mass.par_iter())
            .filter(|(_, w)| **w > 0.0)
            .for_each(|(((p, x_k), x_k_1), _)| {
                if extrapolate {
                    *p = *x_k_1 + (*p - *x_k_1) * omega;
                }
                *x_k_1 = *x_k;
                *x_k = *p;
            });

        extrapolate
    }
}
