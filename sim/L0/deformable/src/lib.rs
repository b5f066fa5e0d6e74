//! Gauss-Seidel Newton solver for deformable bodies.
//!
//! This crate advances deformable bodies (cloth, soft bodies, ropes) by
//! minimizing the implicit-Euler incremental potential one particle at a
//! time:
//!
//! ```text
//! E(x) = ½ Σ mᵢ |xᵢ - x̃ᵢ|² + dt² Σ E_c(x)
//! ```
//!
//! Each particle takes a Newton step on its own 3×3 system using the latest
//! positions of its neighbors (nonlinear Gauss-Seidel). Particles are graph
//! colored so that every color can be swept in parallel.
//!
//! # Building Blocks
//!
//! - [`ParticleSet`]: caller-owned particle store (`X`, `V`, `P`, masses)
//! - [`ConstraintGroup`]: elements, adjacency and constraint kinds of the
//!   static, dynamic and transient groups
//! - [`ResidualHessian`]: per-kind energy callbacks ([`SpringEnergy`] built in)
//! - [`color_particles`]: conflict-free particle coloring
//! - [`solve_local`]: safeguarded closed-form 3×3 Newton step
//! - [`GaussSeidelSolver`]: the driver (`init` once per step, `apply` per
//!   outer iteration, optional SOR acceleration)
//!
//! # Failure Model
//!
//! A particle whose local Hessian is ill-conditioned, or whose step exceeds
//! the displacement bound, is skipped for that iteration and counted in
//! [`ApplyStats`]; the solve continues. Registry corruption is a programming
//! error and panics in [`ConstraintGroup::check_incident_elements`].
//!
//! # Quick Start
//!
//! ```
//! use sim_deformable::{GaussSeidelConfig, GaussSeidelSolver, ParticleSet, SpringEnergy};
//! use nalgebra::{Point3, Vector3};
//!
//! // A two-particle rope hanging from a pinned particle.
//! let mut particles = ParticleSet::from_positions(
//!     &[Point3::new(0.0, 0.0, 1.0), Point3::new(1.0, 0.0, 1.0)],
//!     &[1.0, 1.0],
//! );
//! particles.pin(0);
//!
//! let springs = SpringEnergy::from_positions(vec![[0, 1]], particles.positions(), 1e3)?;
//! let mut solver = GaussSeidelSolver::new(&particles, GaussSeidelConfig::default())?;
//! solver.add_static_constraints(springs.edges())?;
//! solver.add_static_constraint_residual_and_hessian_range(springs.len(), springs);
//! solver.init_static_color(&particles);
//!
//! let dt = 1.0 / 60.0;
//! let gravity = Vector3::new(0.0, 0.0, -9.81);
//! particles.predict(dt, gravity);
//! solver.init(dt, &particles, gravity)?;
//! for _ in 0..10 {
//!     solver.apply(&mut particles)?;
//! }
//! particles.finish_step(dt);
//!
//! assert_eq!(particles.x(0), Point3::new(0.0, 0.0, 1.0));
//! assert!(particles.x(1).z < 1.0);
//! # Ok::<(), sim_deformable::DeformableError>(())
//! ```
//!
//! # Layer 0 Crate
//!
//! This is a Layer 0 crate with **zero Bevy dependencies**. It can be used in:
//!
//! - Headless training loops for reinforcement learning
//! - Offline cloth and soft-body baking
//! - Integration with other physics engines

#![doc(html_root_url = "https://docs.rs/sim-deformable/0.1.0")]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![warn(missing_docs)]
// Allow precision loss when converting indices to f64 - these are small values
#![allow(clippy::cast_precision_loss)]
// Allow long functions for complex algorithms
#![allow(clippy::too_many_lines)]
// Test-related lints - these are style preferences
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::uninlined_format_args,
        clippy::float_cmp
    )
)]

pub mod coloring;
pub mod energy;
pub mod error;
pub mod local_solve;
pub mod registry;
pub mod solver;
pub mod types;

// Re-export main types at crate root
pub use coloring::{color_particles, is_valid_coloring, particles_per_color};
pub use energy::{PerNodeHessian, ResidualHessian, SpringEnergy};
pub use error::{DeformableError, Result};
pub use local_solve::{ConditioningThresholds, LocalSolve, solve_local};
pub use registry::{ConstraintCategory, ConstraintGroup, Element, Incidence, KindSlot};
pub use solver::{ApplyStats, GaussSeidelConfig, GaussSeidelSolver};
pub use types::ParticleSet;
