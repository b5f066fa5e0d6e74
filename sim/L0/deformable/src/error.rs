//! Error types for the Gauss-Seidel deformable solver.
//!
//! Per-particle numerical failures (ill-conditioned local systems, runaway
//! steps) are not errors: they are counted in
//! [`ApplyStats`](crate::solver::ApplyStats) and the particle is retried on
//! the next iteration.

use thiserror::Error;

/// Errors that can occur while building or driving the solver.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeformableError {
    /// A constraint references a particle outside the particle set.
    #[error("Index out of bounds: {0}")]
    IndexOutOfBounds(String),

    /// Constraint is invalid (e.g., empty element, no registered kind).
    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),

    /// Configuration error.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// `apply` or a residual query was issued before `init`.
    #[error("Solver not initialized: {0}")]
    NotInitialized(String),

    /// The particle set does not match the size the solver was built for.
    #[error("Particle count mismatch: solver sized for {expected}, got {actual}")]
    ParticleCountMismatch {
        /// Number of particles the solver state is sized for.
        expected: usize,
        /// Number of particles in the supplied set.
        actual: usize,
    },
}

impl DeformableError {
    /// Create an index out of bounds error.
    pub fn index_out_of_bounds(msg: impl Into<String>) -> Self {
        Self::IndexOutOfBounds(msg.into())
    }

    /// Create an invalid constraint error.
    pub fn invalid_constraint(msg: impl Into<String>) -> Self {
        Self::InvalidConstraint(msg.into())
    }

    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a not-initialized error.
    pub fn not_initialized(msg: impl Into<String>) -> Self {
        Self::NotInitialized(msg.into())
    }

    /// Create a particle count mismatch error.
    #[must_use]
    pub const fn particle_count_mismatch(expected: usize, actual: usize) -> Self {
        Self::ParticleCountMismatch { expected, actual }
    }
}

/// Result type for deformable solver operations.
pub type Result<T> = std::result::Result<T, DeformableError>;
