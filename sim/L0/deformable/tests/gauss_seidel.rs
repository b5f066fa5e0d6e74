//! Integration tests for the Gauss-Seidel deformable solver.
//!
//! Run with: cargo test -p sim-deformable --test gauss_seidel

use approx::assert_relative_eq;
use nalgebra::{Matrix3, Point3, Vector3};
use sim_deformable::{
    DeformableError, GaussSeidelConfig, GaussSeidelSolver, ParticleSet, SpringEnergy,
    is_valid_coloring,
};

// =============================================================================
// Helpers
// =============================================================================

/// Square cloth patch of `n × n` particles with structural springs.
fn cloth(n: usize, stiffness: f64) -> (ParticleSet, SpringEnergy) {
    let spacing = 1.0 / (n - 1) as f64;
    let mut positions = Vec::with_capacity(n * n);
    for j in 0..n {
        for i in 0..n {
            positions.push(Point3::new(i as f64 * spacing, j as f64 * spacing, 0.0));
        }
    }

    let mut edges = Vec::new();
    for j in 0..n {
        for i in 0..n {
            let idx = j * n + i;
            if i + 1 < n {
                edges.push([idx, idx + 1]);
            }
            if j + 1 < n {
                edges.push([idx, idx + n]);
            }
        }
    }

    let particles = ParticleSet::from_positions(&positions, &[]);
    let springs = SpringEnergy::from_positions(edges, &positions, stiffness).unwrap();
    (particles, springs)
}

fn solver_with_springs(
    particles: &ParticleSet,
    springs: SpringEnergy,
    config: GaussSeidelConfig,
) -> GaussSeidelSolver {
    let mut solver = GaussSeidelSolver::new(particles, config).unwrap();
    solver.add_static_constraints(springs.edges()).unwrap();
    solver.add_static_constraint_residual_and_hessian_range(springs.len(), springs);
    solver.init_static_color(particles);
    solver
}

// =============================================================================
// Pinned particles
// =============================================================================

#[test]
fn test_pinned_particles_are_bit_identical() {
    let (mut particles, springs) = cloth(5, 500.0);
    particles.pin(0);
    particles.pin(4);
    let pinned = [particles.p(0), particles.p(4)];

    let mut solver = solver_with_springs(&particles, springs, GaussSeidelConfig::accelerated());
    let dt = 1.0 / 60.0;
    let gravity = Vector3::new(0.0, 0.0, -9.81);

    for _ in 0..5 {
        particles.predict(dt, gravity);
        solver.init(dt, &particles, gravity).unwrap();
        for _ in 0..8 {
            solver.apply(&mut particles).unwrap();
            assert_eq!(particles.p(0), pinned[0]);
            assert_eq!(particles.p(4), pinned[1]);
        }
        particles.finish_step(dt);
    }

    assert_eq!(particles.x(0), pinned[0]);
    assert_eq!(particles.x(4), pinned[1]);
}

#[test]
fn test_particle_unpinned_after_coloring_is_solved() {
    let mut particles = ParticleSet::from_positions(
        &[Point3::origin(), Point3::new(1.0, 0.0, 0.0)],
        &[1.0, 1.0],
    );
    particles.pin(1);
    let springs = SpringEnergy::new(vec![[0, 1]], vec![1.0], 50.0).unwrap();
    let mut solver = solver_with_springs(&particles, springs, GaussSeidelConfig::default());
    assert_eq!(solver.particle_colors()[1], None);

    particles.unpin(1);
    particles.set_position(1, Point3::new(1.5, 0.0, 0.0));
    solver.init(0.1, &particles, Vector3::zeros()).unwrap();
    let initial = solver.residual_norm(&particles).unwrap();

    for _ in 0..5 {
        let stats = solver.apply(&mut particles).unwrap();
        assert_eq!(stats.particles_updated, 2);
    }

    let colors = solver.particle_colors();
    assert!(colors[1].is_some());
    assert_ne!(colors[0], colors[1]);
    assert!(particles.p(1).x < 1.5, "unpinned particle stayed at {}", particles.p(1));
    assert!(solver.residual_norm(&particles).unwrap() < initial);
}

#[test]
fn test_colors_index_their_buckets() {
    let (mut particles, springs) = cloth(4, 100.0);
    particles.pin(0);
    particles.pin(3);
    let mut solver = solver_with_springs(&particles, springs, GaussSeidelConfig::default());

    solver.init(1.0 / 60.0, &particles, Vector3::zeros()).unwrap();
    solver.add_transient_constraints(&[[1_usize, 6], [5, 15]], false).unwrap();
    solver.add_transient_constraint_residual_and_hessian_range(
        2,
        |_: &ParticleSet, _: usize, _: usize, _: f64, _: &mut Vector3<f64>, _: &mut Matrix3<f64>| {},
    );
    solver.apply(&mut particles).unwrap();

    let buckets = solver.particles_per_color();
    assert_eq!(solver.num_colors(), buckets.len());
    assert!(buckets.iter().all(|b| !b.is_empty()));
    for (particle, color) in solver.particle_colors().iter().enumerate() {
        match color {
            Some(c) => assert!(buckets[*c].contains(&particle)),
            None => assert!(particles.is_pinned(particle)),
        }
    }
}

// =============================================================================
// Isolated particles
// =============================================================================

#[test]
fn test_isolated_quasistatic_particle_stays_put() {
    let mut particles = ParticleSet::from_positions(&[Point3::new(0.5, -1.0, 2.0)], &[1.0]);
    let start = particles.p(0);

    let mut solver = GaussSeidelSolver::new(&particles, GaussSeidelConfig::quasistatic()).unwrap();
    // Without a constraint the quasistatic Hessian is zero; regularize it.
    solver.add_per_node_hessian(|_: usize, _: f64, h: &mut Matrix3<f64>| {
        *h += Matrix3::identity();
    });
    solver.init(0.01, &particles, Vector3::zeros()).unwrap();

    let stats = solver.apply(&mut particles).unwrap();
    assert_eq!(stats.failures(), 0);
    assert!((particles.p(0) - start).norm() <= 1e-12);
}

#[test]
fn test_isolated_quasistatic_particle_without_regularization_is_skipped() {
    let mut particles = ParticleSet::from_positions(&[Point3::new(0.5, -1.0, 2.0)], &[1.0]);
    let start = particles.p(0);

    let mut solver = GaussSeidelSolver::new(&particles, GaussSeidelConfig::quasistatic()).unwrap();
    solver.init(0.01, &particles, Vector3::zeros()).unwrap();

    let stats = solver.apply(&mut particles).unwrap();
    assert_eq!(stats.ill_conditioned, 1);
    assert_eq!(particles.p(0), start);
}

#[test]
fn test_initial_residual_and_hessian() {
    let mut particles = ParticleSet::from_positions(&[Point3::origin()], &[1.0]);
    particles.set_position(0, Point3::new(0.25, 0.5, -0.75));

    let mut solver = GaussSeidelSolver::new(&particles, GaussSeidelConfig::default()).unwrap();
    solver.init(0.1, &particles, Vector3::zeros()).unwrap();
    assert_eq!(solver.xtilde()[0], Point3::origin());

    let (residual, hessian) = solver.compute_newton_residuals(&particles, 0).unwrap();
    assert_relative_eq!(residual, particles.p(0) - solver.xtilde()[0]);
    assert_relative_eq!(hessian, Matrix3::identity() * particles.mass(0));
}

// =============================================================================
// Convergence
// =============================================================================

#[test]
fn test_two_particle_spring_converges() {
    let mut particles = ParticleSet::from_positions(
        &[Point3::origin(), Point3::new(1.0, 0.0, 0.0)],
        &[1.0, 1.0],
    );
    let springs = SpringEnergy::new(vec![[0, 1]], vec![1.0], 50.0).unwrap();
    let mut solver = solver_with_springs(&particles, springs, GaussSeidelConfig::default());
    assert_ne!(solver.particle_colors()[0], solver.particle_colors()[1]);

    // Start stretched; x̃ stays at the rest configuration.
    particles.set_position(1, Point3::new(1.6, 0.2, 0.0));
    solver.init(0.1, &particles, Vector3::zeros()).unwrap();

    let mut previous = solver.residual_norm(&particles).unwrap();
    for _ in 0..25 {
        solver.apply(&mut particles).unwrap();
        let norm = solver.residual_norm(&particles).unwrap();
        assert!(
            norm <= previous * (1.0 + 1e-6) + 1e-10,
            "residual grew from {previous} to {norm}"
        );
        previous = norm;
    }
    assert!(previous < 1e-6, "residual {previous} did not converge");
}

#[test]
fn test_sor_cloth_solve_stays_finite() {
    let iterations = 10;
    let residual_after = |config: GaussSeidelConfig| {
        let (mut particles, springs) = cloth(6, 200.0);
        particles.pin(0);
        particles.pin(5);
        let mut solver = solver_with_springs(&particles, springs, config);
        let dt = 1.0 / 30.0;
        let gravity = Vector3::new(0.0, 0.0, -9.81);
        solver.init(dt, &particles, gravity).unwrap();
        for _ in 0..iterations {
            solver.apply(&mut particles).unwrap();
        }
        solver.residual_norm(&particles).unwrap()
    };

    let plain = residual_after(GaussSeidelConfig::default());
    let accelerated = residual_after(GaussSeidelConfig::default().with_sor(1.3));
    assert!(plain.is_finite() && plain < 1.0, "plain residual {plain}");
    assert!(accelerated.is_finite() && accelerated < 1.0, "SOR residual {accelerated}");
}

// =============================================================================
// Registration
// =============================================================================

#[test]
fn test_zero_sized_kind_keeps_offsets() {
    let particles = ParticleSet::from_positions(&[Point3::origin(); 4], &[]);
    let noop = |_: &ParticleSet,
                _: usize,
                _: usize,
                _: f64,
                _: &mut Vector3<f64>,
                _: &mut Matrix3<f64>| {};

    let mut with_empty = GaussSeidelSolver::new(&particles, GaussSeidelConfig::default()).unwrap();
    let mut without = GaussSeidelSolver::new(&particles, GaussSeidelConfig::default()).unwrap();

    assert_eq!(with_empty.add_static_constraint_residual_and_hessian_range(0, noop), 0);
    let a = with_empty.add_static_constraint_residual_and_hessian_range(3, noop);
    let b = with_empty.add_static_constraint_residual_and_hessian_range(2, noop);

    let a2 = without.add_static_constraint_residual_and_hessian_range(3, noop);
    let b2 = without.add_static_constraint_residual_and_hessian_range(2, noop);

    assert_eq!((a, b), (a2, b2));
    assert_eq!((a, b), (0, 3));
}

#[test]
fn test_out_of_range_constraint_is_rejected() {
    let particles = ParticleSet::from_positions(&[Point3::origin(); 2], &[]);
    let mut solver = GaussSeidelSolver::new(&particles, GaussSeidelConfig::default()).unwrap();

    let result = solver.add_transient_constraints(&[[0_usize, 2]], true);
    assert!(matches!(result, Err(DeformableError::IndexOutOfBounds(_))));
    assert!(solver.transient_group().is_empty());
}

#[test]
fn test_dynamic_constraints_dispatch_to_their_kind() {
    let mut particles = ParticleSet::from_positions(
        &[Point3::origin(), Point3::new(1.0, 0.0, 0.0), Point3::new(2.0, 0.0, 0.0)],
        &[1.0, 1.0, 1.0],
    );
    let mut solver = GaussSeidelSolver::new(&particles, GaussSeidelConfig::default()).unwrap();

    // Static kind pushes along x, dynamic kind along y.
    let push = |axis: usize| {
        move |_: &ParticleSet,
              _: usize,
              _: usize,
              _: f64,
              r: &mut Vector3<f64>,
              _: &mut Matrix3<f64>| {
            r[axis] += 1.0;
        }
    };
    solver.add_static_constraints(&[[0_usize, 1]]).unwrap();
    solver.add_static_constraint_residual_and_hessian_range(1, push(0));
    solver.add_dynamic_constraints(&[[1_usize, 2]], true).unwrap();
    solver.add_dynamic_constraint_residual_and_hessian_range(1, push(1));

    solver.init(0.1, &particles, Vector3::zeros()).unwrap();
    let (r0, _) = solver.compute_newton_residuals(&particles, 0).unwrap();
    let (r1, _) = solver.compute_newton_residuals(&particles, 1).unwrap();
    let (r2, _) = solver.compute_newton_residuals(&particles, 2).unwrap();
    assert_eq!(r0, Vector3::new(1.0, 0.0, 0.0));
    assert_eq!(r1, Vector3::new(1.0, 1.0, 0.0));
    assert_eq!(r2, Vector3::new(0.0, 1.0, 0.0));

    solver.apply(&mut particles).unwrap();
    assert!(is_valid_coloring(
        solver.particle_colors(),
        &[solver.static_group(), solver.dynamic_group()]
    ));

    let (before, _) = solver.compute_newton_residuals(&particles, 1).unwrap();
    solver.reset_dynamic_constraints();
    let (after, _) = solver.compute_newton_residuals(&particles, 1).unwrap();
    assert_relative_eq!(before - after, Vector3::new(0.0, 1.0, 0.0), epsilon = 1e-12);
}

#[test]
fn test_transient_contacts_recolor() {
    let (mut particles, springs) = cloth(3, 100.0);
    let mut solver = solver_with_springs(&particles, springs, GaussSeidelConfig::default());
    let static_colors = solver.particles_per_color().len();

    let dt = 1.0 / 60.0;
    solver.init(dt, &particles, Vector3::zeros()).unwrap();
    // Contacts between particles that share a static color.
    let contacts = [[0_usize, 8], [2, 6]];
    solver.add_transient_constraints(&contacts, true).unwrap();
    solver.add_transient_constraint_residual_and_hessian_range(
        contacts.len(),
        |_: &ParticleSet, _: usize, _: usize, _: f64, _: &mut Vector3<f64>, _: &mut Matrix3<f64>| {},
    );

    let stats = solver.apply(&mut particles).unwrap();
    assert!(stats.num_colors > static_colors);
    assert!(is_valid_coloring(
        solver.particle_colors(),
        &[solver.static_group(), solver.transient_group()]
    ));

    // The next time step drops the contacts again.
    solver.init(dt, &particles, Vector3::zeros()).unwrap();
    let stats = solver.apply(&mut particles).unwrap();
    assert_eq!(stats.num_colors, static_colors);
}

// =============================================================================
// Resize and coloring scenarios
// =============================================================================

#[test]
fn test_resize_then_init_has_exact_sizes() {
    let big = ParticleSet::from_positions(&[Point3::new(1.0, 1.0, 1.0); 6], &[]);
    let mut solver = GaussSeidelSolver::new(&big, GaussSeidelConfig::default()).unwrap();
    solver.init(0.1, &big, Vector3::zeros()).unwrap();

    let small = ParticleSet::from_positions(&[Point3::origin(); 3], &[]);
    solver.resize(3);
    assert!(matches!(
        solver.compute_newton_residuals(&small, 0),
        Err(DeformableError::NotInitialized(_))
    ));
    solver.init(0.1, &small, Vector3::zeros()).unwrap();

    let (x_k, x_k_1) = solver.history();
    assert_eq!(x_k.len(), 3);
    assert_eq!(x_k_1.len(), 3);
    assert_eq!(solver.xtilde().len(), 3);
    assert!(x_k.iter().chain(x_k_1).chain(solver.xtilde()).all(|p| *p == Point3::origin()));
}

#[test]
fn test_four_particle_static_coloring() {
    let particles = ParticleSet::from_positions(
        &[
            Point3::origin(),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(1.0, 1.0, 0.0),
        ],
        &[],
    );
    let springs = SpringEnergy::from_positions(vec![[0, 1], [2, 3]], particles.positions(), 10.0)
        .unwrap();
    let solver = solver_with_springs(&particles, springs, GaussSeidelConfig::default());

    let buckets = solver.particles_per_color();
    assert_eq!(buckets.len(), 2);
    assert!(buckets.iter().all(|b| b.len() == 2));
    assert_eq!(buckets, &[vec![0, 2], vec![1, 3]]);
    for bucket in buckets {
        assert!(!(bucket.contains(&0) && bucket.contains(&1)));
        assert!(!(bucket.contains(&2) && bucket.contains(&3)));
    }
}

#[test]
fn test_parallel_and_serial_sweeps_agree() {
    let run = |config: GaussSeidelConfig| {
        let (mut particles, springs) = cloth(8, 300.0);
        particles.pin(0);
        let mut solver = solver_with_springs(&particles, springs, config);
        let dt = 1.0 / 60.0;
        let gravity = Vector3::new(0.0, 0.0, -9.81);
        particles.predict(dt, gravity);
        solver.init(dt, &particles, gravity).unwrap();
        for _ in 0..4 {
            solver.apply(&mut particles).unwrap();
        }
        particles.positions().to_vec()
    };

    let serial = run(GaussSeidelConfig::default().with_parallelism(16, usize::MAX));
    let parallel = run(GaussSeidelConfig::default().with_parallelism(3, 0));
    assert_eq!(serial, parallel);
}
