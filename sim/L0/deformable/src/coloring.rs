//! Particle graph coloring for parallel Gauss-Seidel sweeps.
//!
//! Two particles conflict when they share an element in any constraint group.
//! A coloring assigns each free particle a color so that no two conflicting
//! particles share one; the particles of a color can then be updated in
//! parallel without reading each other's positions.
//!
//! Pinned particles are never written, so they are left uncolored and do not
//! create conflicts.
//!
//! The coloring is greedy in particle-index order. Given a seed (the cached
//! static coloring), a particle keeps its seed color unless an
//! already-processed neighbor owns it, which extends the static coloring
//! with the dynamic and transient conflicts instead of recoloring from
//! scratch. Colors are renumbered densely afterwards, so color `c` is always
//! bucket `c` of [`particles_per_color`].

use crate::registry::ConstraintGroup;

/// Visit every free neighbor of `particle` across `groups`.
fn for_each_neighbor(
    particle: usize,
    inv_mass: &[f64],
    groups: &[&ConstraintGroup],
    mut visit: impl FnMut(usize),
) {
    for group in groups {
        for incidence in group.incident(particle) {
            for &other in &group.elements()[incidence.element] {
                if other != particle && inv_mass.get(other).is_some_and(|&w| w > 0.0) {
                    visit(other);
                }
            }
        }
    }
}

/// Color the free particles of `0..num_particles`.
///
/// `seed`, when given, holds preferred colors (typically the static
/// coloring). Pinned particles get `None`. The returned colors are dense:
/// every color below the largest one is used by some particle.
#[must_use]
pub fn color_particles(
    num_particles: usize,
    inv_mass: &[f64],
    groups: &[&ConstraintGroup],
    seed: Option<&[Option<usize>]>,
) -> Vec<Option<usize>> {
    let mut colors: Vec<Option<usize>> = vec![None; num_particles];
    // forbidden[c] == p + 1 marks color c as taken by a neighbor of p
    let mut forbidden: Vec<usize> = Vec::new();

    for particle in 0..num_particles {
        if inv_mass.get(particle).is_none_or(|&w| w == 0.0) {
            continue;
        }

        let stamp = particle + 1;
        for_each_neighbor(particle, inv_mass, groups, |other| {
            if let Some(c) = colors[other] {
                if c >= forbidden.len() {
                    forbidden.resize(c + 1, 0);
                }
                forbidden[c] = stamp;
            }
        });

        let is_free = |c: usize| forbidden.get(c).is_none_or(|&s| s != stamp);
        let preferred = seed
            .and_then(|s| s.get(particle).copied().flatten())
            .filter(|&c| is_free(c));

        colors[particle] = Some(preferred.unwrap_or_else(|| {
            (0..).find(|&c| is_free(c)).unwrap_or(0)
        }));
    }

    compact(&mut colors);
    colors
}

/// Renumber colors to `0..k` keeping their order, dropping unused ones.
fn compact(colors: &mut [Option<usize>]) {
    let num_colors = colors.iter().flatten().max().map_or(0, |&c| c + 1);
    let mut remap: Vec<Option<usize>> = vec![None; num_colors];
    for &c in colors.iter().flatten() {
        remap[c] = Some(0);
    }
    let mut next = 0;
    for slot in remap.iter_mut().flatten() {
        *slot = next;
        next += 1;
    }
    for c in colors.iter_mut().flatten() {
        *c = remap[*c].unwrap_or(*c);
    }
}

/// Group colored particles into buckets indexed by color.
///
/// Bucket `c` holds the particles of color `c`, sorted by index. Colorings
/// from [`color_particles`] are dense and never produce an empty bucket.
#[must_use]
pub fn particles_per_color(colors: &[Option<usize>]) -> Vec<Vec<usize>> {
    let num_colors = colors.iter().flatten().max().map_or(0, |&c| c + 1);
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); num_colors];
    for (particle, color) in colors.iter().enumerate() {
        if let Some(c) = *color {
            buckets[c].push(particle);
        }
    }
    buckets
}

/// Check that no two colored particles sharing an element have one color.
#[must_use]
pub fn is_valid_coloring(colors: &[Option<usize>], groups: &[&ConstraintGroup]) -> bool {
    groups.iter().all(|group| {
        group.elements().iter().all(|element| {
            element.iter().enumerate().all(|(i, &a)| {
                element[i + 1..].iter().all(|&b| {
                    a == b
                        || match (colors.get(a).copied().flatten(), colors.get(b).copied().flatten()) {
                            (Some(ca), Some(cb)) => ca != cb,
                            _ => true,
                        }
                })
            })
        })
    })
}
