//! Constraint registries and callback tables.
//!
//! Constraints come in three groups with different lifetimes:
//!
//! - **Static**: fixed topology built once (mesh springs, elements)
//! - **Dynamic**: topology rebuilt from scratch every few steps
//! - **Transient**: rebuilt every step (collision contacts)
//!
//! Each [`ConstraintGroup`] stores its elements (ordered lists of participating
//! particles), the inverse particle → element adjacency, and a table of
//! constraint kinds. A kind covers a contiguous range of element indices
//! starting at the offset returned when it was registered:
//!
//! ```text
//! elements:  [ e0 e1 e2 | e3 e4 | e5 ... ]
//! kinds:       springs    tets    contacts
//! offsets:     0          3       5
//! ```
//!
//! Dispatch from an element to its kind is a binary search over the sorted
//! offsets, so zero-sized kinds never disturb the lookup.

use std::fmt;
use std::sync::Arc;

use nalgebra::{Matrix3, Vector3};
use smallvec::SmallVec;
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::energy::ResidualHessian;
use crate::error::{DeformableError, Result};
use crate::types::ParticleSet;

/// Participating particles of one element.
pub type Element = SmallVec<[usize; 4]>;

/// The three constraint groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConstraintCategory {
    /// Fixed topology, built once.
    Static,
    /// Topology rebuilt from scratch on demand.
    Dynamic,
    /// Rebuilt every time step.
    Transient,
}

impl fmt::Display for ConstraintCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static => write!(f, "static"),
            Self::Dynamic => write!(f, "dynamic"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

/// One adjacency entry: a particle appears in `element` at `slot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Incidence {
    /// Element index within the group.
    pub element: usize,
    /// Position of the particle within the element.
    pub slot: usize,
}

/// Result of dispatching an element to its constraint kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSlot {
    /// Index of the kind in registration order.
    pub kind: usize,
    /// Element index relative to the kind's offset.
    pub local: usize,
}

struct ConstraintKind {
    offset: usize,
    callback: Arc<dyn ResidualHessian>,
}

/// Elements, adjacency and constraint kinds of one group.
pub struct ConstraintGroup {
    category: ConstraintCategory,
    elements: Vec<Element>,
    incident: Vec<Vec<Incidence>>,
    kinds: Vec<ConstraintKind>,
    next_offset: usize,
}

impl fmt::Debug for ConstraintGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstraintGroup")
            .field("category", &self.category)
            .field("elements", &self.elements.len())
            .field("particles", &self.incident.len())
            .field("kinds", &self.kinds.len())
            .field("next_offset", &self.next_offset)
            .finish()
    }
}

impl ConstraintGroup {
    /// Create an empty group sized for `num_particles`.
    #[must_use]
    pub fn new(category: ConstraintCategory, num_particles: usize) -> Self {
        Self {
            category,
            elements: Vec::new(),
            incident: vec![Vec::new(); num_particles],
            kinds: Vec::new(),
            next_offset: 0,
        }
    }

    /// Which group this is.
    #[must_use]
    pub const fn category(&self) -> ConstraintCategory {
        self.category
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the group has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All elements in registration order.
    #[must_use]
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Elements touching `particle`, with the particle's slot in each.
    #[must_use]
    pub fn incident(&self, particle: usize) -> &[Incidence] {
        self.incident.get(particle).map_or(&[], Vec::as_slice)
    }

    /// Number of registered kinds (including zero-sized ones).
    #[must_use]
    pub fn num_kinds(&self) -> usize {
        self.kinds.len()
    }

    /// Append elements and extend the adjacency.
    ///
    /// Returns the index of the first appended element. Nothing is appended
    /// if any element fails validation.
    ///
    /// # Errors
    ///
    /// Returns an error if an element is empty or references a particle
    /// outside `0..num_particles`.
    pub fn add_elements<E: AsRef<[usize]>>(
        &mut self,
        elements: &[E],
        num_particles: usize,
    ) -> Result<usize> {
        for (i, element) in elements.iter().enumerate() {
            let nodes = element.as_ref();
            if nodes.is_empty() {
                return Err(DeformableError::invalid_constraint(format!(
                    "{} element {i} has no particles",
                    self.category
                )));
            }
            if let Some(&bad) = nodes.iter().find(|&&p| p >= num_particles) {
                return Err(DeformableError::index_out_of_bounds(format!(
                    "{} element {i} references particle {bad} of {num_particles}",
                    self.category
                )));
            }
        }

        if self.incident.len() < num_particles {
            self.incident.resize_with(num_particles, Vec::new);
        }

        let offset = self.elements.len();
        for (i, element) in elements.iter().enumerate() {
            let nodes = element.as_ref();
            for (slot, &particle) in nodes.iter().enumerate() {
                self.incident[particle].push(Incidence {
                    element: offset + i,
                    slot,
                });
            }
            self.elements.push(Element::from_slice(nodes));
        }

        debug!(
            category = %self.category,
            added = elements.len(),
            total = self.elements.len(),
            "Registered constraint elements"
        );
        Ok(offset)
    }

    /// Register a constraint kind covering the next `num_elements` elements.
    ///
    /// Returns the kind's offset. A zero-sized kind returns the current
    /// offset without moving it.
    pub fn add_residual_and_hessian_range(
        &mut self,
        num_elements: usize,
        callback: Arc<dyn ResidualHessian>,
    ) -> usize {
        let offset = self.next_offset;
        self.kinds.push(ConstraintKind { offset, callback });
        self.next_offset += num_elements;
        offset
    }

    /// Find the kind responsible for `element`.
    ///
    /// Kinds are stored with non-decreasing offsets, so the owner is the last
    /// kind whose offset does not exceed `element`. Zero-sized kinds share
    /// their offset with the next kind and are skipped by this rule.
    #[must_use]
    pub fn kind_of(&self, element: usize) -> Option<KindSlot> {
        if element >= self.next_offset {
            return None;
        }
        let kind = self
            .kinds
            .partition_point(|k| k.offset <= element)
            .checked_sub(1)?;
        Some(KindSlot {
            kind,
            local: element - self.kinds[kind].offset,
        })
    }

    /// Whether every element is covered by a registered kind.
    #[must_use]
    pub fn is_fully_registered(&self) -> bool {
        self.next_offset >= self.elements.len()
    }

    /// Dispatch one incidence of `particle` to its kind's callback.
    pub(crate) fn accumulate(
        &self,
        particles: &ParticleSet,
        incidence: Incidence,
        dt: f64,
        residual: &mut Vector3<f64>,
        hessian: &mut Matrix3<f64>,
    ) {
        if let Some(slot) = self.kind_of(incidence.element) {
            self.kinds[slot.kind].callback.accumulate(
                particles,
                slot.local,
                incidence.slot,
                dt,
                residual,
                hessian,
            );
        }
    }

    /// Assert that the adjacency is consistent with the elements.
    ///
    /// # Panics
    ///
    /// Panics if an entry names an element or slot out of range, or a slot
    /// that holds a different particle. Either means the registry was built
    /// incorrectly.
    pub fn check_incident_elements(&self) {
        for (particle, entries) in self.incident.iter().enumerate() {
            for entry in entries {
                assert!(
                    entry.element < self.elements.len(),
                    "{} adjacency of particle {particle}: element {} out of {}",
                    self.category,
                    entry.element,
                    self.elements.len()
                );
                let element = &self.elements[entry.element];
                assert!(
                    entry.slot < element.len(),
                    "{} adjacency of particle {particle}: slot {} out of arity {}",
                    self.category,
                    entry.slot,
                    element.len()
                );
                assert!(
                    element[entry.slot] == particle,
                    "{} adjacency of particle {particle}: element {} slot {} holds particle {}",
                    self.category,
                    entry.element,
                    entry.slot,
                    element[entry.slot]
                );
            }
        }
    }

    /// Remove all elements, adjacency and kinds.
    pub fn clear(&mut self) {
        self.elements.clear();
        for entries in &mut self.incident {
            entries.clear();
        }
        self.kinds.clear();
        self.next_offset = 0;
    }

    /// Resize the adjacency to exactly `num_particles`.
    ///
    /// Elements referencing removed particles are dropped together with their
    /// whole group state, since element indices would no longer be dense.
    pub fn resize(&mut self, num_particles: usize) {
        let stale = self
            .elements
            .iter()
            .any(|element| element.iter().any(|&p| p >= num_particles));
        if stale {
            debug!(
                category = %self.category,
                num_particles,
                "Resize dropped elements referencing removed particles"
            );
            self.elements.clear();
            self.kinds.clear();
            self.next_offset = 0;
            self.incident.clear();
        }
        self.incident.resize_with(num_particles, Vec::new);
    }

    #[cfg(test)]
    pub(crate) fn incident_mut(&mut self, particle: usize) -> &mut Vec<Incidence> {
        &mut self.incident[particle]
    }
}
