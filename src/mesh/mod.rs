//! # Mesh Module
//!
//! Structured hexahedral mesh used by mesh track-length estimators.
//!
//! The mesh is the tensor product of three sorted plane sets. Element
//! (i, j, k) spans `[x_i, x_{i+1}] × [y_j, y_{j+1}] × [z_k, z_{k+1}]` and has
//! handle `i + nx·(j + ny·k)`.
//!
//! ## Track splitting
//!
//! A straight segment `p(t) = a + t·(b − a)`, t ∈ [0, 1], is cut at every
//! plane crossing. Each sub-interval lies inside at most one element, found
//! from its midpoint:
//!
//! ```text
//! t_x = (x_i − a_x) / (b_x − a_x)      (same for y, z)
//! ℓ_e = (t_{n+1} − t_n) · |b − a|
//! ```

use serde::{Deserialize, Serialize};

use crate::constants::{MIN_TRACK_LENGTH, PLANE_TOLERANCE};
use crate::error::{ConfigResult, ConfigurationError};
use crate::phase_space::BinIndexComposer;
use crate::types::{EntityId, Vec3};

/// Plane coordinates of a structured hex mesh (cm)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshPlanes {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub z: Vec<f64>,
}

impl MeshPlanes {
    /// Uniform planes over a box with n elements per axis
    pub fn uniform(min: Vec3, max: Vec3, n: [usize; 3]) -> Self {
        let axis = |lo: f64, hi: f64, n: usize| -> Vec<f64> {
            (0..=n).map(|i| lo + (hi - lo) * i as f64 / n as f64).collect()
        };
        Self {
            x: axis(min.x, max.x, n[0]),
            y: axis(min.y, max.y, n[1]),
            z: axis(min.z, max.z, n[2]),
        }
    }
}

/// Structured hexahedral mesh
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredHexMesh {
    planes: [Vec<f64>; 3],
    composer: BinIndexComposer,
}

impl StructuredHexMesh {
    /// Validate plane sets and build the mesh
    pub fn new(planes: MeshPlanes) -> ConfigResult<Self> {
        let MeshPlanes { x, y, z } = planes;

        for (name, axis) in [("x", &x), ("y", &y), ("z", &z)] {
            if axis.len() < 2 {
                return Err(ConfigurationError::InvalidMesh(format!(
                    "{name} needs at least 2 planes, got {}",
                    axis.len()
                )));
            }
            if axis.iter().any(|p| !p.is_finite()) {
                return Err(ConfigurationError::InvalidMesh(format!(
                    "{name} planes must be finite"
                )));
            }
            if axis.windows(2).any(|w| w[1] <= w[0]) {
                return Err(ConfigurationError::InvalidMesh(format!(
                    "{name} planes must be strictly increasing"
                )));
            }
        }

        let composer = BinIndexComposer::new(vec![x.len() - 1, y.len() - 1, z.len() - 1]);
        Ok(Self { planes: [x, y, z], composer })
    }

    /// Plane coordinates of one axis (0 = x, 1 = y, 2 = z)
    pub fn planes(&self, axis: usize) -> &[f64] {
        &self.planes[axis]
    }

    pub fn number_of_elements(&self) -> usize {
        self.composer.total_bins()
    }

    /// Handle of element (i, j, k)
    pub fn element_id(&self, i: usize, j: usize, k: usize) -> EntityId {
        self.composer.compose(&[i, j, k]) as EntityId
    }

    /// Every element handle, in handle order
    pub fn element_ids(&self) -> Vec<EntityId> {
        (0..self.number_of_elements() as EntityId).collect()
    }

    /// Volume of an element (cm³)
    pub fn element_volume(&self, element: EntityId) -> f64 {
        let ijk = self.composer.decompose(element as usize);
        (0..3)
            .map(|axis| self.planes[axis][ijk[axis] + 1] - self.planes[axis][ijk[axis]])
            .product()
    }

    /// Is the point inside the mesh bounding box (boundary included)?
    pub fn contains(&self, point: &Vec3) -> bool {
        (0..3).all(|axis| {
            let planes = &self.planes[axis];
            let v = point.axis(axis);
            v >= planes[0] && v <= planes[planes.len() - 1]
        })
    }

    /// Element containing a point
    pub fn locate(&self, point: &Vec3) -> Option<EntityId> {
        if !self.contains(point) {
            return None;
        }

        let mut ijk = [0usize; 3];
        for (axis, slot) in ijk.iter_mut().enumerate() {
            let planes = &self.planes[axis];
            let upper = planes.partition_point(|&p| p <= point.axis(axis));
            *slot = (upper - 1).min(planes.len() - 2);
        }

        Some(self.element_id(ijk[0], ijk[1], ijk[2]))
    }

    /// Split a segment over the elements it crosses
    ///
    /// Returns (element, length) pairs in traversal order. Parts of the
    /// segment outside the mesh are dropped.
    pub fn track_lengths(&self, start: &Vec3, end: &Vec3) -> Vec<(EntityId, f64)> {
        let length = (*end - *start).mag();
        if length < MIN_TRACK_LENGTH {
            return Vec::new();
        }

        let mut cuts = vec![0.0, 1.0];
        for axis in 0..3 {
            let a = start.axis(axis);
            let delta = end.axis(axis) - a;
            if delta.abs() < PLANE_TOLERANCE * length {
                continue;
            }
            cuts.extend(
                self.planes[axis]
                    .iter()
                    .map(|&p| (p - a) / delta)
                    .filter(|&t| t > 0.0 && t < 1.0),
            );
        }
        cuts.sort_by(f64::total_cmp);
        cuts.dedup_by(|b, a| (*b - *a).abs() < PLANE_TOLERANCE);

        let mut lengths: Vec<(EntityId, f64)> = Vec::new();
        for w in cuts.windows(2) {
            let piece = (w[1] - w[0]) * length;
            if piece < MIN_TRACK_LENGTH {
                continue;
            }
            let midpoint = start.lerp(end, 0.5 * (w[0] + w[1]));
            if let Some(element) = self.locate(&midpoint) {
                match lengths.last_mut() {
                    Some((last, l)) if *last == element => *l += piece,
                    _ => lengths.push((element, piece)),
                }
            }
        }

        lengths
    }
}
