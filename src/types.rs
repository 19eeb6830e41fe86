//! # Core Types
//!
//! Fundamental types shared by every level of the tally engine.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Process-unique estimator identifier, never reused
pub type EstimatorId = u32;

/// Opaque geometry handle (cell, surface or mesh element)
pub type EntityId = u64;

/// Index of a parallel worker thread (0-based)
pub type WorkerId = usize;

// ============================================================================
// VECTOR TYPES (3D)
// ============================================================================

/// 3D vector for positions and directions (cm, unitless)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Create new vector
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Zero vector
    pub const fn zero() -> Self {
        Self { x: 0.0, y: 0.0, z: 0.0 }
    }

    /// Unit vectors
    pub const fn unit_x() -> Self { Self::new(1.0, 0.0, 0.0) }
    pub const fn unit_y() -> Self { Self::new(0.0, 1.0, 0.0) }
    pub const fn unit_z() -> Self { Self::new(0.0, 0.0, 1.0) }

    /// Magnitude squared
    pub fn mag_squared(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Magnitude
    pub fn mag(&self) -> f64 {
        self.mag_squared().sqrt()
    }

    /// Normalize to unit vector
    pub fn normalize(&self) -> Self {
        let m = self.mag();
        if m > 1e-15 {
            Self::new(self.x / m, self.y / m, self.z / m)
        } else {
            Self::zero()
        }
    }

    /// Dot product
    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Component by axis index (0 = x, 1 = y, 2 = z)
    pub fn axis(&self, axis: usize) -> f64 {
        match axis {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }

    /// Point at parameter t along the segment from self to other
    pub fn lerp(&self, other: &Self, t: f64) -> Self {
        Self::new(
            self.x + t * (other.x - self.x),
            self.y + t * (other.y - self.y),
            self.z + t * (other.z - self.z),
        )
    }
}

impl std::ops::Add for Vec3 {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self::new(self.x + other.x, self.y + other.y, self.z + other.z)
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }
}

impl std::ops::Mul<f64> for Vec3 {
    type Output = Self;
    fn mul(self, s: f64) -> Self {
        Self::new(self.x * s, self.y * s, self.z * s)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6e}, {:.6e}, {:.6e})", self.x, self.y, self.z)
    }
}

// ============================================================================
// PARTICLE TYPES
// ============================================================================

/// Transported particle type (forward and adjoint)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticleType {
    Neutron,
    Photon,
    Electron,
    Positron,
    AdjointNeutron,
    AdjointPhoton,
    AdjointElectron,
    AdjointPositron,
}

impl ParticleType {
    /// All particle types, in tag order
    pub const ALL: [ParticleType; 8] = [
        ParticleType::Neutron,
        ParticleType::Photon,
        ParticleType::Electron,
        ParticleType::Positron,
        ParticleType::AdjointNeutron,
        ParticleType::AdjointPhoton,
        ParticleType::AdjointElectron,
        ParticleType::AdjointPositron,
    ];

    /// Tag used by [`ParticleTypeSet`]
    pub fn tag(&self) -> u8 {
        match self {
            ParticleType::Neutron => 0,
            ParticleType::Photon => 1,
            ParticleType::Electron => 2,
            ParticleType::Positron => 3,
            ParticleType::AdjointNeutron => 4,
            ParticleType::AdjointPhoton => 5,
            ParticleType::AdjointElectron => 6,
            ParticleType::AdjointPositron => 7,
        }
    }

    /// Is this an adjoint particle?
    pub fn is_adjoint(&self) -> bool {
        self.tag() >= 4
    }

    /// Is this a charged particle?
    pub fn is_charged(&self) -> bool {
        matches!(
            self,
            ParticleType::Electron
                | ParticleType::Positron
                | ParticleType::AdjointElectron
                | ParticleType::AdjointPositron
        )
    }

    /// Human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            ParticleType::Neutron => "neutron",
            ParticleType::Photon => "photon",
            ParticleType::Electron => "electron",
            ParticleType::Positron => "positron",
            ParticleType::AdjointNeutron => "adjoint neutron",
            ParticleType::AdjointPhoton => "adjoint photon",
            ParticleType::AdjointElectron => "adjoint electron",
            ParticleType::AdjointPositron => "adjoint positron",
        }
    }
}

impl fmt::Display for ParticleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of accepted particle types, resolved to a bitmask at registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParticleTypeSet(u8);

impl ParticleTypeSet {
    /// Empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set containing every particle type
    pub const fn all() -> Self {
        Self(u8::MAX)
    }

    /// Build from a list of types
    pub fn from_types(types: &[ParticleType]) -> Self {
        types.iter().fold(Self::empty(), |set, t| set.with(*t))
    }

    /// Copy of this set with one more type
    pub fn with(self, particle_type: ParticleType) -> Self {
        Self(self.0 | (1 << particle_type.tag()))
    }

    /// Membership test
    #[inline]
    pub fn contains(&self, particle_type: ParticleType) -> bool {
        self.0 & (1 << particle_type.tag()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Members in tag order
    pub fn types(&self) -> Vec<ParticleType> {
        ParticleType::ALL
            .iter()
            .copied()
            .filter(|t| self.contains(*t))
            .collect()
    }
}
