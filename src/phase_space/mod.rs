//! # Phase Space Module
//!
//! Observer phase-space dimensions and their discretization.
//!
//! ## Structure
//!
//! ```text
//! PhaseSpaceDimension        catalog of binnable quantities
//!   └─ DimensionDiscretization   sorted boundaries -> bin index
//!        └─ PhaseSpaceDiscretization  ordered dimensions -> linear bin
//! ```
//!
//! Spatial dimensions map to the cartesian position (x, y, z) and
//! directional dimensions to the direction cosines (u, v, w).

pub mod discretization;
pub mod index;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::particle::ParticleState;

pub use discretization::{DimensionDiscretization, PhaseSpaceDiscretization};
pub use index::BinIndexComposer;

// ============================================================================
// DIMENSION CATALOG
// ============================================================================

/// Physical dimension an estimator can be binned on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseSpaceDimension {
    PrimarySpatial,
    SecondarySpatial,
    TertiarySpatial,
    PrimaryDirectional,
    SecondaryDirectional,
    TertiaryDirectional,
    Energy,
    Time,
    CollisionNumber,
    Weight,
    /// Angle cosine against a surface normal or track start direction
    Cosine,
    /// Energy the history was born with
    SourceEnergy,
    /// Emission time of the history
    SourceTime,
    /// Source that emitted the history
    SourceId,
}

impl PhaseSpaceDimension {
    /// Every dimension in catalog order
    pub const ALL: [PhaseSpaceDimension; 14] = [
        PhaseSpaceDimension::PrimarySpatial,
        PhaseSpaceDimension::SecondarySpatial,
        PhaseSpaceDimension::TertiarySpatial,
        PhaseSpaceDimension::PrimaryDirectional,
        PhaseSpaceDimension::SecondaryDirectional,
        PhaseSpaceDimension::TertiaryDirectional,
        PhaseSpaceDimension::Energy,
        PhaseSpaceDimension::Time,
        PhaseSpaceDimension::CollisionNumber,
        PhaseSpaceDimension::Weight,
        PhaseSpaceDimension::Cosine,
        PhaseSpaceDimension::SourceEnergy,
        PhaseSpaceDimension::SourceTime,
        PhaseSpaceDimension::SourceId,
    ];

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            PhaseSpaceDimension::PrimarySpatial => "Primary Spatial Dimension",
            PhaseSpaceDimension::SecondarySpatial => "Secondary Spatial Dimension",
            PhaseSpaceDimension::TertiarySpatial => "Tertiary Spatial Dimension",
            PhaseSpaceDimension::PrimaryDirectional => "Primary Directional Dimension",
            PhaseSpaceDimension::SecondaryDirectional => "Secondary Directional Dimension",
            PhaseSpaceDimension::TertiaryDirectional => "Tertiary Directional Dimension",
            PhaseSpaceDimension::Energy => "Energy Dimension",
            PhaseSpaceDimension::Time => "Time Dimension",
            PhaseSpaceDimension::CollisionNumber => "Collision Number Dimension",
            PhaseSpaceDimension::Weight => "Weight Dimension",
            PhaseSpaceDimension::Cosine => "Cosine Dimension",
            PhaseSpaceDimension::SourceEnergy => "Source Energy Dimension",
            PhaseSpaceDimension::SourceTime => "Source Time Dimension",
            PhaseSpaceDimension::SourceId => "Source ID Dimension",
        }
    }

    /// Canonical short name (also the serialized form)
    pub fn basic_name(&self) -> &'static str {
        match self {
            PhaseSpaceDimension::PrimarySpatial => "primary_spatial",
            PhaseSpaceDimension::SecondarySpatial => "secondary_spatial",
            PhaseSpaceDimension::TertiarySpatial => "tertiary_spatial",
            PhaseSpaceDimension::PrimaryDirectional => "primary_directional",
            PhaseSpaceDimension::SecondaryDirectional => "secondary_directional",
            PhaseSpaceDimension::TertiaryDirectional => "tertiary_directional",
            PhaseSpaceDimension::Energy => "energy",
            PhaseSpaceDimension::Time => "time",
            PhaseSpaceDimension::CollisionNumber => "collision_number",
            PhaseSpaceDimension::Weight => "weight",
            PhaseSpaceDimension::Cosine => "cosine",
            PhaseSpaceDimension::SourceEnergy => "source_energy",
            PhaseSpaceDimension::SourceTime => "source_time",
            PhaseSpaceDimension::SourceId => "source_id",
        }
    }

    /// Label used in bin names ("Energy Bin: [a,b]")
    pub fn bin_label(&self) -> &'static str {
        match self {
            PhaseSpaceDimension::PrimarySpatial => "Primary Spatial Bin",
            PhaseSpaceDimension::SecondarySpatial => "Secondary Spatial Bin",
            PhaseSpaceDimension::TertiarySpatial => "Tertiary Spatial Bin",
            PhaseSpaceDimension::PrimaryDirectional => "Primary Directional Bin",
            PhaseSpaceDimension::SecondaryDirectional => "Secondary Directional Bin",
            PhaseSpaceDimension::TertiaryDirectional => "Tertiary Directional Bin",
            PhaseSpaceDimension::Energy => "Energy Bin",
            PhaseSpaceDimension::Time => "Time Bin",
            PhaseSpaceDimension::CollisionNumber => "Collision Number Bin",
            PhaseSpaceDimension::Weight => "Weight Bin",
            PhaseSpaceDimension::Cosine => "Cosine Bin",
            PhaseSpaceDimension::SourceEnergy => "Source Energy Bin",
            PhaseSpaceDimension::SourceTime => "Source Time Bin",
            PhaseSpaceDimension::SourceId => "Source ID Bin",
        }
    }

    /// Look up a dimension by its basic name
    pub fn from_basic_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.basic_name() == name)
    }

    /// Is this one of the three spatial dimensions?
    pub fn is_spatial(&self) -> bool {
        matches!(
            self,
            PhaseSpaceDimension::PrimarySpatial
                | PhaseSpaceDimension::SecondarySpatial
                | PhaseSpaceDimension::TertiarySpatial
        )
    }

    /// Is this a property of the source rather than the current state?
    pub fn is_source(&self) -> bool {
        matches!(
            self,
            PhaseSpaceDimension::SourceEnergy
                | PhaseSpaceDimension::SourceTime
                | PhaseSpaceDimension::SourceId
        )
    }

    /// Is this one of the three directional dimensions?
    pub fn is_directional(&self) -> bool {
        matches!(
            self,
            PhaseSpaceDimension::PrimaryDirectional
                | PhaseSpaceDimension::SecondaryDirectional
                | PhaseSpaceDimension::TertiaryDirectional
        )
    }
}

impl fmt::Display for PhaseSpaceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PhaseSpaceDimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_basic_name(s)
            .or_else(|| Self::ALL.iter().copied().find(|d| d.name() == s))
            .ok_or_else(|| format!("unknown phase space dimension '{s}'"))
    }
}

// ============================================================================
// OBSERVATION POINT
// ============================================================================

/// Values an estimator bins a single contribution on
///
/// Wraps the particle snapshot with the event-specific quantities that are
/// not part of the particle itself.
#[derive(Debug, Clone, Copy)]
pub struct ObservationPoint<'a> {
    pub particle: &'a ParticleState,
    /// Angle cosine for surface crossings / track starts
    pub angle_cosine: Option<f64>,
    /// Replaces the particle energy on the energy dimension (pulse height)
    pub energy: Option<f64>,
}

impl<'a> ObservationPoint<'a> {
    pub fn new(particle: &'a ParticleState) -> Self {
        Self {
            particle,
            angle_cosine: None,
            energy: None,
        }
    }

    pub fn with_angle_cosine(mut self, angle_cosine: f64) -> Self {
        self.angle_cosine = Some(angle_cosine);
        self
    }

    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = Some(energy);
        self
    }

    /// Sample value on a dimension, None if the event does not provide it
    pub fn value(&self, dimension: PhaseSpaceDimension) -> Option<f64> {
        let p = self.particle;
        match dimension {
            PhaseSpaceDimension::PrimarySpatial => Some(p.position.x),
            PhaseSpaceDimension::SecondarySpatial => Some(p.position.y),
            PhaseSpaceDimension::TertiarySpatial => Some(p.position.z),
            PhaseSpaceDimension::PrimaryDirectional => Some(p.direction.x),
            PhaseSpaceDimension::SecondaryDirectional => Some(p.direction.y),
            PhaseSpaceDimension::TertiaryDirectional => Some(p.direction.z),
            PhaseSpaceDimension::Energy => Some(self.energy.unwrap_or(p.energy)),
            PhaseSpaceDimension::Time => Some(p.time),
            PhaseSpaceDimension::CollisionNumber => Some(p.collision_number as f64),
            PhaseSpaceDimension::Weight => Some(p.weight),
            PhaseSpaceDimension::Cosine => self.angle_cosine,
            PhaseSpaceDimension::SourceEnergy => Some(p.source_energy),
            PhaseSpaceDimension::SourceTime => Some(p.source_time),
            PhaseSpaceDimension::SourceId => Some(f64::from(p.source_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;

    #[test]
    fn test_names_round_trip() {
        for d in PhaseSpaceDimension::ALL {
            assert_eq!(PhaseSpaceDimension::from_basic_name(d.basic_name()), Some(d));
            assert_eq!(d.name().parse::<PhaseSpaceDimension>(), Ok(d));
        }
        assert!("flux".parse::<PhaseSpaceDimension>().is_err());
    }

    #[test]
    fn test_dimension_groups() {
        assert!(PhaseSpaceDimension::SecondarySpatial.is_spatial());
        assert!(PhaseSpaceDimension::TertiaryDirectional.is_directional());
        assert!(!PhaseSpaceDimension::Energy.is_spatial());
        assert!(PhaseSpaceDimension::SourceId.is_source());
        assert!(!PhaseSpaceDimension::Time.is_source());
        assert_eq!(PhaseSpaceDimension::Energy.to_string(), "Energy Dimension");
    }

    #[test]
    fn test_observation_values() {
        let p = ParticleState::neutron(0)
            .with_position(Vec3::new(1.0, 2.0, 3.0))
            .with_direction(Vec3::unit_y())
            .with_energy(2.5)
            .with_collision_number(4);

        let point = ObservationPoint::new(&p);
        assert_eq!(point.value(PhaseSpaceDimension::SecondarySpatial), Some(2.0));
        assert_eq!(point.value(PhaseSpaceDimension::SecondaryDirectional), Some(1.0));
        assert_eq!(point.value(PhaseSpaceDimension::Energy), Some(2.5));
        assert_eq!(point.value(PhaseSpaceDimension::CollisionNumber), Some(4.0));
        assert_eq!(point.value(PhaseSpaceDimension::Cosine), None);

        assert_eq!(point.value(PhaseSpaceDimension::SourceEnergy), Some(1.0));

        let point = point.with_angle_cosine(0.5).with_energy(0.1);
        assert_eq!(point.value(PhaseSpaceDimension::Cosine), Some(0.5));
        assert_eq!(point.value(PhaseSpaceDimension::Energy), Some(0.1));
    }

    #[test]
    fn test_source_values() {
        let p = ParticleState::neutron(0)
            .with_energy(14.1)
            .with_time(1e-8)
            .with_source_id(2)
            .at_source()
            .with_energy(0.3);

        let point = ObservationPoint::new(&p);
        assert_eq!(point.value(PhaseSpaceDimension::Energy), Some(0.3));
        assert_eq!(point.value(PhaseSpaceDimension::SourceEnergy), Some(14.1));
        assert_eq!(point.value(PhaseSpaceDimension::SourceTime), Some(1e-8));
        assert_eq!(point.value(PhaseSpaceDimension::SourceId), Some(2.0));

        // The pulse-height energy override leaves the source energy alone
        let point = point.with_energy(5.0);
        assert_eq!(point.value(PhaseSpaceDimension::SourceEnergy), Some(14.1));
    }
}
