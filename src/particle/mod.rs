//! # Particle Module
//!
//! Particle-state snapshot handed to estimators by the transport loop.
//!
//! The snapshot carries exactly what an estimator may bin or weight on:
//! position, direction, energy, time, collision number, weight, the
//! particle type tag and the cell the particle currently occupies. It also
//! remembers the source that started the history (energy, time and source
//! id at birth), inherited unchanged by every descendant.
//!
//! ## Kinematics
//!
//! Speed from kinetic energy E and rest mass energy m:
//!
//! ```text
//! γ = 1 + E/m,   v = c·sqrt(1 − 1/γ²)
//! ```
//!
//! Photons (m = 0) always travel at c.

use crate::constants::*;
use crate::types::{EntityId, ParticleType, Vec3};

/// Snapshot of a transported particle
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleState {
    /// Particle type tag
    pub particle_type: ParticleType,
    /// Position (cm)
    pub position: Vec3,
    /// Direction (unit vector)
    pub direction: Vec3,
    /// Kinetic energy (MeV)
    pub energy: f64,
    /// Statistical weight
    pub weight: f64,
    /// Time since source emission (s)
    pub time: f64,
    /// Number of collisions suffered so far
    pub collision_number: u32,
    /// Cell currently occupied
    pub cell: EntityId,
    /// History number
    pub history: u64,
    /// Energy at emission from the source (MeV)
    pub source_energy: f64,
    /// Time of emission from the source (s)
    pub source_time: f64,
    /// Source that emitted the history
    pub source_id: u32,
}

impl ParticleState {
    pub fn new(particle_type: ParticleType, history: u64) -> Self {
        Self {
            particle_type,
            position: Vec3::zero(),
            direction: Vec3::unit_z(),
            energy: 1.0,
            weight: 1.0,
            time: 0.0,
            collision_number: 0,
            cell: 0,
            history,
            source_energy: 1.0,
            source_time: 0.0,
            source_id: 0,
        }
    }

    /// Convenience constructor for a neutron
    pub fn neutron(history: u64) -> Self {
        Self::new(ParticleType::Neutron, history)
    }

    /// Convenience constructor for a photon
    pub fn photon(history: u64) -> Self {
        Self::new(ParticleType::Photon, history)
    }

    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = energy;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Direction is normalized on assignment
    pub fn with_direction(mut self, direction: Vec3) -> Self {
        self.direction = direction.normalize();
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = time;
        self
    }

    pub fn with_cell(mut self, cell: EntityId) -> Self {
        self.cell = cell;
        self
    }

    pub fn with_collision_number(mut self, collision_number: u32) -> Self {
        self.collision_number = collision_number;
        self
    }

    pub fn with_source_id(mut self, source_id: u32) -> Self {
        self.source_id = source_id;
        self
    }

    /// Record the current energy and time as the source state
    pub fn at_source(mut self) -> Self {
        self.source_energy = self.energy;
        self.source_time = self.time;
        self
    }

    /// Rest mass energy (MeV)
    pub fn rest_mass_energy(&self) -> f64 {
        match self.particle_type {
            ParticleType::Neutron | ParticleType::AdjointNeutron => NEUTRON_REST_MASS_ENERGY,
            ParticleType::Photon | ParticleType::AdjointPhoton => 0.0,
            _ => ELECTRON_REST_MASS_ENERGY,
        }
    }

    /// Speed (cm/s)
    pub fn speed(&self) -> f64 {
        let m = self.rest_mass_energy();
        if m <= 0.0 {
            return SPEED_OF_LIGHT;
        }
        let gamma = 1.0 + self.energy / m;
        SPEED_OF_LIGHT * (1.0 - 1.0 / (gamma * gamma)).sqrt()
    }

    /// Move particle by distance along its direction, advancing the clock
    pub fn advance(&mut self, distance: f64) {
        self.position = self.position + self.direction * distance;
        let v = self.speed();
        if v > 0.0 {
            self.time += distance / v;
        }
    }
}
