//! # Engine Constants
//!
//! Numeric constants shared by the tally engine. Lengths are in cm,
//! energies in MeV and times in s unless stated otherwise.

// ============================================================================
// SURFACE ESTIMATORS
// ============================================================================

/// Default angle-cosine cutoff for surface flux estimators.
///
/// Crossings with |μ| below the cutoff score as if |μ| = cutoff / 2
/// (grazing-angle approximation).
pub const DEFAULT_COSINE_CUTOFF: f64 = 0.001;

// ============================================================================
// MESH TRACKING
// ============================================================================

/// Segments shorter than this (cm) are not split over mesh elements
pub const MIN_TRACK_LENGTH: f64 = 1e-12;

/// Relative tolerance used when clipping tracks against mesh planes
pub const PLANE_TOLERANCE: f64 = 1e-12;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Default contribution multiplier for an estimator
pub const DEFAULT_MULTIPLIER: f64 = 1.0;

/// Default normalization constant for an entity (volume, area or 1.0)
pub const DEFAULT_NORM_CONSTANT: f64 = 1.0;

/// Default number of worker replicas before thread support is enabled
pub const DEFAULT_WORKERS: usize = 1;

/// Rank that receives the reduced tables by default
pub const ROOT_RANK: usize = 0;

// ============================================================================
// PARTICLE KINEMATICS
// ============================================================================

/// Speed of light (cm/s)
pub const SPEED_OF_LIGHT: f64 = 2.997_924_58e10;

/// Neutron rest mass energy (MeV)
pub const NEUTRON_REST_MASS_ENERGY: f64 = 939.565_420_52;

/// Electron rest mass energy (MeV)
pub const ELECTRON_REST_MASS_ENERGY: f64 = 0.510_998_950;
