//! Run and estimator configuration.
//!
//! Configurations are plain serde structs read from JSON. Environment
//! variables override the run-level settings:
//!
//! - `TALLYSIM_WORKERS`: worker threads
//! - `TALLYSIM_HISTORIES`: histories to run
//! - `TALLYSIM_LOG_LEVEL` or `RUST_LOG`: log filter
//! - `TALLYSIM_JSON_LOGS`: JSON log output (true / 1)

use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{ConfigLoadError, ConfigResult, ConfigurationError};
use crate::estimator::{ContributionMultiplier, Estimator, EstimatorKind, ParticleResponse};
use crate::mesh::{MeshPlanes, StructuredHexMesh};
use crate::phase_space::PhaseSpaceDimension;
use crate::types::{EntityId, EstimatorId, ParticleType, Vec3};

// ============================================================================
// LOGGING
// ============================================================================

/// Log subscriber settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ============================================================================
// ESTIMATORS
// ============================================================================

/// Estimator kind as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorType {
    CellTrackLengthFlux,
    CellCollisionFlux,
    CellPulseHeight,
    SurfaceFlux,
    SurfaceCurrent,
    MeshTrackLengthFlux,
}

/// Entity with an optional normalization constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    pub id: EntityId,
    /// Volume, area or 1.0; mesh elements default to their volume
    #[serde(default)]
    pub norm: Option<f64>,
}

/// Bin boundaries of one dimension, in radix order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinConfig {
    pub dimension: PhaseSpaceDimension,
    pub boundaries: Vec<f64>,
}

/// One estimator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    pub id: EstimatorId,
    pub kind: EstimatorType,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default)]
    pub contribution_multiplier: ContributionMultiplier,
    /// Empty for mesh estimators means every element
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    /// Empty means every particle type
    #[serde(default)]
    pub particle_types: Vec<ParticleType>,
    #[serde(default)]
    pub bins: Vec<BinConfig>,
    /// Empty means the unit response only
    #[serde(default)]
    pub responses: Vec<ParticleResponse>,
    #[serde(default)]
    pub cosine_cutoff: Option<f64>,
    #[serde(default)]
    pub mesh: Option<MeshPlanes>,
}

fn default_multiplier() -> f64 {
    DEFAULT_MULTIPLIER
}

impl EstimatorConfig {
    /// Validate and build the estimator
    pub fn build(&self) -> ConfigResult<Estimator> {
        let mesh = match (self.kind, &self.mesh) {
            (EstimatorType::MeshTrackLengthFlux, Some(planes)) => {
                Some(StructuredHexMesh::new(planes.clone())?)
            }
            (EstimatorType::MeshTrackLengthFlux, None) => {
                return Err(ConfigurationError::InvalidMesh(format!(
                    "estimator {} has no mesh planes",
                    self.id
                )))
            }
            _ => None,
        };

        let entities: Vec<(EntityId, f64)> = match &mesh {
            Some(mesh) if self.entities.is_empty() => mesh
                .element_ids()
                .into_iter()
                .map(|e| (e, mesh.element_volume(e)))
                .collect(),
            Some(mesh) => self
                .entities
                .iter()
                .map(|e| {
                    let norm = if e.id < mesh.number_of_elements() as EntityId {
                        e.norm.unwrap_or_else(|| mesh.element_volume(e.id))
                    } else {
                        e.norm.unwrap_or(DEFAULT_NORM_CONSTANT)
                    };
                    (e.id, norm)
                })
                .collect(),
            None => self
                .entities
                .iter()
                .map(|e| (e.id, e.norm.unwrap_or(DEFAULT_NORM_CONSTANT)))
                .collect(),
        };

        let kind = match self.kind {
            EstimatorType::CellTrackLengthFlux => EstimatorKind::CellTrackLengthFlux,
            EstimatorType::CellCollisionFlux => EstimatorKind::CellCollisionFlux,
            EstimatorType::CellPulseHeight => EstimatorKind::CellPulseHeight,
            EstimatorType::SurfaceFlux => EstimatorKind::SurfaceFlux {
                cosine_cutoff: self.cosine_cutoff.unwrap_or(DEFAULT_COSINE_CUTOFF),
            },
            EstimatorType::SurfaceCurrent => EstimatorKind::SurfaceCurrent,
            EstimatorType::MeshTrackLengthFlux => match mesh {
                Some(mesh) => EstimatorKind::MeshTrackLengthFlux { mesh },
                None => return Err(ConfigurationError::InvalidMesh("missing mesh".into())),
            },
        };

        let mut estimator = Estimator::new(self.id, kind, self.multiplier, &entities)?
            .with_contribution_multiplier(self.contribution_multiplier);

        if !self.particle_types.is_empty() {
            estimator.set_particle_types(&self.particle_types)?;
        }
        for bin in &self.bins {
            estimator.set_bin_boundaries(bin.dimension, bin.boundaries.clone())?;
        }
        if !self.responses.is_empty() {
            estimator.set_response_functions(self.responses.clone())?;
        }

        Ok(estimator)
    }
}

// ============================================================================
// RUN
// ============================================================================

/// Complete tally configuration of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Worker threads (one replica each)
    pub workers: usize,
    /// Histories run by the driver
    pub histories: u64,
    /// RNG seed of the driver
    pub seed: u64,
    pub logging: LoggingConfig,
    pub estimators: Vec<EstimatorConfig>,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            histories: 10_000,
            seed: 12345,
            logging: LoggingConfig::default(),
            estimators: Vec::new(),
        }
    }
}

impl TallyConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Apply environment overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(workers) = env::var("TALLYSIM_WORKERS").ok().and_then(|v| v.parse().ok()) {
            self.workers = workers;
        }
        if let Some(histories) = env::var("TALLYSIM_HISTORIES").ok().and_then(|v| v.parse().ok()) {
            self.histories = histories;
        }
        if let Ok(level) = env::var("TALLYSIM_LOG_LEVEL").or_else(|_| env::var("RUST_LOG")) {
            self.logging.level = level;
        }
        if let Ok(v) = env::var("TALLYSIM_JSON_LOGS") {
            self.logging.json = v.to_lowercase() == "true" || v == "1";
        }
        self
    }

    /// Slab demonstration: two cells, their interface and a mesh over both
    pub fn slab_example() -> Self {
        let energy_bins = BinConfig {
            dimension: PhaseSpaceDimension::Energy,
            boundaries: vec![1e-3, 0.1, 1.0, 14.1],
        };

        Self {
            estimators: vec![
                EstimatorConfig {
                    id: 1,
                    kind: EstimatorType::CellTrackLengthFlux,
                    multiplier: 1.0,
                    contribution_multiplier: ContributionMultiplier::Weight,
                    entities: vec![
                        EntityConfig { id: 1, norm: Some(10.0) },
                        EntityConfig { id: 2, norm: Some(10.0) },
                    ],
                    particle_types: vec![ParticleType::Neutron],
                    bins: vec![energy_bins.clone()],
                    responses: vec![
                        ParticleResponse::Unit,
                        ParticleResponse::Tabulated {
                            name: Some("energy flux".to_string()),
                            dimension: PhaseSpaceDimension::Energy,
                            grid: vec![0.0, 20.0],
                            values: vec![0.0, 20.0],
                        },
                    ],
                    cosine_cutoff: None,
                    mesh: None,
                },
                EstimatorConfig {
                    id: 2,
                    kind: EstimatorType::SurfaceFlux,
                    multiplier: 1.0,
                    contribution_multiplier: ContributionMultiplier::Weight,
                    entities: vec![EntityConfig { id: 1, norm: Some(1.0) }],
                    particle_types: Vec::new(),
                    bins: vec![BinConfig {
                        dimension: PhaseSpaceDimension::Cosine,
                        boundaries: vec![-1.0, 0.0, 1.0],
                    }],
                    responses: Vec::new(),
                    cosine_cutoff: Some(DEFAULT_COSINE_CUTOFF),
                    mesh: None,
                },
                EstimatorConfig {
                    id: 3,
                    kind: EstimatorType::CellPulseHeight,
                    multiplier: 1.0,
                    contribution_multiplier: ContributionMultiplier::Weight,
                    entities: vec![EntityConfig { id: 2, norm: None }],
                    particle_types: Vec::new(),
                    bins: vec![BinConfig {
                        dimension: PhaseSpaceDimension::Energy,
                        boundaries: vec![0.0, 1.0, 5.0, 15.0],
                    }],
                    responses: Vec::new(),
                    cosine_cutoff: None,
                    mesh: None,
                },
                EstimatorConfig {
                    id: 4,
                    kind: EstimatorType::MeshTrackLengthFlux,
                    multiplier: 1.0,
                    contribution_multiplier: ContributionMultiplier::Weight,
                    entities: Vec::new(),
                    particle_types: Vec::new(),
                    bins: Vec::new(),
                    responses: Vec::new(),
                    cosine_cutoff: None,
                    mesh: Some(MeshPlanes::uniform(
                        Vec3::new(0.0, -5.0, -5.0),
                        Vec3::new(20.0, 5.0, 5.0),
                        [4, 1, 1],
                    )),
                },
            ],
            ..Self::default()
        }
    }
}
