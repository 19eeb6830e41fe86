//! Error types for the tally engine.
//!
//! Setup problems surface as [`ConfigurationError`] before any history is
//! transported. Per-event problems never reach the transport loop: a sample
//! outside every bin is an [`OutOfRange`] value that estimators absorb and
//! count.

use std::path::PathBuf;

use thiserror::Error;

use crate::phase_space::PhaseSpaceDimension;
use crate::types::{EntityId, EstimatorId, WorkerId};

/// Errors detected while configuring estimators and observers
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Estimator id {0} is already registered")]
    DuplicateEstimatorId(EstimatorId),

    #[error("Estimator {0} is not registered")]
    UnknownEstimator(EstimatorId),

    #[error("{dimension} bin boundaries need at least 2 values, got {count}")]
    TooFewBoundaries {
        dimension: PhaseSpaceDimension,
        count: usize,
    },

    #[error("{dimension} bin boundaries must be strictly increasing (index {index}: {value})")]
    UnsortedBoundaries {
        dimension: PhaseSpaceDimension,
        index: usize,
        value: f64,
    },

    #[error("{dimension} bin boundaries contain a non-finite value at index {index}")]
    NonFiniteBoundary {
        dimension: PhaseSpaceDimension,
        index: usize,
    },

    #[error("Estimator {0} has no entities")]
    NoEntities(EstimatorId),

    #[error("Estimator {estimator} lists entity {entity} more than once")]
    DuplicateEntity {
        estimator: EstimatorId,
        entity: EntityId,
    },

    #[error("Estimator {estimator} does not own entity {entity}")]
    EntityNotAssigned {
        estimator: EstimatorId,
        entity: EntityId,
    },

    #[error("Invalid multiplier for estimator {estimator}: {value} (must be > 0)")]
    InvalidMultiplier { estimator: EstimatorId, value: f64 },

    #[error("Invalid norm constant for entity {entity}: {value} (must be > 0)")]
    InvalidNormConstant { entity: EntityId, value: f64 },

    #[error("Invalid cosine cutoff: {0} (must be in (0, 1])")]
    InvalidCosineCutoff(f64),

    #[error("Estimator {0} accepts no particle types")]
    NoParticleTypes(EstimatorId),

    #[error("Estimator {estimator} ({kind}) cannot observe {event} events")]
    IncompatibleEvent {
        estimator: EstimatorId,
        kind: &'static str,
        event: &'static str,
    },

    #[error("Estimator {estimator} ({kind}) cannot be binned on {dimension}")]
    IncompatibleDimension {
        estimator: EstimatorId,
        kind: &'static str,
        dimension: PhaseSpaceDimension,
    },

    #[error("Thread support needs at least one worker")]
    NoWorkers,

    #[error("Invalid mesh: {0}")]
    InvalidMesh(String),

    #[error("Invalid response function '{name}': {reason}")]
    InvalidResponse { name: String, reason: String },

    #[error("Estimator {estimator} ({kind}) does not accept response functions")]
    IncompatibleResponse {
        estimator: EstimatorId,
        kind: &'static str,
    },

    #[error("Estimator {0} needs at least one response function")]
    NoResponses(EstimatorId),
}

/// Errors raised while reading a configuration document
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("Cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors raised by a single estimator while scoring
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EstimatorError {
    #[error("Estimator {estimator} does not own entity {entity}")]
    UnknownEntity {
        estimator: EstimatorId,
        entity: EntityId,
    },

    #[error("Worker {worker} is outside the {workers} enabled replicas")]
    WorkerOutOfRange { worker: WorkerId, workers: usize },
}

/// Raised by a discretization when a sample falls outside every bin
#[derive(Debug, Error, Clone, Copy, PartialEq)]
#[error("{dimension} value {value} is outside [{min}, {max}]")]
pub struct OutOfRange {
    pub dimension: PhaseSpaceDimension,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Errors from the collective reduction across ranks
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ReduceError {
    #[error("Ranks disagree on registered estimators (rank {rank} differs from target {target})")]
    Mismatch { rank: usize, target: usize },

    #[error("Target rank {target} is outside the communicator of size {size}")]
    InvalidTarget { target: usize, size: usize },

    #[error("Communicator failure: {0}")]
    Communicator(String),
}

/// Errors raised while handing data to a persistence sink
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink rejected record: {0}")]
    Rejected(String),
}

/// Errors raised while installing the log subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter: {0}")]
    Filter(String),

    #[error("Subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Top-level error for the demonstration driver
#[derive(Debug, Error)]
pub enum TallyError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    ConfigLoad(#[from] ConfigLoadError),

    #[error(transparent)]
    Estimator(#[from] EstimatorError),

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used by setup code
pub type ConfigResult<T> = Result<T, ConfigurationError>;
