//! # TALLYSIM-RS
//!
//! Event-driven tally engine for Monte Carlo particle transport
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          TALLYSIM-RS                                        │
//! │              Estimator Engine for Particle Transport                        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  LEVEL 1: PHASE SPACE (dimensions, discretization, mixed-radix bins)        │
//! │  LEVEL 2: ESTIMATORS (per-worker replicas, history commit, S1/S2 moments)   │
//! │  LEVEL 3: DISPATCH (event kind × entity → estimators)                       │
//! │  LEVEL 4: EVENT HANDLER (threads, commit, reset, reduce, export)            │
//! │  LEVEL 5: COMMUNICATION (rank reduction) + EXPORT (pluggable sinks)         │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Estimators
//!
//! | Estimator             | Event                     | Score          |
//! |-----------------------|---------------------------|----------------|
//! | Cell track-length     | subtrack ending in cell   | w·ℓ            |
//! | Cell collision        | colliding in cell         | w/Σt           |
//! | Cell pulse height     | entering / leaving cell   | deposition bin |
//! | Surface flux          | crossing surface          | w/\|μ\|        |
//! | Surface current       | crossing surface          | w              |
//! | Mesh track-length     | subtrack ending (global)  | w·ℓ per element|
//!
//! The transport loop itself (physics, geometry) lives outside this crate
//! and talks to it through [`handler::EventHandler`].

pub mod constants;
pub mod types;
pub mod error;
pub mod particle;
pub mod phase_space;
pub mod estimator;
pub mod mesh;
pub mod dispatch;
pub mod comm;
pub mod handler;
pub mod export;
pub mod config;
pub mod logging;

// Re-exports
pub use constants::*;
pub use types::*;
pub use error::{
    ConfigLoadError, ConfigurationError, EstimatorError, ExportError, LoggingError, OutOfRange,
    ReduceError, TallyError,
};
pub use particle::ParticleState;
pub use phase_space::{
    BinIndexComposer, DimensionDiscretization, ObservationPoint, PhaseSpaceDimension,
    PhaseSpaceDiscretization,
};
pub use estimator::{
    ContributionMultiplier, Estimator, EstimatorKind, MomentPair, ParticleResponse,
    ProcessedMoments,
};
pub use dispatch::{EventKind, ObserverRegistry};
pub use comm::{Communicator, LocalCommunicator, SerialCommunicator};
pub use handler::{EventHandler, RunContext};
pub use export::{JsonSink, MemorySink, ObserverDataSink};
pub use config::TallyConfig;

/// TALLYSIM version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Information about the engine
pub fn info() -> String {
    format!(
        "TALLYSIM-RS v{}\n\
         Event-driven tally engine for Monte Carlo particle transport\n\
         Per-worker history replicas, two-moment statistics, rank reduction",
        VERSION
    )
}
