//! Particle response functions.
//!
//! A response weights every raw score before it is binned. Each response an
//! estimator carries gets its own copy of the phase-space bins, so the bin
//! axis of the moment tables is `phase-space bins × responses` with the
//! response as the slowest-varying index:
//!
//! ```text
//! bin = response · phase_space_bins + phase_space_bin
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ConfigResult, ConfigurationError};
use crate::phase_space::{ObservationPoint, PhaseSpaceDimension};

/// Name of the unit response
pub const UNIT_RESPONSE_NAME: &str = "f(particle) = 1";

/// Function of the particle state applied to every raw score
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParticleResponse {
    /// f(particle) = 1
    #[default]
    Unit,
    /// Linear interpolation of `values` over `grid` on one dimension,
    /// zero outside the grid
    Tabulated {
        #[serde(default)]
        name: Option<String>,
        dimension: PhaseSpaceDimension,
        grid: Vec<f64>,
        values: Vec<f64>,
    },
}

impl ParticleResponse {
    /// Validated tabulated response
    pub fn tabulated(
        dimension: PhaseSpaceDimension,
        grid: Vec<f64>,
        values: Vec<f64>,
    ) -> ConfigResult<Self> {
        let response = ParticleResponse::Tabulated {
            name: None,
            dimension,
            grid,
            values,
        };
        response.validate()?;
        Ok(response)
    }

    /// Replace the generated name
    pub fn with_name(self, new_name: impl Into<String>) -> Self {
        match self {
            ParticleResponse::Tabulated { dimension, grid, values, .. } => {
                ParticleResponse::Tabulated {
                    name: Some(new_name.into()),
                    dimension,
                    grid,
                    values,
                }
            }
            unit => unit,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ParticleResponse::Unit => UNIT_RESPONSE_NAME.to_string(),
            ParticleResponse::Tabulated { name: Some(name), .. } => name.clone(),
            ParticleResponse::Tabulated { dimension, .. } => format!("f_custom({dimension})"),
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, ParticleResponse::Unit)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let ParticleResponse::Tabulated { dimension, grid, values, .. } = self else {
            return Ok(());
        };
        let invalid = |reason: &str| ConfigurationError::InvalidResponse {
            name: self.name(),
            reason: reason.to_string(),
        };

        // Only quantities carried by the particle itself
        if *dimension == PhaseSpaceDimension::Cosine {
            return Err(invalid("cosine is not a particle quantity"));
        }
        if grid.len() < 2 {
            return Err(invalid("grid needs at least 2 points"));
        }
        if grid.len() != values.len() {
            return Err(invalid("grid and values differ in length"));
        }
        if grid.iter().chain(values).any(|v| !v.is_finite()) {
            return Err(invalid("non-finite grid point or value"));
        }
        if grid.windows(2).any(|w| w[1] <= w[0]) {
            return Err(invalid("grid must be strictly increasing"));
        }
        Ok(())
    }

    /// Response at an observation
    pub fn evaluate(&self, point: &ObservationPoint<'_>) -> f64 {
        let ParticleResponse::Tabulated { dimension, grid, values, .. } = self else {
            return 1.0;
        };
        let Some(x) = point.value(*dimension) else {
            return 0.0;
        };

        let last = grid.len() - 1;
        if x < grid[0] || x > grid[last] {
            return 0.0;
        }
        // x >= grid[0], so at least one grid point is <= x
        let upper = grid.partition_point(|&g| g <= x).min(last);
        let lower = upper - 1;
        let t = (x - grid[lower]) / (grid[upper] - grid[lower]);
        values[lower] + t * (values[upper] - values[lower])
    }
}
