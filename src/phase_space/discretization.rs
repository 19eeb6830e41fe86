//! Bin boundaries per dimension and the ordered multi-dimensional binning.

use crate::error::{ConfigResult, ConfigurationError, OutOfRange};
use crate::phase_space::index::BinIndexComposer;
use crate::phase_space::{ObservationPoint, PhaseSpaceDimension};

// ============================================================================
// SINGLE DIMENSION
// ============================================================================

/// Sorted bin boundaries for one dimension
///
/// Bin `i` covers `[b[i], b[i+1])`; the top bin is closed on both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionDiscretization {
    dimension: PhaseSpaceDimension,
    boundaries: Vec<f64>,
}

impl DimensionDiscretization {
    /// Validate and build a discretization
    pub fn new(dimension: PhaseSpaceDimension, boundaries: Vec<f64>) -> ConfigResult<Self> {
        if boundaries.len() < 2 {
            return Err(ConfigurationError::TooFewBoundaries {
                dimension,
                count: boundaries.len(),
            });
        }

        if let Some(index) = boundaries.iter().position(|b| !b.is_finite()) {
            return Err(ConfigurationError::NonFiniteBoundary { dimension, index });
        }

        if let Some(index) = boundaries.windows(2).position(|w| w[1] <= w[0]) {
            return Err(ConfigurationError::UnsortedBoundaries {
                dimension,
                index: index + 1,
                value: boundaries[index + 1],
            });
        }

        Ok(Self { dimension, boundaries })
    }

    pub fn dimension(&self) -> PhaseSpaceDimension {
        self.dimension
    }

    pub fn boundaries(&self) -> &[f64] {
        &self.boundaries
    }

    pub fn number_of_bins(&self) -> usize {
        self.boundaries.len() - 1
    }

    /// Lowest and highest boundary
    pub fn range(&self) -> (f64, f64) {
        (self.boundaries[0], self.boundaries[self.boundaries.len() - 1])
    }

    /// Is the value inside the discretized range?
    pub fn is_in_range(&self, value: f64) -> bool {
        let (min, max) = self.range();
        value >= min && value <= max
    }

    /// Zero-based bin containing `value` (binary search)
    pub fn bin_index(&self, value: f64) -> Result<usize, OutOfRange> {
        if !self.is_in_range(value) {
            let (min, max) = self.range();
            return Err(OutOfRange {
                dimension: self.dimension,
                value,
                min,
                max,
            });
        }

        // Number of boundaries <= value, at least 1 inside the range
        let upper = self.boundaries.partition_point(|&b| b <= value);

        Ok((upper - 1).min(self.number_of_bins() - 1))
    }

    /// Lower and upper boundary of a bin
    pub fn bin_bounds(&self, bin: usize) -> (f64, f64) {
        (self.boundaries[bin], self.boundaries[bin + 1])
    }

    /// Human-readable bin name, e.g. `Energy Bin: [0.1,1]`
    pub fn bin_name(&self, bin: usize) -> String {
        let (lower, upper) = self.bin_bounds(bin);
        let close = if bin + 1 == self.number_of_bins() { ']' } else { ')' };
        format!("{}: [{},{}{}", self.dimension.bin_label(), lower, upper, close)
    }
}

// ============================================================================
// ORDERED DIMENSIONS
// ============================================================================

/// Ordered set of active discretizations for one estimator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseSpaceDiscretization {
    dimensions: Vec<DimensionDiscretization>,
    composer: BinIndexComposer,
}

impl PhaseSpaceDiscretization {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a discretization
    ///
    /// A dimension that is already active keeps its position in the order
    /// and gets the new boundaries.
    pub fn assign(&mut self, discretization: DimensionDiscretization) {
        match self
            .dimensions
            .iter_mut()
            .find(|d| d.dimension() == discretization.dimension())
        {
            Some(existing) => *existing = discretization,
            None => self.dimensions.push(discretization),
        }

        self.composer =
            BinIndexComposer::new(self.dimensions.iter().map(|d| d.number_of_bins()).collect());
    }

    /// Is a dimension active?
    pub fn is_discretized(&self, dimension: PhaseSpaceDimension) -> bool {
        self.dimensions.iter().any(|d| d.dimension() == dimension)
    }

    /// Discretization of an active dimension
    pub fn get(&self, dimension: PhaseSpaceDimension) -> Option<&DimensionDiscretization> {
        self.dimensions.iter().find(|d| d.dimension() == dimension)
    }

    /// Active dimensions in radix order
    pub fn dimension_ordering(&self) -> Vec<PhaseSpaceDimension> {
        self.dimensions.iter().map(|d| d.dimension()).collect()
    }

    pub fn discretizations(&self) -> &[DimensionDiscretization] {
        &self.dimensions
    }

    /// Bin count of one dimension (1 when it is not active)
    pub fn number_of_bins_for(&self, dimension: PhaseSpaceDimension) -> usize {
        self.get(dimension).map_or(1, |d| d.number_of_bins())
    }

    /// Total bin count over all active dimensions
    pub fn number_of_bins(&self) -> usize {
        self.composer.total_bins()
    }

    /// Linear bin for an observation
    ///
    /// Fails if any active dimension is out of range or has no value for
    /// this event.
    pub fn calculate_bin_index(&self, point: &ObservationPoint<'_>) -> Result<usize, OutOfRange> {
        self.calculate_bin_index_with(|dimension| point.value(dimension))
    }

    /// Linear bin from an arbitrary per-dimension value source
    pub fn calculate_bin_index_with<F>(&self, value_of: F) -> Result<usize, OutOfRange>
    where
        F: Fn(PhaseSpaceDimension) -> Option<f64>,
    {
        let mut linear = 0;
        let mut stride = 1;

        for discretization in &self.dimensions {
            let dimension = discretization.dimension();
            let value = value_of(dimension).ok_or_else(|| {
                let (min, max) = discretization.range();
                OutOfRange { dimension, value: f64::NAN, min, max }
            })?;

            linear += stride * discretization.bin_index(value)?;
            stride *= discretization.number_of_bins();
        }

        debug_assert!(linear < self.number_of_bins());
        Ok(linear)
    }

    /// Per-dimension indices of a linear bin
    pub fn decompose(&self, linear: usize) -> Vec<usize> {
        self.composer.decompose(linear)
    }

    /// Name of a linear bin, e.g. `Energy Bin: [0,0.1), Cosine Bin: [-1,0)`
    pub fn bin_name(&self, linear: usize) -> String {
        if self.dimensions.is_empty() {
            return "Total Bin".to_string();
        }

        self.dimensions
            .iter()
            .zip(self.decompose(linear))
            .map(|(d, i)| d.bin_name(i))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
