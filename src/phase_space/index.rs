//! Mixed-radix composition of per-dimension bin indices.
//!
//! ```text
//! linear = i₀ + n₀·(i₁ + n₁·(i₂ + ...))
//! ```
//!
//! The radix order is the dimension order fixed at configuration time and is
//! shared by encode and decode.

/// Encodes per-dimension indices into one linear bin index and back
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinIndexComposer {
    radices: Vec<usize>,
}

impl BinIndexComposer {
    /// Radices are the bin counts of the active dimensions, in order
    pub fn new(radices: Vec<usize>) -> Self {
        debug_assert!(radices.iter().all(|&n| n > 0));
        Self { radices }
    }

    /// Number of active dimensions
    pub fn dimensions(&self) -> usize {
        self.radices.len()
    }

    /// Bin count of each dimension, in order
    pub fn radices(&self) -> &[usize] {
        &self.radices
    }

    /// Product of all radices; 1 when no dimension is active
    pub fn total_bins(&self) -> usize {
        self.radices.iter().product()
    }

    /// Linear index from one index per dimension
    pub fn compose(&self, indices: &[usize]) -> usize {
        debug_assert_eq!(indices.len(), self.radices.len());

        self.radices
            .iter()
            .zip(indices)
            .rev()
            .fold(0, |acc, (&n, &i)| {
                debug_assert!(i < n);
                i + n * acc
            })
    }

    /// Per-dimension indices from a linear index
    pub fn decompose(&self, mut linear: usize) -> Vec<usize> {
        debug_assert!(linear < self.total_bins());

        self.radices
            .iter()
            .map(|&n| {
                let i = linear % n;
                linear /= n;
                i
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_dimensions() {
        let composer = BinIndexComposer::default();
        assert_eq!(composer.total_bins(), 1);
        assert_eq!(composer.compose(&[]), 0);
        assert!(composer.decompose(0).is_empty());
    }

    #[test]
    fn test_compose_order() {
        // 2 energy bins, 3 cosine bins, 4 time bins
        let composer = BinIndexComposer::new(vec![2, 3, 4]);
        assert_eq!(composer.total_bins(), 24);

        assert_eq!(composer.compose(&[1, 0, 0]), 1);
        assert_eq!(composer.compose(&[0, 1, 0]), 2);
        assert_eq!(composer.compose(&[0, 0, 1]), 6);
        assert_eq!(composer.compose(&[1, 2, 3]), 1 + 2 * (2 + 3 * 3));
    }

    #[test]
    fn test_decompose_inverts_compose() {
        let composer = BinIndexComposer::new(vec![3, 1, 5, 2]);

        for linear in 0..composer.total_bins() {
            let indices = composer.decompose(linear);
            assert_eq!(composer.compose(&indices), linear);
        }
    }
}
