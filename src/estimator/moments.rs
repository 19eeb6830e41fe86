//! Two-moment score accumulation with per-worker history replicas.
//!
//! ## Theory
//!
//! For N histories with per-history totals x_h in a bin:
//!
//! ```text
//! S1 = Σ x_h          S2 = Σ x_h²
//! x̄  = S1 / N
//! σ²(x̄) = (S2/N − x̄²) / (N − 1)
//! RE = σ(x̄) / x̄       FOM = 1 / (RE² · T)
//! ```
//!
//! Scores from one history are summed in the worker's private replica and
//! only the history total reaches S2. Folding each partial score into S2
//! separately would overestimate the variance.
//!
//! Each entity's bin axis holds one block of phase-space bins per response
//! function. Entity totals are kept per response; total bins are kept per
//! scored bin.
//!
//! ## References
//! - X-5 Monte Carlo Team, "MCNP - A General Monte Carlo N-Particle
//!   Transport Code", Vol. I, Ch. 2 (tally statistics)

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::EstimatorError;
use crate::types::WorkerId;

/// Lock a mutex, recovering the data if another worker panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// MOMENTS
// ============================================================================

/// Running sums of history totals and their squares
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MomentPair {
    /// S1 = Σ x
    pub first: f64,
    /// S2 = Σ x²
    pub second: f64,
}

impl MomentPair {
    pub const ZERO: MomentPair = MomentPair { first: 0.0, second: 0.0 };

    pub const fn new(first: f64, second: f64) -> Self {
        Self { first, second }
    }

    /// Fold one history total
    #[inline]
    pub fn add_history(&mut self, total: f64) {
        self.first += total;
        self.second += total * total;
    }

    /// Element-wise sum with another pair
    #[inline]
    pub fn merge(&mut self, other: &MomentPair) {
        self.first += other.first;
        self.second += other.second;
    }

    pub fn is_zero(&self) -> bool {
        self.first == 0.0 && self.second == 0.0
    }

    /// Mean, relative error and figure of merit
    ///
    /// `scale` is multiplier / norm constant, `time` the wall time of the
    /// run in seconds.
    pub fn process(&self, histories: u64, scale: f64, time: f64) -> ProcessedMoments {
        if histories == 0 {
            return ProcessedMoments::default();
        }

        let n = histories as f64;
        let mean = self.first / n;

        let relative_error = if histories < 2 || mean == 0.0 {
            0.0
        } else {
            // Rounding can push a zero-spread variance slightly negative
            let variance = ((self.second / n - mean * mean) / (n - 1.0)).max(0.0);
            variance.sqrt() / mean.abs()
        };

        let figure_of_merit = if relative_error > 0.0 && time > 0.0 {
            1.0 / (relative_error * relative_error * time)
        } else {
            0.0
        };

        ProcessedMoments {
            mean: mean * scale,
            relative_error,
            figure_of_merit,
        }
    }
}

/// Normalized estimate of one bin
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessedMoments {
    /// Mean per history × multiplier / norm constant
    pub mean: f64,
    pub relative_error: f64,
    pub figure_of_merit: f64,
}

// ============================================================================
// SHARED MOMENT TABLE
// ============================================================================

/// Rank-local moments merged over all workers
///
/// Bin moments are entity-major: `entity * bins + bin`, where
/// `bins = phase_bins * responses` and `bin = response * phase_bins + phase_bin`.
#[derive(Debug, Clone, PartialEq)]
pub struct MomentTable {
    entities: usize,
    phase_bins: usize,
    responses: usize,
    bins: usize,
    bin_moments: Vec<MomentPair>,
    entity_totals: Vec<MomentPair>,
    total_bins: Vec<MomentPair>,
}

impl MomentTable {
    pub fn new(entities: usize, phase_bins: usize, responses: usize) -> Self {
        let bins = phase_bins * responses;
        Self {
            entities,
            phase_bins,
            responses,
            bins,
            bin_moments: vec![MomentPair::ZERO; entities * bins],
            entity_totals: vec![MomentPair::ZERO; entities * responses],
            total_bins: vec![MomentPair::ZERO; bins],
        }
    }

    pub fn entities(&self) -> usize {
        self.entities
    }

    /// Scored bins per entity (phase-space bins × responses)
    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn responses(&self) -> usize {
        self.responses
    }

    /// Bin moments of one entity
    pub fn entity_bins(&self, entity: usize) -> &[MomentPair] {
        &self.bin_moments[entity * self.bins..(entity + 1) * self.bins]
    }

    /// Moments of the per-history sum over the phase-space bins of one
    /// entity, one pair per response
    pub fn entity_totals(&self, entity: usize) -> &[MomentPair] {
        &self.entity_totals[entity * self.responses..(entity + 1) * self.responses]
    }

    pub fn entity_total(&self, entity: usize, response: usize) -> MomentPair {
        self.entity_totals[entity * self.responses + response]
    }

    /// Moments of the per-history sum over all entities, per bin
    pub fn total_bins(&self) -> &[MomentPair] {
        &self.total_bins
    }

    /// Number of f64 values in the flattened form
    pub fn flat_len(&self) -> usize {
        2 * (self.bin_moments.len() + self.entity_totals.len() + self.total_bins.len())
    }

    /// Flatten as `[S1, S2, S1, S2, ...]` (bins, entity totals, total bins)
    pub fn to_flat(&self) -> Vec<f64> {
        self.pairs()
            .flat_map(|m| [m.first, m.second])
            .collect()
    }

    /// Add a flattened table produced by [`MomentTable::to_flat`]
    pub fn merge_flat(&mut self, flat: &[f64]) {
        debug_assert_eq!(flat.len(), self.flat_len());

        for (pair, chunk) in self.pairs_mut().zip(flat.chunks_exact(2)) {
            pair.merge(&MomentPair::new(chunk[0], chunk[1]));
        }
    }

    /// Zero every moment
    pub fn reset(&mut self) {
        for pair in self.pairs_mut() {
            *pair = MomentPair::ZERO;
        }
    }

    pub fn is_zero(&self) -> bool {
        self.pairs().all(|m| m.is_zero())
    }

    fn pairs(&self) -> impl Iterator<Item = &MomentPair> {
        self.bin_moments
            .iter()
            .chain(&self.entity_totals)
            .chain(&self.total_bins)
    }

    fn pairs_mut(&mut self) -> impl Iterator<Item = &mut MomentPair> {
        self.bin_moments
            .iter_mut()
            .chain(self.entity_totals.iter_mut())
            .chain(self.total_bins.iter_mut())
    }
}

// ============================================================================
// WORKER REPLICA
// ============================================================================

/// Private per-history state of one worker
///
/// Only the owning worker locks its replica, so the lock is never contended.
#[derive(Debug, Clone)]
struct WorkerReplica {
    /// Running per-history totals, same layout as the bin moments
    totals: Vec<f64>,
    /// Indices written this history
    touched: Vec<usize>,
    /// Membership flags of `touched`
    is_touched: Vec<bool>,
    /// Pending energy deposition per entity (pulse height)
    deposition: Vec<f64>,
    /// Entities with a deposition entry this history (may repeat)
    visited: Vec<usize>,
    /// Per-history scratch sums
    entity_sums: Vec<f64>,
    bin_sums: Vec<f64>,
    uncommitted: bool,
}

impl WorkerReplica {
    fn new(entities: usize, bins: usize, responses: usize) -> Self {
        Self {
            totals: vec![0.0; entities * bins],
            touched: Vec::new(),
            is_touched: vec![false; entities * bins],
            deposition: vec![0.0; entities],
            visited: Vec::new(),
            entity_sums: vec![0.0; entities * responses],
            bin_sums: vec![0.0; bins],
            uncommitted: false,
        }
    }

    /// Add to a running total, recording the index once per history
    fn add(&mut self, index: usize, score: f64) {
        if !self.is_touched[index] {
            self.is_touched[index] = true;
            self.touched.push(index);
        }
        self.totals[index] += score;
    }

    fn clear(&mut self) {
        for &i in &self.touched {
            self.totals[i] = 0.0;
            self.is_touched[i] = false;
        }
        for &e in &self.visited {
            self.deposition[e] = 0.0;
        }
        self.touched.clear();
        self.visited.clear();
        self.uncommitted = false;
    }
}

// ============================================================================
// SCORE ACCUMULATOR
// ============================================================================

/// Per-entity, per-bin, per-worker accumulator
///
/// States per worker: idle (nothing uncommitted) and accumulating.
/// [`ScoreAccumulator::commit_history`] is the only path into the shared
/// table and serializes on its mutex.
#[derive(Debug)]
pub struct ScoreAccumulator {
    entities: usize,
    phase_bins: usize,
    responses: usize,
    bins: usize,
    replicas: Vec<Mutex<WorkerReplica>>,
    table: Mutex<MomentTable>,
}

impl ScoreAccumulator {
    pub fn new(entities: usize, phase_bins: usize, responses: usize, workers: usize) -> Self {
        let mut accumulator = Self {
            entities,
            phase_bins,
            responses,
            bins: phase_bins * responses,
            replicas: Vec::new(),
            table: Mutex::new(MomentTable::new(entities, phase_bins, responses)),
        };
        accumulator.replicas = accumulator.make_replicas(workers);
        accumulator
    }

    fn make_replicas(&self, workers: usize) -> Vec<Mutex<WorkerReplica>> {
        (0..workers)
            .map(|_| Mutex::new(WorkerReplica::new(self.entities, self.bins, self.responses)))
            .collect()
    }

    pub fn entities(&self) -> usize {
        self.entities
    }

    /// Scored bins per entity
    pub fn bins(&self) -> usize {
        self.bins
    }

    pub fn responses(&self) -> usize {
        self.responses
    }

    pub fn workers(&self) -> usize {
        self.replicas.len()
    }

    /// Reallocate the worker replicas
    ///
    /// Uncommitted contributions are discarded; the shared table is kept.
    /// Returns the number of replicas that still had uncommitted data.
    pub fn set_workers(&mut self, workers: usize) -> usize {
        let lost = self
            .replicas
            .iter()
            .filter(|&r| lock(r).uncommitted)
            .count();
        self.replicas = self.make_replicas(workers);
        lost
    }

    fn replica(&self, worker: WorkerId) -> Result<MutexGuard<'_, WorkerReplica>, EstimatorError> {
        self.replicas
            .get(worker)
            .map(lock)
            .ok_or(EstimatorError::WorkerOutOfRange {
                worker,
                workers: self.replicas.len(),
            })
    }

    /// Add a partial score to the worker's running total
    pub fn add_partial(
        &self,
        worker: WorkerId,
        entity: usize,
        bin: usize,
        score: f64,
    ) -> Result<(), EstimatorError> {
        debug_assert!(entity < self.entities && bin < self.bins);

        let mut replica = self.replica(worker)?;
        replica.add(entity * self.bins + bin, score);
        replica.uncommitted = true;
        Ok(())
    }

    /// Add to the worker's pending energy deposition in an entity
    pub fn add_deposition(
        &self,
        worker: WorkerId,
        entity: usize,
        energy: f64,
    ) -> Result<(), EstimatorError> {
        debug_assert!(entity < self.entities);

        let mut replica = self.replica(worker)?;
        if replica.deposition[entity] == 0.0 {
            replica.visited.push(entity);
        }
        replica.deposition[entity] += energy;
        replica.uncommitted = true;
        Ok(())
    }

    pub fn has_uncommitted(&self, worker: WorkerId) -> Result<bool, EstimatorError> {
        Ok(self.replica(worker)?.uncommitted)
    }

    /// Fold the worker's history into the shared moments
    ///
    /// `settle` turns each pending deposition into a (bin, score) partial
    /// before folding, or drops it by returning None. Idle workers commit
    /// nothing.
    pub fn commit_history<F>(&self, worker: WorkerId, mut settle: F) -> Result<(), EstimatorError>
    where
        F: FnMut(f64) -> Option<(usize, f64)>,
    {
        let mut guard = self.replica(worker)?;
        if !guard.uncommitted {
            return Ok(());
        }
        let replica = &mut *guard;

        let mut visited = std::mem::take(&mut replica.visited);
        visited.sort_unstable();
        visited.dedup();
        for &entity in &visited {
            let deposit = std::mem::replace(&mut replica.deposition[entity], 0.0);
            if let Some((bin, score)) = settle(deposit) {
                replica.add(entity * self.bins + bin, score);
            }
        }

        let touched = std::mem::take(&mut replica.touched);

        {
            let mut table = lock(&self.table);
            for &index in &touched {
                let total = replica.totals[index];
                if total == 0.0 {
                    continue;
                }
                let (entity_total, bin) = self.split(index);
                table.bin_moments[index].add_history(total);
                replica.entity_sums[entity_total] += total;
                replica.bin_sums[bin] += total;
            }

            for &index in &touched {
                let (entity_total, bin) = self.split(index);
                let entity_sum = std::mem::replace(&mut replica.entity_sums[entity_total], 0.0);
                if entity_sum != 0.0 {
                    table.entity_totals[entity_total].add_history(entity_sum);
                }
                let bin_sum = std::mem::replace(&mut replica.bin_sums[bin], 0.0);
                if bin_sum != 0.0 {
                    table.total_bins[bin].add_history(bin_sum);
                }
            }
        }

        replica.touched = touched;
        replica.clear();
        Ok(())
    }

    /// Entity-total slot and scored bin of a flat replica index
    #[inline]
    fn split(&self, index: usize) -> (usize, usize) {
        let (entity, bin) = (index / self.bins, index % self.bins);
        (entity * self.responses + bin / self.phase_bins, bin)
    }

    /// Zero the shared table and every replica
    pub fn reset(&self) {
        for replica in &self.replicas {
            lock(replica).clear();
        }
        lock(&self.table).reset();
    }

    /// Snapshot of the shared table
    pub fn table(&self) -> MomentTable {
        lock(&self.table).clone()
    }

    /// Run a closure against the shared table
    pub fn with_table<R>(&self, f: impl FnOnce(&mut MomentTable) -> R) -> R {
        f(&mut lock(&self.table))
    }
}
