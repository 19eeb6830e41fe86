//! # Communicator Module
//!
//! Collective operations between distributed ranks used by the reduction of
//! estimator moments.
//!
//! ## Protocol
//!
//! ```text
//! all ranks : all_gather_layout(estimator ids + table sizes)   -> mismatch check
//! all ranks : gather_moments(flattened tables, target)
//! target    : element-wise sum, store
//! others    : reset
//! ```
//!
//! [`SerialCommunicator`] is the single-process case. [`LocalCommunicator`]
//! connects several in-process ranks (one thread each) through shared slots
//! and a barrier.

use std::sync::{Arc, Barrier, Mutex};

use crate::error::ReduceError;
use crate::estimator::moments::lock;

/// Collective operations needed by the reduction
///
/// Every rank of the group must call each operation in the same order.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Every rank receives every rank's layout, indexed by rank
    fn all_gather_layout(&self, layout: Vec<u64>) -> Result<Vec<Vec<u64>>, ReduceError>;

    /// The target receives every rank's data indexed by rank; others get None
    fn gather_moments(
        &self,
        moments: Vec<f64>,
        target: usize,
    ) -> Result<Option<Vec<Vec<f64>>>, ReduceError>;

    fn barrier(&self);

    fn is_root(&self) -> bool {
        self.rank() == crate::constants::ROOT_RANK
    }
}

// ============================================================================
// SERIAL
// ============================================================================

/// Communicator of a single rank
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn all_gather_layout(&self, layout: Vec<u64>) -> Result<Vec<Vec<u64>>, ReduceError> {
        Ok(vec![layout])
    }

    fn gather_moments(
        &self,
        moments: Vec<f64>,
        target: usize,
    ) -> Result<Option<Vec<Vec<f64>>>, ReduceError> {
        if target != 0 {
            return Err(ReduceError::InvalidTarget { target, size: 1 });
        }
        Ok(Some(vec![moments]))
    }

    fn barrier(&self) {}
}

// ============================================================================
// IN-PROCESS GROUP
// ============================================================================

#[derive(Debug)]
struct SharedSlots {
    layouts: Mutex<Vec<Option<Vec<u64>>>>,
    moments: Mutex<Vec<Option<Vec<f64>>>>,
    barrier: Barrier,
}

/// One rank of an in-process group
#[derive(Debug, Clone)]
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    shared: Arc<SharedSlots>,
}

impl LocalCommunicator {
    /// Build `size` connected ranks, one per thread
    pub fn group(size: usize) -> Vec<LocalCommunicator> {
        let shared = Arc::new(SharedSlots {
            layouts: Mutex::new(vec![None; size]),
            moments: Mutex::new(vec![None; size]),
            barrier: Barrier::new(size),
        });

        (0..size)
            .map(|rank| LocalCommunicator {
                rank,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    /// Publish into the own slot, optionally collect all slots
    fn exchange<T: Clone>(
        &self,
        slots: &Mutex<Vec<Option<T>>>,
        data: T,
        receive: bool,
    ) -> Result<Option<Vec<T>>, ReduceError> {
        lock(slots)[self.rank] = Some(data);
        self.shared.barrier.wait();

        let collected = if receive {
            let all: Vec<T> = lock(slots).iter().flatten().cloned().collect();
            Some(all)
        } else {
            None
        };

        // Nobody may clear a slot before every reader is done
        self.shared.barrier.wait();
        lock(slots)[self.rank] = None;

        match collected {
            Some(all) if all.len() != self.size => Err(ReduceError::Communicator(format!(
                "rank {} received {} of {} contributions",
                self.rank,
                all.len(),
                self.size
            ))),
            other => Ok(other),
        }
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn all_gather_layout(&self, layout: Vec<u64>) -> Result<Vec<Vec<u64>>, ReduceError> {
        let all = self.exchange(&self.shared.layouts, layout, true)?;
        Ok(all.unwrap_or_default())
    }

    fn gather_moments(
        &self,
        moments: Vec<f64>,
        target: usize,
    ) -> Result<Option<Vec<Vec<f64>>>, ReduceError> {
        if target >= self.size {
            return Err(ReduceError::InvalidTarget { target, size: self.size });
        }
        self.exchange(&self.shared.moments, moments, self.rank == target)
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }
}
