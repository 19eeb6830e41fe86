//! # Event Handler Module
//!
//! Run-wide coordination of every registered estimator.
//!
//! ## Lifecycle
//!
//! ```text
//! setup (single thread)   add estimators, register observers, enable threads
//! transport (N workers)   update_observers_from_*_event, commit per history
//! end of run              reduce_data across ranks, export_observer_data
//! ```
//!
//! Setup takes `&mut self`; everything a worker calls during transport takes
//! `&self`, so one handler can be shared across a rayon pool.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::comm::Communicator;
use crate::config::TallyConfig;
use crate::dispatch::{EventKind, ObserverRegistry};
use crate::error::{ConfigResult, ConfigurationError, EstimatorError, ExportError, ReduceError};
use crate::estimator::Estimator;
use crate::export::ObserverDataSink;
use crate::particle::ParticleState;
use crate::types::{EntityId, EstimatorId, Vec3, WorkerId};

// ============================================================================
// RUN CONTEXT
// ============================================================================

/// History count and timing of a run, fixed before export
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// Histories in this batch
    pub histories: u64,
    /// Committed histories the moments were accumulated over (N)
    pub total_histories: u64,
    /// Wall-clock start (s)
    pub start_time: f64,
    /// Wall-clock end (s)
    pub end_time: f64,
}

impl RunContext {
    pub fn new(total_histories: u64, start_time: f64, end_time: f64) -> Self {
        Self {
            histories: total_histories,
            total_histories,
            start_time,
            end_time,
        }
    }

    /// Context of a batch that is part of a longer run
    pub fn batch(histories: u64, total_histories: u64, start_time: f64, end_time: f64) -> Self {
        Self {
            histories,
            total_histories,
            start_time,
            end_time,
        }
    }

    /// Run time used for the figure of merit (s)
    pub fn elapsed(&self) -> f64 {
        (self.end_time - self.start_time).max(0.0)
    }
}

// ============================================================================
// EVENT HANDLER
// ============================================================================

/// Owner of all estimators and the observer registry
#[derive(Debug)]
pub struct EventHandler {
    estimators: BTreeMap<EstimatorId, Estimator>,
    registry: ObserverRegistry,
    workers: usize,
    committed_histories: AtomicU64,
}

impl Default for EventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler {
    pub fn new() -> Self {
        Self {
            estimators: BTreeMap::new(),
            registry: ObserverRegistry::new(),
            workers: crate::constants::DEFAULT_WORKERS,
            committed_histories: AtomicU64::new(0),
        }
    }

    /// Build every estimator and registration described by a configuration
    pub fn from_config(config: &TallyConfig) -> ConfigResult<Self> {
        let mut handler = Self::new();
        handler.enable_thread_support(config.workers)?;

        for estimator_config in &config.estimators {
            handler.register(estimator_config.build()?)?;
        }

        info!(
            estimators = handler.number_of_estimators(),
            workers = handler.workers,
            "Event handler configured"
        );
        Ok(handler)
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Take ownership of an estimator without registering observers
    pub fn add_estimator(&mut self, mut estimator: Estimator) -> ConfigResult<()> {
        let id = estimator.id();
        if self.estimators.contains_key(&id) {
            return Err(ConfigurationError::DuplicateEstimatorId(id));
        }

        estimator.enable_thread_support(self.workers)?;
        debug!(estimator = id, kind = estimator.kind().name(), "Estimator added");
        self.estimators.insert(id, estimator);
        Ok(())
    }

    /// Add an estimator and observe every event of its kind on all its entities
    pub fn register(&mut self, estimator: Estimator) -> ConfigResult<()> {
        let id = estimator.id();
        let global = estimator.kind().observes(EventKind::ParticleSubtrackEndingGlobal);
        let entities = estimator.entities().to_vec();

        self.add_estimator(estimator)?;
        if global {
            self.add_global_event_observer(id)
        } else {
            self.add_entity_event_observer(id, &entities)
        }
    }

    /// Observe the entity events of the estimator's kind on some entities
    pub fn add_entity_event_observer(
        &mut self,
        id: EstimatorId,
        entities: &[EntityId],
    ) -> ConfigResult<()> {
        let estimator = self
            .estimators
            .get(&id)
            .ok_or(ConfigurationError::UnknownEstimator(id))?;

        if let Some(&entity) = entities.iter().find(|e| !estimator.has_entity(**e)) {
            return Err(ConfigurationError::EntityNotAssigned { estimator: id, entity });
        }

        let events: Vec<EventKind> = estimator
            .kind()
            .observed_events()
            .iter()
            .copied()
            .filter(|e| !e.is_global())
            .collect();
        if events.is_empty() {
            return Err(ConfigurationError::IncompatibleEvent {
                estimator: id,
                kind: estimator.kind().name(),
                event: "entity",
            });
        }

        for event in events {
            self.registry.add_observer(event, entities, id);
        }
        Ok(())
    }

    /// Observe the entity-less subtrack-ending event
    pub fn add_global_event_observer(&mut self, id: EstimatorId) -> ConfigResult<()> {
        let estimator = self
            .estimators
            .get(&id)
            .ok_or(ConfigurationError::UnknownEstimator(id))?;

        let event = EventKind::ParticleSubtrackEndingGlobal;
        if !estimator.kind().observes(event) {
            return Err(ConfigurationError::IncompatibleEvent {
                estimator: id,
                kind: estimator.kind().name(),
                event: event.name(),
            });
        }

        self.registry.add_global_observer(id);
        Ok(())
    }

    /// Remove an estimator and all of its registrations
    pub fn remove_estimator(&mut self, id: EstimatorId) -> Option<Estimator> {
        self.registry.remove_observer(id);
        self.estimators.remove(&id)
    }

    /// Allocate `workers` replicas on every estimator
    pub fn enable_thread_support(&mut self, workers: usize) -> ConfigResult<()> {
        if workers == 0 {
            return Err(ConfigurationError::NoWorkers);
        }

        for estimator in self.estimators.values_mut() {
            estimator.enable_thread_support(workers)?;
        }
        self.workers = workers;
        info!(workers, "Thread support enabled");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn estimator(&self, id: EstimatorId) -> Option<&Estimator> {
        self.estimators.get(&id)
    }

    /// Mutable access for setup (particle types, bins)
    pub fn estimator_mut(&mut self, id: EstimatorId) -> Option<&mut Estimator> {
        self.estimators.get_mut(&id)
    }

    pub fn estimators(&self) -> impl Iterator<Item = &Estimator> {
        self.estimators.values()
    }

    pub fn number_of_estimators(&self) -> usize {
        self.estimators.len()
    }

    pub fn registry(&self) -> &ObserverRegistry {
        &self.registry
    }

    pub fn does_observer_exist(&self, id: EstimatorId) -> bool {
        self.registry.does_observer_exist(id)
    }

    pub fn observer_count_for(&self, event: EventKind, entity: EntityId) -> usize {
        self.registry.observer_count_for(event, entity)
    }

    /// Histories committed on this rank since the last reset
    pub fn committed_histories(&self) -> u64 {
        self.committed_histories.load(Ordering::Relaxed)
    }

    /// Context over the committed histories
    pub fn run_context(&self, start_time: f64, end_time: f64) -> RunContext {
        RunContext::new(self.committed_histories(), start_time, end_time)
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    fn entity_observers(
        &self,
        event: EventKind,
        entity: EntityId,
    ) -> impl Iterator<Item = &Estimator> {
        self.registry
            .observers_for(event, entity)
            .iter()
            .filter_map(|id| self.estimators.get(id))
    }

    pub fn update_observers_from_particle_entering_cell_event(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        cell: EntityId,
    ) -> Result<(), EstimatorError> {
        for estimator in self.entity_observers(EventKind::ParticleEnteringCell, cell) {
            estimator.update_from_particle_entering_cell(worker, particle, cell)?;
        }
        Ok(())
    }

    pub fn update_observers_from_particle_leaving_cell_event(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        cell: EntityId,
    ) -> Result<(), EstimatorError> {
        for estimator in self.entity_observers(EventKind::ParticleLeavingCell, cell) {
            estimator.update_from_particle_leaving_cell(worker, particle, cell)?;
        }
        Ok(())
    }

    /// Collision in the particle's current cell
    pub fn update_observers_from_particle_colliding_in_cell_event(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        inverse_total_cross_section: f64,
    ) -> Result<(), EstimatorError> {
        for estimator in self.entity_observers(EventKind::ParticleCollidingInCell, particle.cell) {
            estimator.update_from_particle_colliding_in_cell(
                worker,
                particle,
                inverse_total_cross_section,
            )?;
        }
        Ok(())
    }

    pub fn update_observers_from_particle_subtrack_ending_in_cell_event(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        cell: EntityId,
        track_length: f64,
        start_angle_cosine: f64,
    ) -> Result<(), EstimatorError> {
        for estimator in self.entity_observers(EventKind::ParticleSubtrackEndingInCell, cell) {
            estimator.update_from_particle_subtrack_ending_in_cell(
                worker,
                particle,
                cell,
                track_length,
                start_angle_cosine,
            )?;
        }
        Ok(())
    }

    /// Surface crossing; the angle cosine is taken against `surface_normal`
    pub fn update_observers_from_particle_crossing_surface_event(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        surface: EntityId,
        surface_normal: &Vec3,
    ) -> Result<(), EstimatorError> {
        let observers = self.registry.observers_for(EventKind::ParticleCrossingSurface, surface);
        if observers.is_empty() {
            return Ok(());
        }

        let angle_cosine = particle.direction.dot(&surface_normal.normalize());
        for estimator in observers.iter().filter_map(|id| self.estimators.get(id)) {
            estimator
                .update_from_particle_crossing_surface(worker, particle, surface, angle_cosine)?;
        }
        Ok(())
    }

    pub fn update_observers_from_particle_subtrack_ending_global_event(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        start: &Vec3,
        end: &Vec3,
    ) -> Result<(), EstimatorError> {
        for id in self.registry.global_observers() {
            if let Some(estimator) = self.estimators.get(id) {
                estimator
                    .update_from_particle_subtrack_ending_global(worker, particle, start, end)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // History boundary
    // ------------------------------------------------------------------------

    /// Commit the worker's history on every estimator and count it
    pub fn commit_observer_history_contributions(
        &self,
        worker: WorkerId,
    ) -> Result<(), EstimatorError> {
        for estimator in self.estimators.values() {
            estimator.commit_history_contribution(worker)?;
        }
        self.committed_histories.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Does any estimator hold uncommitted data for the worker?
    pub fn has_uncommitted_history_contribution(
        &self,
        worker: WorkerId,
    ) -> Result<bool, EstimatorError> {
        for estimator in self.estimators.values() {
            if estimator.has_uncommitted_history_contribution(worker)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Zero every estimator and the history counter
    pub fn reset_observer_data(&self) {
        for estimator in self.estimators.values() {
            estimator.reset_data();
        }
        self.committed_histories.store(0, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Reduction
    // ------------------------------------------------------------------------

    /// Sum every rank's moments and history count into `target`
    ///
    /// Collective: all ranks must call it. Non-target ranks are reset
    /// afterwards. Ranks with different estimators, table sizes, bin
    /// boundaries or response functions fail with [`ReduceError::Mismatch`]
    /// and keep their data.
    pub fn reduce_data(&self, comm: &dyn Communicator, target: usize) -> Result<(), ReduceError> {
        if target >= comm.size() {
            return Err(ReduceError::InvalidTarget { target, size: comm.size() });
        }

        let layout: Vec<u64> = self
            .estimators
            .iter()
            .flat_map(|(id, e)| {
                [u64::from(*id), e.moment_table_len() as u64, e.layout_fingerprint()]
            })
            .collect();
        let layouts = comm.all_gather_layout(layout)?;
        if layouts.len() != comm.size() {
            return Err(ReduceError::Communicator(format!(
                "received {} layouts from {} ranks",
                layouts.len(),
                comm.size()
            )));
        }
        if let Some(rank) = layouts.iter().position(|l| *l != layouts[target]) {
            return Err(ReduceError::Mismatch { rank, target });
        }

        let mut moments = vec![self.committed_histories() as f64];
        for estimator in self.estimators.values() {
            moments.extend(estimator.moments_flat());
        }
        let len = moments.len();

        match comm.gather_moments(moments, target)? {
            Some(all) => {
                let mut sum = vec![0.0; len];
                for (rank, data) in all.iter().enumerate() {
                    if data.len() != len {
                        return Err(ReduceError::Mismatch { rank, target });
                    }
                    for (s, v) in sum.iter_mut().zip(data) {
                        *s += v;
                    }
                }

                self.committed_histories.store(sum[0] as u64, Ordering::Relaxed);
                let mut offset = 1;
                for estimator in self.estimators.values() {
                    let n = estimator.moment_table_len();
                    estimator.store_reduced_moments(&sum[offset..offset + n]);
                    offset += n;
                }

                info!(
                    ranks = all.len(),
                    histories = self.committed_histories(),
                    "Estimator data reduced"
                );
            }
            None => self.reset_observer_data(),
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Export
    // ------------------------------------------------------------------------

    /// Hand every estimator's data to a sink
    pub fn export_observer_data(
        &self,
        sink: &mut dyn ObserverDataSink,
        context: &RunContext,
        process: bool,
    ) -> Result<(), ExportError> {
        if context.total_histories != self.committed_histories() {
            warn!(
                context = context.total_histories,
                committed = self.committed_histories(),
                "Exporting with a history count that differs from the committed count"
            );
        }

        sink.write_run_context(context)?;
        for estimator in self.estimators.values() {
            estimator.export(sink, context, process)?;
        }

        info!(
            estimators = self.estimators.len(),
            histories = context.total_histories,
            processed = process,
            "Estimator data exported"
        );
        Ok(())
    }

    /// Human-readable summary of all estimators
    pub fn summary(&self, context: &RunContext) -> String {
        let mut s = String::new();
        s.push_str("=== Event Handler Summary ===\n");
        s.push_str(&format!("Estimators: {}\n", self.estimators.len()));
        s.push_str(&format!("Workers: {}\n", self.workers));
        s.push_str(&format!("Histories: {}\n", context.total_histories));
        s.push_str(&format!("Run time: {:.3} s\n", context.elapsed()));

        s.push_str("\n--- Estimators ---\n");
        for estimator in self.estimators.values() {
            s.push_str(&format!(
                "[{}] {} ({} entities, {} bins, dropped {})\n",
                estimator.id(),
                estimator.kind().name(),
                estimator.entities().len(),
                estimator.number_of_bins(),
                estimator.dropped_contributions()
            ));
            for &entity in estimator.entities() {
                let totals = estimator.processed_entity_total(entity, context).unwrap_or_default();
                for (response, total) in totals.iter().enumerate() {
                    s.push_str(&format!(
                        "  entity {} [{}]: {:.4e} ± {:.2}%\n",
                        entity,
                        estimator.response_function_name(response).unwrap_or_default(),
                        total.mean,
                        total.relative_error * 100.0
                    ));
                }
            }
        }

        s
    }
}
