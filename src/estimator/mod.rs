//! # Estimator Module
//!
//! Event-driven tallies: each estimator owns a set of entities, an ordered
//! phase-space discretization and a [`ScoreAccumulator`].
//!
//! ## Estimator kinds
//!
//! | Kind | Event | Raw score |
//! |------|-------|-----------|
//! | Cell track-length flux | subtrack ending in cell | w·ℓ |
//! | Cell collision flux | colliding in cell | w/Σt |
//! | Cell pulse height | entering / leaving cell | binned deposition Σw·E_in − Σw·E_out |
//! | Surface flux | crossing surface | w/\|μ\| |
//! | Surface current | crossing surface | w |
//! | Mesh track-length flux | subtrack ending (global) | w·ℓ per element |
//!
//! With the weight-and-energy multiplier every w above becomes w·E, and
//! every score is further multiplied by each attached [`ParticleResponse`]
//! (one copy of the phase-space bins per response).
//!
//! ## References
//! - X-5 Monte Carlo Team, "MCNP - A General Monte Carlo N-Particle
//!   Transport Code", Vol. I, Ch. 2 (tally types F1, F2, F4, F8)

pub mod moments;
pub mod response;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::*;
use crate::dispatch::EventKind;
use crate::error::{ConfigResult, ConfigurationError, EstimatorError, ExportError};
use crate::export::{ExportField, ExportValue, ObserverDataSink};
use crate::handler::RunContext;
use crate::mesh::StructuredHexMesh;
use crate::particle::ParticleState;
use crate::phase_space::{
    DimensionDiscretization, ObservationPoint, PhaseSpaceDimension, PhaseSpaceDiscretization,
};
use crate::types::{EntityId, EstimatorId, ParticleType, ParticleTypeSet, Vec3, WorkerId};

pub use moments::{MomentPair, MomentTable, ProcessedMoments, ScoreAccumulator};
pub use response::ParticleResponse;

// ============================================================================
// CONTRIBUTION MULTIPLIER
// ============================================================================

/// Particle factor applied to every raw score
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionMultiplier {
    /// w
    #[default]
    Weight,
    /// w·E
    WeightAndEnergy,
}

impl ContributionMultiplier {
    #[inline]
    pub fn factor(&self, particle: &ParticleState) -> f64 {
        match self {
            ContributionMultiplier::Weight => particle.weight,
            ContributionMultiplier::WeightAndEnergy => particle.weight * particle.energy,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ContributionMultiplier::Weight => "weight",
            ContributionMultiplier::WeightAndEnergy => "weight and energy",
        }
    }
}

// ============================================================================
// ESTIMATOR KINDS
// ============================================================================

/// What an estimator measures
#[derive(Debug, Clone, PartialEq)]
pub enum EstimatorKind {
    CellTrackLengthFlux,
    CellCollisionFlux,
    CellPulseHeight,
    SurfaceFlux { cosine_cutoff: f64 },
    SurfaceCurrent,
    MeshTrackLengthFlux { mesh: StructuredHexMesh },
}

impl EstimatorKind {
    /// Surface flux with the default grazing-angle cutoff
    pub fn surface_flux() -> Self {
        EstimatorKind::SurfaceFlux {
            cosine_cutoff: DEFAULT_COSINE_CUTOFF,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            EstimatorKind::CellTrackLengthFlux => "cell track-length flux",
            EstimatorKind::CellCollisionFlux => "cell collision flux",
            EstimatorKind::CellPulseHeight => "cell pulse height",
            EstimatorKind::SurfaceFlux { .. } => "surface flux",
            EstimatorKind::SurfaceCurrent => "surface current",
            EstimatorKind::MeshTrackLengthFlux { .. } => "mesh track-length flux",
        }
    }

    /// Events this kind scores on
    pub fn observed_events(&self) -> &'static [EventKind] {
        match self {
            EstimatorKind::CellTrackLengthFlux => &[EventKind::ParticleSubtrackEndingInCell],
            EstimatorKind::CellCollisionFlux => &[EventKind::ParticleCollidingInCell],
            EstimatorKind::CellPulseHeight => {
                &[EventKind::ParticleEnteringCell, EventKind::ParticleLeavingCell]
            }
            EstimatorKind::SurfaceFlux { .. } | EstimatorKind::SurfaceCurrent => {
                &[EventKind::ParticleCrossingSurface]
            }
            EstimatorKind::MeshTrackLengthFlux { .. } => &[EventKind::ParticleSubtrackEndingGlobal],
        }
    }

    pub fn observes(&self, event: EventKind) -> bool {
        self.observed_events().contains(&event)
    }

    /// Can this kind be binned on a dimension?
    pub fn supports_dimension(&self, dimension: PhaseSpaceDimension) -> bool {
        match self {
            // Binned on the deposited energy only
            EstimatorKind::CellPulseHeight => dimension == PhaseSpaceDimension::Energy,
            EstimatorKind::CellCollisionFlux | EstimatorKind::MeshTrackLengthFlux { .. } => {
                dimension != PhaseSpaceDimension::Cosine
            }
            _ => true,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        if let EstimatorKind::SurfaceFlux { cosine_cutoff } = *self {
            if !(cosine_cutoff > 0.0 && cosine_cutoff <= 1.0) {
                return Err(ConfigurationError::InvalidCosineCutoff(cosine_cutoff));
            }
        }
        Ok(())
    }
}

// ============================================================================
// ESTIMATOR
// ============================================================================

/// Tally attached to a set of entities
#[derive(Debug)]
pub struct Estimator {
    id: EstimatorId,
    kind: EstimatorKind,
    multiplier: f64,
    contribution: ContributionMultiplier,
    particle_types: ParticleTypeSet,
    discretization: PhaseSpaceDiscretization,
    responses: Vec<ParticleResponse>,
    entities: Vec<EntityId>,
    norms: Vec<f64>,
    entity_index: HashMap<EntityId, usize>,
    accumulator: ScoreAccumulator,
    dropped: AtomicU64,
}

impl Estimator {
    /// Create an estimator over `(entity, norm constant)` pairs
    ///
    /// Accepts every particle type and has no active dimension until
    /// configured otherwise.
    pub fn new(
        id: EstimatorId,
        kind: EstimatorKind,
        multiplier: f64,
        entities: &[(EntityId, f64)],
    ) -> ConfigResult<Self> {
        kind.validate()?;

        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(ConfigurationError::InvalidMultiplier { estimator: id, value: multiplier });
        }
        if entities.is_empty() {
            return Err(ConfigurationError::NoEntities(id));
        }

        let mut entity_index = HashMap::with_capacity(entities.len());
        for (i, &(entity, norm)) in entities.iter().enumerate() {
            if !(norm.is_finite() && norm > 0.0) {
                return Err(ConfigurationError::InvalidNormConstant { entity, value: norm });
            }
            if entity_index.insert(entity, i).is_some() {
                return Err(ConfigurationError::DuplicateEntity { estimator: id, entity });
            }
        }

        if let EstimatorKind::MeshTrackLengthFlux { mesh } = &kind {
            let elements = mesh.number_of_elements() as EntityId;
            if let Some(&(entity, _)) = entities.iter().find(|(e, _)| *e >= elements) {
                return Err(ConfigurationError::InvalidMesh(format!(
                    "estimator {id} lists element {entity}, mesh has {elements}"
                )));
            }
        }

        let discretization = PhaseSpaceDiscretization::new();
        let responses = vec![ParticleResponse::Unit];
        let accumulator = ScoreAccumulator::new(
            entities.len(),
            discretization.number_of_bins(),
            responses.len(),
            DEFAULT_WORKERS,
        );

        Ok(Self {
            id,
            kind,
            multiplier,
            contribution: ContributionMultiplier::default(),
            particle_types: ParticleTypeSet::all(),
            discretization,
            responses,
            entities: entities.iter().map(|(e, _)| *e).collect(),
            norms: entities.iter().map(|(_, n)| *n).collect(),
            entity_index,
            accumulator,
            dropped: AtomicU64::new(0),
        })
    }

    /// Mesh track-length estimator over every element, normalized by volume
    pub fn for_mesh(
        id: EstimatorId,
        mesh: StructuredHexMesh,
        multiplier: f64,
    ) -> ConfigResult<Self> {
        let entities: Vec<(EntityId, f64)> = mesh
            .element_ids()
            .into_iter()
            .map(|e| (e, mesh.element_volume(e)))
            .collect();
        Self::new(id, EstimatorKind::MeshTrackLengthFlux { mesh }, multiplier, &entities)
    }

    pub fn with_contribution_multiplier(mut self, contribution: ContributionMultiplier) -> Self {
        self.contribution = contribution;
        self
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    /// Restrict the accepted particle types
    pub fn set_particle_types(&mut self, types: &[ParticleType]) -> ConfigResult<()> {
        let set = ParticleTypeSet::from_types(types);
        if set.is_empty() {
            return Err(ConfigurationError::NoParticleTypes(self.id));
        }
        self.particle_types = set;
        Ok(())
    }

    /// Attach (or replace) the bin boundaries of a dimension
    ///
    /// Reallocates the moment tables, so it belongs before the first
    /// history.
    pub fn set_bin_boundaries(
        &mut self,
        dimension: PhaseSpaceDimension,
        boundaries: Vec<f64>,
    ) -> ConfigResult<()> {
        if !self.kind.supports_dimension(dimension) {
            return Err(ConfigurationError::IncompatibleDimension {
                estimator: self.id,
                kind: self.kind.name(),
                dimension,
            });
        }

        self.discretization
            .assign(DimensionDiscretization::new(dimension, boundaries)?);
        self.reallocate();
        Ok(())
    }

    /// Replace the response functions
    ///
    /// Reallocates the moment tables, so it belongs before the first
    /// history.
    pub fn set_response_functions(&mut self, responses: Vec<ParticleResponse>) -> ConfigResult<()> {
        if responses.is_empty() {
            return Err(ConfigurationError::NoResponses(self.id));
        }
        self.check_responses(&responses)?;
        self.responses = responses;
        self.reallocate();
        Ok(())
    }

    /// Append a response function after the existing ones
    pub fn add_response_function(&mut self, response: ParticleResponse) -> ConfigResult<()> {
        self.check_responses(std::slice::from_ref(&response))?;
        self.responses.push(response);
        self.reallocate();
        Ok(())
    }

    fn check_responses(&self, responses: &[ParticleResponse]) -> ConfigResult<()> {
        // Pulse height scores a deposition, not a particle state
        if matches!(self.kind, EstimatorKind::CellPulseHeight) {
            return Err(ConfigurationError::IncompatibleResponse {
                estimator: self.id,
                kind: self.kind.name(),
            });
        }
        responses.iter().try_for_each(ParticleResponse::validate)
    }

    fn reallocate(&mut self) {
        self.accumulator = ScoreAccumulator::new(
            self.entities.len(),
            self.number_of_bins(),
            self.responses.len(),
            self.accumulator.workers(),
        );
    }

    /// Allocate one replica per worker
    pub fn enable_thread_support(&mut self, workers: usize) -> ConfigResult<()> {
        if workers == 0 {
            return Err(ConfigurationError::NoWorkers);
        }
        let lost = self.accumulator.set_workers(workers);
        if lost > 0 {
            warn!(estimator = self.id, lost, "Discarded uncommitted history contributions");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> EstimatorId {
        self.id
    }

    pub fn kind(&self) -> &EstimatorKind {
        &self.kind
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn contribution_multiplier(&self) -> ContributionMultiplier {
        self.contribution
    }

    pub fn particle_types(&self) -> ParticleTypeSet {
        self.particle_types
    }

    pub fn discretization(&self) -> &PhaseSpaceDiscretization {
        &self.discretization
    }

    pub fn dimension_ordering(&self) -> Vec<PhaseSpaceDimension> {
        self.discretization.dimension_ordering()
    }

    /// Phase-space bins of one response
    pub fn number_of_bins(&self) -> usize {
        self.discretization.number_of_bins()
    }

    pub fn response_functions(&self) -> &[ParticleResponse] {
        &self.responses
    }

    pub fn number_of_response_functions(&self) -> usize {
        self.responses.len()
    }

    pub fn response_function_name(&self, response: usize) -> Option<String> {
        self.responses.get(response).map(ParticleResponse::name)
    }

    /// Length of each entity's bin axis: phase-space bins × responses
    pub fn number_of_scored_bins(&self) -> usize {
        self.number_of_bins() * self.responses.len()
    }

    /// Response a scored bin belongs to
    pub fn calculate_response_function_index(&self, bin: usize) -> usize {
        bin / self.number_of_bins()
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn has_entity(&self, entity: EntityId) -> bool {
        self.entity_index.contains_key(&entity)
    }

    /// Position of an entity in the moment tables
    #[inline]
    pub fn entity_index(&self, entity: EntityId) -> Option<usize> {
        self.entity_index.get(&entity).copied()
    }

    pub fn norm_constant(&self, entity: EntityId) -> Option<f64> {
        self.entity_index(entity).map(|i| self.norms[i])
    }

    /// Sum of all entity norm constants
    pub fn total_norm_constant(&self) -> f64 {
        self.norms.iter().sum()
    }

    pub fn workers(&self) -> usize {
        self.accumulator.workers()
    }

    /// Contributions dropped since the last reset
    pub fn dropped_contributions(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn drop_contribution(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Scoring
    // ------------------------------------------------------------------------

    /// Add a raw score for the current history of `worker`
    ///
    /// Rejected particle types and out-of-range samples are dropped and
    /// counted; only an entity the estimator does not own is an error.
    pub fn add_partial_history_contribution(
        &self,
        worker: WorkerId,
        entity: EntityId,
        point: &ObservationPoint<'_>,
        raw_score: f64,
    ) -> Result<(), EstimatorError> {
        let index = self.entity_index(entity).ok_or(EstimatorError::UnknownEntity {
            estimator: self.id,
            entity,
        })?;

        if !self.particle_types.contains(point.particle.particle_type) {
            self.drop_contribution();
            return Ok(());
        }

        let Ok(bin) = self.discretization.calculate_bin_index(point) else {
            self.drop_contribution();
            return Ok(());
        };

        let stride = self.number_of_bins();
        for (r, response) in self.responses.iter().enumerate() {
            let score = raw_score * response.evaluate(point);
            self.accumulator.add_partial(worker, index, r * stride + bin, score)?;
        }
        Ok(())
    }

    /// Pulse height: particle energy enters a cell
    pub fn update_from_particle_entering_cell(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        cell: EntityId,
    ) -> Result<(), EstimatorError> {
        self.add_deposition(worker, particle, cell, particle.weight * particle.energy)
    }

    /// Pulse height: particle energy leaves a cell
    pub fn update_from_particle_leaving_cell(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        cell: EntityId,
    ) -> Result<(), EstimatorError> {
        self.add_deposition(worker, particle, cell, -particle.weight * particle.energy)
    }

    fn add_deposition(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        cell: EntityId,
        energy: f64,
    ) -> Result<(), EstimatorError> {
        debug_assert!(matches!(self.kind, EstimatorKind::CellPulseHeight));

        let index = self.entity_index(cell).ok_or(EstimatorError::UnknownEntity {
            estimator: self.id,
            entity: cell,
        })?;

        if !self.particle_types.contains(particle.particle_type) {
            self.drop_contribution();
            return Ok(());
        }
        self.accumulator.add_deposition(worker, index, energy)
    }

    /// Collision flux: w/Σt in the particle's cell
    pub fn update_from_particle_colliding_in_cell(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        inverse_total_cross_section: f64,
    ) -> Result<(), EstimatorError> {
        let score = inverse_total_cross_section * self.contribution.factor(particle);
        self.add_partial_history_contribution(
            worker,
            particle.cell,
            &ObservationPoint::new(particle),
            score,
        )
    }

    /// Track-length flux: w·ℓ in the cell
    pub fn update_from_particle_subtrack_ending_in_cell(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        cell: EntityId,
        track_length: f64,
        start_angle_cosine: f64,
    ) -> Result<(), EstimatorError> {
        let score = track_length * self.contribution.factor(particle);
        let point = ObservationPoint::new(particle).with_angle_cosine(start_angle_cosine);
        self.add_partial_history_contribution(worker, cell, &point, score)
    }

    /// Surface flux (w/|μ|) or current (w)
    pub fn update_from_particle_crossing_surface(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        surface: EntityId,
        angle_cosine: f64,
    ) -> Result<(), EstimatorError> {
        let factor = self.contribution.factor(particle);
        let score = match self.kind {
            EstimatorKind::SurfaceFlux { cosine_cutoff } => {
                let mut mu = angle_cosine.abs();
                if mu < cosine_cutoff {
                    mu = 0.5 * cosine_cutoff;
                }
                factor / mu
            }
            _ => factor,
        };

        let point = ObservationPoint::new(particle).with_angle_cosine(angle_cosine);
        self.add_partial_history_contribution(worker, surface, &point, score)
    }

    /// Mesh track-length flux: w·ℓ per crossed element
    pub fn update_from_particle_subtrack_ending_global(
        &self,
        worker: WorkerId,
        particle: &ParticleState,
        start: &Vec3,
        end: &Vec3,
    ) -> Result<(), EstimatorError> {
        let EstimatorKind::MeshTrackLengthFlux { mesh } = &self.kind else {
            return Ok(());
        };

        let factor = self.contribution.factor(particle);
        let point = ObservationPoint::new(particle);
        for (element, length) in mesh.track_lengths(start, end) {
            if self.has_entity(element) {
                self.add_partial_history_contribution(worker, element, &point, length * factor)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // History boundary
    // ------------------------------------------------------------------------

    /// Fold the worker's current history into the shared moments
    pub fn commit_history_contribution(&self, worker: WorkerId) -> Result<(), EstimatorError> {
        if !matches!(self.kind, EstimatorKind::CellPulseHeight) {
            return self.accumulator.commit_history(worker, |_| None);
        }

        self.accumulator.commit_history(worker, |deposit| {
            let bin = self.discretization.calculate_bin_index_with(|dimension| {
                (dimension == PhaseSpaceDimension::Energy).then_some(deposit)
            });
            match bin {
                Ok(bin) => {
                    let score = match self.contribution {
                        ContributionMultiplier::Weight => 1.0,
                        ContributionMultiplier::WeightAndEnergy => deposit,
                    };
                    Some((bin, score))
                }
                Err(_) => {
                    self.drop_contribution();
                    None
                }
            }
        })
    }

    pub fn has_uncommitted_history_contribution(
        &self,
        worker: WorkerId,
    ) -> Result<bool, EstimatorError> {
        self.accumulator.has_uncommitted(worker)
    }

    /// Zero all moments, replicas and the dropped counter
    pub fn reset_data(&self) {
        self.accumulator.reset();
        self.dropped.store(0, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------------
    // Reduction
    // ------------------------------------------------------------------------

    /// Length of the flattened moment table
    pub fn moment_table_len(&self) -> usize {
        self.accumulator.with_table(|t| t.flat_len())
    }

    /// Hash of everything that gives the moment table its meaning
    ///
    /// Covers the kind, the entity order, the dimension ordering with every
    /// boundary, and the response functions. Ranks whose tables have the
    /// same length but different bins disagree here.
    pub fn layout_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.kind.name().hash(&mut hasher);
        self.entities.hash(&mut hasher);
        for d in self.discretization.discretizations() {
            d.dimension().hash(&mut hasher);
            for b in d.boundaries() {
                b.to_bits().hash(&mut hasher);
            }
        }
        for response in &self.responses {
            response.name().hash(&mut hasher);
            if let ParticleResponse::Tabulated { dimension, grid, values, .. } = response {
                dimension.hash(&mut hasher);
                for v in grid.iter().chain(values) {
                    v.to_bits().hash(&mut hasher);
                }
            }
        }
        hasher.finish()
    }

    pub fn moments_flat(&self) -> Vec<f64> {
        self.accumulator.with_table(|t| t.to_flat())
    }

    /// Replace the shared table with its sum over ranks
    pub(crate) fn store_reduced_moments(&self, sum: &[f64]) {
        self.accumulator.with_table(|t| {
            t.reset();
            t.merge_flat(sum);
        });
    }

    // ------------------------------------------------------------------------
    // Results
    // ------------------------------------------------------------------------

    pub fn moment_table(&self) -> MomentTable {
        self.accumulator.table()
    }

    /// Raw (S1, S2) per bin of an entity
    pub fn raw_bin_data(&self, entity: EntityId) -> Option<Vec<MomentPair>> {
        let index = self.entity_index(entity)?;
        Some(self.accumulator.with_table(|t| t.entity_bins(index).to_vec()))
    }

    /// Raw (S1, S2) of the entity total over the phase-space bins, one
    /// pair per response
    pub fn raw_entity_total(&self, entity: EntityId) -> Option<Vec<MomentPair>> {
        let index = self.entity_index(entity)?;
        Some(self.accumulator.with_table(|t| t.entity_totals(index).to_vec()))
    }

    /// Raw (S1, S2) per bin summed over all entities
    pub fn raw_total_bin_data(&self) -> Vec<MomentPair> {
        self.accumulator.with_table(|t| t.total_bins().to_vec())
    }

    pub fn processed_bin_data(
        &self,
        entity: EntityId,
        context: &RunContext,
    ) -> Option<Vec<ProcessedMoments>> {
        let scale = self.multiplier / self.norm_constant(entity)?;
        let raw = self.raw_bin_data(entity)?;
        Some(Self::process_all(&raw, context, scale))
    }

    pub fn processed_entity_total(
        &self,
        entity: EntityId,
        context: &RunContext,
    ) -> Option<Vec<ProcessedMoments>> {
        let scale = self.multiplier / self.norm_constant(entity)?;
        let raw = self.raw_entity_total(entity)?;
        Some(Self::process_all(&raw, context, scale))
    }

    /// Total-bin estimates, normalized by the total norm constant
    pub fn processed_total_bin_data(&self, context: &RunContext) -> Vec<ProcessedMoments> {
        let scale = self.multiplier / self.total_norm_constant();
        Self::process_all(&self.raw_total_bin_data(), context, scale)
    }

    fn process_all(raw: &[MomentPair], context: &RunContext, scale: f64) -> Vec<ProcessedMoments> {
        raw.iter()
            .map(|m| m.process(context.total_histories, scale, context.elapsed()))
            .collect()
    }

    /// Names of every scored bin, e.g. `Energy Bin: [0,1), f(particle) = 1`
    pub fn bin_names(&self) -> Vec<String> {
        let phase_names: Vec<String> = (0..self.number_of_bins())
            .map(|bin| self.discretization.bin_name(bin))
            .collect();
        let mut names = Vec::with_capacity(self.number_of_scored_bins());
        for response in &self.responses {
            let response_name = response.name();
            names.extend(phase_names.iter().map(|phase| format!("{phase}, {response_name}")));
        }
        names
    }

    /// Hand metadata, raw moments and (optionally) processed data to a sink
    pub fn export(
        &self,
        sink: &mut dyn ObserverDataSink,
        context: &RunContext,
        process: bool,
    ) -> Result<(), ExportError> {
        let id = self.id;
        let dropped = self.dropped_contributions();
        if dropped > 0 {
            debug!(
                estimator = id,
                dropped,
                "Contributions dropped (out of range or particle type)"
            );
        }

        let kind = self.kind.name().to_string();
        sink.write(id, None, ExportField::Kind, ExportValue::Text(kind))?;
        sink.write(id, None, ExportField::Multiplier, ExportValue::Scalar(self.multiplier))?;
        sink.write(
            id,
            None,
            ExportField::ContributionMultiplier,
            ExportValue::Text(self.contribution.name().to_string()),
        )?;
        let types = self.particle_types.types().iter().map(|t| t.name().to_string()).collect();
        sink.write(id, None, ExportField::ParticleTypes, ExportValue::Names(types))?;
        sink.write(
            id,
            None,
            ExportField::DimensionOrdering,
            ExportValue::Dimensions(self.dimension_ordering()),
        )?;
        for d in self.discretization.discretizations() {
            sink.write(
                id,
                None,
                ExportField::BinBoundaries(d.dimension()),
                ExportValue::Boundaries(d.boundaries().to_vec()),
            )?;
        }
        let norms = self.entities.iter().copied().zip(self.norms.iter().copied()).collect();
        sink.write(id, None, ExportField::EntityNormConstants, ExportValue::NormConstants(norms))?;
        let responses = self.responses.iter().map(ParticleResponse::name).collect();
        sink.write(id, None, ExportField::ResponseFunctionNames, ExportValue::Names(responses))?;
        sink.write(id, None, ExportField::BinNames, ExportValue::Names(self.bin_names()))?;
        sink.write(id, None, ExportField::DroppedContributions, ExportValue::Count(dropped))?;

        let table = self.moment_table();
        for (index, &entity) in self.entities.iter().enumerate() {
            let bins = table.entity_bins(index);
            let totals = table.entity_totals(index);
            let raw = ExportValue::Moments(bins.to_vec());
            sink.write(id, Some(entity), ExportField::RawBinData, raw)?;
            let raw_totals = ExportValue::Moments(totals.to_vec());
            sink.write(id, Some(entity), ExportField::RawEntityTotal, raw_totals)?;

            if process {
                let scale = self.multiplier / self.norms[index];
                sink.write(
                    id,
                    Some(entity),
                    ExportField::ProcessedBinData,
                    ExportValue::Processed(Self::process_all(bins, context, scale)),
                )?;
                sink.write(
                    id,
                    Some(entity),
                    ExportField::ProcessedEntityTotal,
                    ExportValue::Processed(Self::process_all(totals, context, scale)),
                )?;
            }
        }

        let raw_totals = ExportValue::Moments(table.total_bins().to_vec());
        sink.write(id, None, ExportField::RawTotalBinData, raw_totals)?;
        if process {
            let scale = self.multiplier / self.total_norm_constant();
            sink.write(
                id,
                None,
                ExportField::ProcessedTotalBinData,
                ExportValue::Processed(Self::process_all(table.total_bins(), context, scale)),
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::MeshPlanes;

    fn context(histories: u64) -> RunContext {
        RunContext::new(histories, 0.0, 1.0)
    }

    fn track_estimator() -> Estimator {
        Estimator::new(1, EstimatorKind::CellTrackLengthFlux, 1.0, &[(10, 2.0), (11, 1.0)]).unwrap()
    }

    #[test]
    fn test_rejects_bad_configuration() {
        let kind = EstimatorKind::CellTrackLengthFlux;
        assert!(matches!(
            Estimator::new(1, kind.clone(), 0.0, &[(1, 1.0)]),
            Err(ConfigurationError::InvalidMultiplier { .. })
        ));
        assert!(matches!(
            Estimator::new(1, kind.clone(), 1.0, &[]),
            Err(ConfigurationError::NoEntities(1))
        ));
        assert!(matches!(
            Estimator::new(1, kind.clone(), 1.0, &[(1, 1.0), (1, 2.0)]),
            Err(ConfigurationError::DuplicateEntity { entity: 1, .. })
        ));
        assert!(matches!(
            Estimator::new(1, kind, 1.0, &[(1, -1.0)]),
            Err(ConfigurationError::InvalidNormConstant { .. })
        ));
        assert!(matches!(
            Estimator::new(1, EstimatorKind::SurfaceFlux { cosine_cutoff: 0.0 }, 1.0, &[(1, 1.0)]),
            Err(ConfigurationError::InvalidCosineCutoff(_))
        ));
    }

    #[test]
    fn test_incompatible_dimension() {
        let mut est =
            Estimator::new(2, EstimatorKind::CellPulseHeight, 1.0, &[(1, 1.0)]).unwrap();
        assert!(matches!(
            est.set_bin_boundaries(PhaseSpaceDimension::Time, vec![0.0, 1.0]),
            Err(ConfigurationError::IncompatibleDimension { .. })
        ));
        assert!(est.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0]).is_ok());
    }

    #[test]
    fn test_track_length_scoring() {
        let est = track_estimator();
        let p = ParticleState::neutron(0).with_weight(0.5);

        est.update_from_particle_subtrack_ending_in_cell(0, &p, 10, 4.0, 1.0).unwrap();
        est.update_from_particle_subtrack_ending_in_cell(0, &p, 10, 2.0, 1.0).unwrap();
        est.commit_history_contribution(0).unwrap();

        assert_eq!(est.raw_bin_data(10).unwrap(), vec![MomentPair::new(3.0, 9.0)]);
        assert_eq!(est.raw_bin_data(11).unwrap(), vec![MomentPair::ZERO]);

        // Norm constant 2.0 for entity 10
        let processed = est.processed_bin_data(10, &context(1)).unwrap();
        assert!((processed[0].mean - 1.5).abs() < 1e-12);
    }

    #[test]
    fn test_unknown_entity() {
        let est = track_estimator();
        let p = ParticleState::neutron(0);
        assert_eq!(
            est.update_from_particle_subtrack_ending_in_cell(0, &p, 99, 1.0, 1.0),
            Err(EstimatorError::UnknownEntity { estimator: 1, entity: 99 })
        );
    }

    #[test]
    fn test_particle_type_filter() {
        let mut est = track_estimator();
        est.set_particle_types(&[ParticleType::Photon]).unwrap();

        let n = ParticleState::neutron(0);
        est.update_from_particle_subtrack_ending_in_cell(0, &n, 10, 1.0, 1.0).unwrap();
        assert!(!est.has_uncommitted_history_contribution(0).unwrap());
        assert_eq!(est.dropped_contributions(), 1);
        assert!(est.set_particle_types(&[]).is_err());
    }

    #[test]
    fn test_out_of_range_dropped() {
        let mut est = track_estimator();
        est.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0, 2.0]).unwrap();

        let p = ParticleState::neutron(0).with_energy(14.1);
        est.update_from_particle_subtrack_ending_in_cell(0, &p, 10, 1.0, 1.0).unwrap();
        est.commit_history_contribution(0).unwrap();

        assert!(est.moment_table().is_zero());
        assert_eq!(est.dropped_contributions(), 1);
    }

    #[test]
    fn test_collision_flux_uses_particle_cell() {
        let est = Estimator::new(3, EstimatorKind::CellCollisionFlux, 1.0, &[(4, 1.0)]).unwrap();
        let p = ParticleState::neutron(0).with_cell(4).with_weight(2.0);

        est.update_from_particle_colliding_in_cell(0, &p, 0.25).unwrap();
        est.commit_history_contribution(0).unwrap();
        assert_eq!(est.raw_bin_data(4).unwrap()[0], MomentPair::new(0.5, 0.25));
    }

    #[test]
    fn test_surface_flux_cosine_cutoff() {
        let est = Estimator::new(4, EstimatorKind::surface_flux(), 1.0, &[(1, 1.0)]).unwrap();
        let p = ParticleState::photon(0);

        est.update_from_particle_crossing_surface(0, &p, 1, 0.5).unwrap();
        est.commit_history_contribution(0).unwrap();
        assert!((est.raw_bin_data(1).unwrap()[0].first - 2.0).abs() < 1e-12);

        est.reset_data();
        est.update_from_particle_crossing_surface(0, &p, 1, 1e-5).unwrap();
        est.commit_history_contribution(0).unwrap();
        // |μ| below cutoff scores as cutoff / 2
        let expected = 1.0 / (0.5 * DEFAULT_COSINE_CUTOFF);
        assert!((est.raw_bin_data(1).unwrap()[0].first - expected).abs() < 1e-9);
    }

    #[test]
    fn test_surface_current_cosine_bins() {
        let mut est = Estimator::new(5, EstimatorKind::SurfaceCurrent, 1.0, &[(1, 1.0)]).unwrap();
        est.set_bin_boundaries(PhaseSpaceDimension::Cosine, vec![-1.0, 0.0, 1.0]).unwrap();
        let p = ParticleState::photon(0).with_weight(3.0);

        est.update_from_particle_crossing_surface(0, &p, 1, -0.5).unwrap();
        est.commit_history_contribution(0).unwrap();
        assert_eq!(
            est.raw_bin_data(1).unwrap(),
            vec![MomentPair::new(3.0, 9.0), MomentPair::ZERO]
        );
    }

    #[test]
    fn test_pulse_height_deposition() {
        let mut est = Estimator::new(6, EstimatorKind::CellPulseHeight, 1.0, &[(1, 1.0)]).unwrap();
        est.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0, 10.0]).unwrap();

        let entering = ParticleState::photon(0).with_energy(5.0);
        let leaving = ParticleState::photon(0).with_energy(1.5);
        est.update_from_particle_entering_cell(0, &entering, 1).unwrap();
        est.update_from_particle_leaving_cell(0, &leaving, 1).unwrap();
        est.commit_history_contribution(0).unwrap();

        // 3.5 MeV deposited lands in [1, 10]
        assert_eq!(
            est.raw_bin_data(1).unwrap(),
            vec![MomentPair::ZERO, MomentPair::new(1.0, 1.0)]
        );
    }

    #[test]
    fn test_pulse_height_energy_multiplier() {
        let est = Estimator::new(7, EstimatorKind::CellPulseHeight, 1.0, &[(1, 1.0)])
            .unwrap()
            .with_contribution_multiplier(ContributionMultiplier::WeightAndEnergy);

        let p = ParticleState::new(ParticleType::Electron, 0).with_energy(2.0);
        est.update_from_particle_entering_cell(0, &p, 1).unwrap();
        est.commit_history_contribution(0).unwrap();
        assert_eq!(est.raw_bin_data(1).unwrap()[0], MomentPair::new(2.0, 4.0));
    }

    #[test]
    fn test_mesh_track_length() {
        let mesh = StructuredHexMesh::new(MeshPlanes::uniform(
            Vec3::zero(),
            Vec3::new(2.0, 1.0, 1.0),
            [2, 1, 1],
        ))
        .unwrap();
        let est = Estimator::for_mesh(8, mesh, 1.0).unwrap();
        assert_eq!(est.entities(), &[0, 1]);

        let p = ParticleState::neutron(0);
        est.update_from_particle_subtrack_ending_global(
            0,
            &p,
            &Vec3::new(0.5, 0.5, 0.5),
            &Vec3::new(1.75, 0.5, 0.5),
        )
        .unwrap();
        est.commit_history_contribution(0).unwrap();

        assert!((est.raw_bin_data(0).unwrap()[0].first - 0.5).abs() < 1e-12);
        assert!((est.raw_bin_data(1).unwrap()[0].first - 0.75).abs() < 1e-12);
    }

    fn energy_response() -> ParticleResponse {
        ParticleResponse::tabulated(PhaseSpaceDimension::Energy, vec![0.0, 10.0], vec![0.0, 10.0])
            .unwrap()
    }

    #[test]
    fn test_response_functions_multiply_bins() {
        let mut est = track_estimator();
        est.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0, 10.0]).unwrap();
        est.add_response_function(energy_response()).unwrap();

        assert_eq!(est.number_of_bins(), 2);
        assert_eq!(est.number_of_response_functions(), 2);
        assert_eq!(est.number_of_scored_bins(), 4);
        assert_eq!(est.calculate_response_function_index(1), 0);
        assert_eq!(est.calculate_response_function_index(3), 1);
        assert_eq!(est.moment_table().bins(), 4);

        let names = est.bin_names();
        assert_eq!(names.len(), 4);
        assert_eq!(names[0], "Energy Bin: [0,1), f(particle) = 1");
        assert_eq!(names[3], "Energy Bin: [1,10], f_custom(Energy Dimension)");
    }

    #[test]
    fn test_response_scores_land_in_their_block() {
        let mut est = track_estimator();
        est.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0, 10.0]).unwrap();
        est.set_response_functions(vec![ParticleResponse::Unit, energy_response()])
            .unwrap();

        // f(E) = E, track length 2 at E = 4 in the upper energy bin
        let p = ParticleState::neutron(0).with_energy(4.0);
        est.update_from_particle_subtrack_ending_in_cell(0, &p, 10, 2.0, 1.0).unwrap();
        est.commit_history_contribution(0).unwrap();

        let raw = est.raw_bin_data(10).unwrap();
        assert_eq!(raw[1], MomentPair::new(2.0, 4.0));
        assert!((raw[3].first - 8.0).abs() < 1e-12);
        assert!(raw[0].is_zero() && raw[2].is_zero());

        let totals = est.raw_entity_total(10).unwrap();
        assert_eq!(totals[0], MomentPair::new(2.0, 4.0));
        assert!((totals[1].first - 8.0).abs() < 1e-12);
    }

    #[test]
    fn test_response_configuration_errors() {
        let mut est = track_estimator();
        assert_eq!(est.set_response_functions(Vec::new()), Err(ConfigurationError::NoResponses(1)));

        let mut pulse =
            Estimator::new(2, EstimatorKind::CellPulseHeight, 1.0, &[(1, 1.0)]).unwrap();
        assert!(matches!(
            pulse.add_response_function(energy_response()),
            Err(ConfigurationError::IncompatibleResponse { estimator: 2, .. })
        ));
        assert_eq!(pulse.number_of_response_functions(), 1);
    }

    #[test]
    fn test_source_energy_binning() {
        let mut est = track_estimator();
        est.set_bin_boundaries(PhaseSpaceDimension::SourceEnergy, vec![0.0, 2.0, 20.0]).unwrap();

        // Slowed down to 0.5 MeV but born at 14.1 MeV
        let p = ParticleState::neutron(0).with_energy(14.1).at_source().with_energy(0.5);
        est.update_from_particle_subtrack_ending_in_cell(0, &p, 10, 1.0, 1.0).unwrap();
        est.commit_history_contribution(0).unwrap();

        assert_eq!(
            est.raw_bin_data(10).unwrap(),
            vec![MomentPair::ZERO, MomentPair::new(1.0, 1.0)]
        );
    }

    #[test]
    fn test_source_time_binning() {
        let mut est = track_estimator();
        est.set_bin_boundaries(PhaseSpaceDimension::SourceTime, vec![0.0, 1.0, 2.0]).unwrap();

        let p = ParticleState::neutron(0).with_time(1.5).at_source().with_time(7.0);
        est.update_from_particle_subtrack_ending_in_cell(0, &p, 10, 1.0, 1.0).unwrap();
        est.commit_history_contribution(0).unwrap();

        assert_eq!(
            est.raw_bin_data(10).unwrap(),
            vec![MomentPair::ZERO, MomentPair::new(1.0, 1.0)]
        );
        assert_eq!(est.dropped_contributions(), 0);
    }

    #[test]
    fn test_source_id_binning() {
        let mut est = Estimator::new(9, EstimatorKind::SurfaceCurrent, 1.0, &[(1, 1.0)]).unwrap();
        est.set_bin_boundaries(PhaseSpaceDimension::SourceId, vec![0.0, 1.0, 2.0, 3.0]).unwrap();

        for id in [0, 2, 2, 7] {
            let p = ParticleState::photon(0).with_source_id(id);
            est.update_from_particle_crossing_surface(0, &p, 1, 1.0).unwrap();
        }
        est.commit_history_contribution(0).unwrap();

        let raw = est.raw_bin_data(1).unwrap();
        assert_eq!(raw[0], MomentPair::new(1.0, 1.0));
        assert!(raw[1].is_zero());
        assert_eq!(raw[2], MomentPair::new(2.0, 4.0));
        // Source 7 is outside every bin
        assert_eq!(est.dropped_contributions(), 1);
        assert_eq!(est.bin_names()[2], "Source ID Bin: [2,3], f(particle) = 1");
    }

    #[test]
    fn test_pulse_height_rejects_source_dimensions() {
        let mut est = Estimator::new(2, EstimatorKind::CellPulseHeight, 1.0, &[(1, 1.0)]).unwrap();
        assert!(matches!(
            est.set_bin_boundaries(PhaseSpaceDimension::SourceEnergy, vec![0.0, 1.0]),
            Err(ConfigurationError::IncompatibleDimension { .. })
        ));
    }

    #[test]
    fn test_layout_fingerprint_tracks_boundaries() {
        let mut a = track_estimator();
        let mut b = track_estimator();
        assert_eq!(a.layout_fingerprint(), b.layout_fingerprint());

        a.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0, 2.0]).unwrap();
        b.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 5.0, 10.0]).unwrap();
        assert_eq!(a.moment_table_len(), b.moment_table_len());
        assert_ne!(a.layout_fingerprint(), b.layout_fingerprint());

        b.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0, 2.0]).unwrap();
        assert_eq!(a.layout_fingerprint(), b.layout_fingerprint());

        b.set_response_functions(vec![energy_response()]).unwrap();
        assert_eq!(a.moment_table_len(), b.moment_table_len());
        assert_ne!(a.layout_fingerprint(), b.layout_fingerprint());
    }

    #[test]
    fn test_entity_and_total_bins() {
        let mut est = track_estimator();
        est.set_bin_boundaries(PhaseSpaceDimension::Energy, vec![0.0, 1.0, 2.0]).unwrap();
        let low = ParticleState::neutron(0).with_energy(0.5);
        let high = ParticleState::neutron(0).with_energy(1.5);

        est.update_from_particle_subtrack_ending_in_cell(0, &low, 10, 1.0, 1.0).unwrap();
        est.update_from_particle_subtrack_ending_in_cell(0, &high, 10, 1.0, 1.0).unwrap();
        est.update_from_particle_subtrack_ending_in_cell(0, &low, 11, 1.0, 1.0).unwrap();
        est.commit_history_contribution(0).unwrap();

        assert_eq!(est.raw_entity_total(10), Some(vec![MomentPair::new(2.0, 4.0)]));
        assert_eq!(
            est.raw_total_bin_data(),
            vec![MomentPair::new(2.0, 4.0), MomentPair::new(1.0, 1.0)]
        );

        // Total norm constant 3.0
        let totals = est.processed_total_bin_data(&context(1));
        assert!((totals[0].mean - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(est.bin_names()[1], "Energy Bin: [1,2], f(particle) = 1");
    }
}
