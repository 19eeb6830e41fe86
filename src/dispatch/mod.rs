//! # Dispatch Module
//!
//! Routing table from transport events to interested estimators.
//!
//! ```text
//! (event kind, entity) ──▶ [estimator ids]      entity events
//! global               ──▶ [estimator ids]      subtrack-ending events
//! ```
//!
//! The registry is filled single-threaded during setup and only read while
//! histories run. It does not filter on particle type or bin range.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{EntityId, EstimatorId};

// ============================================================================
// EVENT KINDS
// ============================================================================

/// Transport event an estimator can observe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ParticleEnteringCell,
    ParticleLeavingCell,
    ParticleCollidingInCell,
    ParticleSubtrackEndingInCell,
    ParticleCrossingSurface,
    /// Entity-less event: track segment ended anywhere
    ParticleSubtrackEndingGlobal,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::ParticleEnteringCell,
        EventKind::ParticleLeavingCell,
        EventKind::ParticleCollidingInCell,
        EventKind::ParticleSubtrackEndingInCell,
        EventKind::ParticleCrossingSurface,
        EventKind::ParticleSubtrackEndingGlobal,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ParticleEnteringCell => "particle entering cell",
            EventKind::ParticleLeavingCell => "particle leaving cell",
            EventKind::ParticleCollidingInCell => "particle colliding in cell",
            EventKind::ParticleSubtrackEndingInCell => "particle subtrack ending in cell",
            EventKind::ParticleCrossingSurface => "particle crossing surface",
            EventKind::ParticleSubtrackEndingGlobal => "particle subtrack ending global",
        }
    }

    /// Does this event carry no entity?
    pub fn is_global(&self) -> bool {
        matches!(self, EventKind::ParticleSubtrackEndingGlobal)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Observer lists per (event kind, entity) plus the global list
#[derive(Debug, Clone, Default)]
pub struct ObserverRegistry {
    entity_observers: HashMap<EventKind, HashMap<EntityId, Vec<EstimatorId>>>,
    global_observers: Vec<EstimatorId>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an estimator for an entity event on each listed entity
    ///
    /// An estimator already listed for an (event, entity) pair is skipped.
    pub fn add_observer(&mut self, kind: EventKind, entities: &[EntityId], estimator: EstimatorId) {
        debug_assert!(!kind.is_global());

        let map = self.entity_observers.entry(kind).or_default();
        for &entity in entities {
            let list = map.entry(entity).or_default();
            if !list.contains(&estimator) {
                list.push(estimator);
            }
        }
    }

    /// Register an estimator for the entity-less event
    pub fn add_global_observer(&mut self, estimator: EstimatorId) {
        if !self.global_observers.contains(&estimator) {
            self.global_observers.push(estimator);
        }
    }

    /// Estimators interested in an entity event, in registration order
    #[inline]
    pub fn observers_for(&self, kind: EventKind, entity: EntityId) -> &[EstimatorId] {
        self.entity_observers
            .get(&kind)
            .and_then(|map| map.get(&entity))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn observer_count_for(&self, kind: EventKind, entity: EntityId) -> usize {
        self.observers_for(kind, entity).len()
    }

    /// Estimators registered for the entity-less event
    #[inline]
    pub fn global_observers(&self) -> &[EstimatorId] {
        &self.global_observers
    }

    /// Is the estimator registered anywhere?
    pub fn does_observer_exist(&self, estimator: EstimatorId) -> bool {
        self.global_observers.contains(&estimator)
            || self
                .entity_observers
                .values()
                .flat_map(|map| map.values())
                .any(|list| list.contains(&estimator))
    }

    /// Entities with at least one observer for an event, sorted
    pub fn entities_for(&self, kind: EventKind) -> Vec<EntityId> {
        let mut entities: Vec<EntityId> = self
            .entity_observers
            .get(&kind)
            .map(|map| map.keys().copied().collect())
            .unwrap_or_default();
        entities.sort_unstable();
        entities
    }

    /// Event kinds the estimator is registered for, sorted
    pub fn events_for(&self, estimator: EstimatorId) -> Vec<EventKind> {
        let mut events: Vec<EventKind> = self
            .entity_observers
            .iter()
            .filter(|(_, map)| map.values().any(|list| list.contains(&estimator)))
            .map(|(kind, _)| *kind)
            .collect();
        if self.global_observers.contains(&estimator) {
            events.push(EventKind::ParticleSubtrackEndingGlobal);
        }
        events.sort_unstable();
        events
    }

    /// Remove an estimator from every list
    ///
    /// Returns true if it was registered anywhere.
    pub fn remove_observer(&mut self, estimator: EstimatorId) -> bool {
        let mut removed = false;

        for map in self.entity_observers.values_mut() {
            for list in map.values_mut() {
                let before = list.len();
                list.retain(|&id| id != estimator);
                removed |= list.len() != before;
            }
            map.retain(|_, list| !list.is_empty());
        }
        self.entity_observers.retain(|_, map| !map.is_empty());

        let before = self.global_observers.len();
        self.global_observers.retain(|&id| id != estimator);
        removed |= self.global_observers.len() != before;

        removed
    }

    pub fn is_empty(&self) -> bool {
        self.entity_observers.is_empty() && self.global_observers.is_empty()
    }

    pub fn clear(&mut self) {
        self.entity_observers.clear();
        self.global_observers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_count() {
        let mut registry = ObserverRegistry::new();
        registry.add_observer(EventKind::ParticleCrossingSurface, &[1, 2], 10);
        registry.add_observer(EventKind::ParticleCrossingSurface, &[2], 11);

        assert_eq!(registry.observer_count_for(EventKind::ParticleCrossingSurface, 1), 1);
        assert_eq!(registry.observers_for(EventKind::ParticleCrossingSurface, 2), &[10, 11]);
        assert_eq!(registry.observer_count_for(EventKind::ParticleEnteringCell, 1), 0);
        assert_eq!(registry.entities_for(EventKind::ParticleCrossingSurface), vec![1, 2]);
    }

    #[test]
    fn test_duplicates_skipped() {
        let mut registry = ObserverRegistry::new();
        registry.add_observer(EventKind::ParticleEnteringCell, &[5, 5], 1);
        registry.add_observer(EventKind::ParticleEnteringCell, &[5], 1);
        registry.add_global_observer(2);
        registry.add_global_observer(2);

        assert_eq!(registry.observer_count_for(EventKind::ParticleEnteringCell, 5), 1);
        assert_eq!(registry.global_observers(), &[2]);
    }

    #[test]
    fn test_exists_and_events() {
        let mut registry = ObserverRegistry::new();
        registry.add_observer(EventKind::ParticleEnteringCell, &[1], 3);
        registry.add_observer(EventKind::ParticleLeavingCell, &[1], 3);
        registry.add_global_observer(4);

        assert!(registry.does_observer_exist(3));
        assert!(registry.does_observer_exist(4));
        assert!(!registry.does_observer_exist(5));
        assert_eq!(
            registry.events_for(3),
            vec![EventKind::ParticleEnteringCell, EventKind::ParticleLeavingCell]
        );
        assert_eq!(registry.events_for(4), vec![EventKind::ParticleSubtrackEndingGlobal]);
    }

    #[test]
    fn test_remove_observer() {
        let mut registry = ObserverRegistry::new();
        registry.add_observer(EventKind::ParticleCollidingInCell, &[1, 2], 7);
        registry.add_observer(EventKind::ParticleCollidingInCell, &[2], 8);
        registry.add_global_observer(7);

        assert!(registry.remove_observer(7));
        assert!(!registry.does_observer_exist(7));
        assert_eq!(registry.entities_for(EventKind::ParticleCollidingInCell), vec![2]);
        assert!(registry.global_observers().is_empty());
        assert!(!registry.remove_observer(7));

        registry.remove_observer(8);
        assert!(registry.is_empty());
    }
}
