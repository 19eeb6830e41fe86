//! # Export Module
//!
//! Pluggable persistence for estimator results.
//!
//! Every record is `(estimator, entity?, field, value)`; the sink decides the
//! layout. [`MemorySink`] keeps records for inspection, [`JsonSink`] builds a
//! JSON document:
//!
//! ```text
//! { "run": {...},
//!   "estimators": { "<id>": { "<field>": value,
//!                             "entities": { "<entity>": { "<field>": value } } } } }
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ExportError;
use crate::estimator::{MomentPair, ProcessedMoments};
use crate::handler::RunContext;
use crate::phase_space::PhaseSpaceDimension;
use crate::types::{EntityId, EstimatorId};

// ============================================================================
// RECORD SCHEMA
// ============================================================================

/// Logical field of an exported record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportField {
    Kind,
    Multiplier,
    ContributionMultiplier,
    ParticleTypes,
    DimensionOrdering,
    BinBoundaries(PhaseSpaceDimension),
    EntityNormConstants,
    ResponseFunctionNames,
    BinNames,
    DroppedContributions,
    RawBinData,
    ProcessedBinData,
    RawEntityTotal,
    ProcessedEntityTotal,
    RawTotalBinData,
    ProcessedTotalBinData,
}

impl ExportField {
    /// Key used by document-style sinks
    pub fn key(&self) -> String {
        match self {
            ExportField::Kind => "kind".into(),
            ExportField::Multiplier => "multiplier".into(),
            ExportField::ContributionMultiplier => "contribution_multiplier".into(),
            ExportField::ParticleTypes => "particle_types".into(),
            ExportField::DimensionOrdering => "dimension_ordering".into(),
            ExportField::BinBoundaries(d) => format!("{}_bin_boundaries", d.basic_name()),
            ExportField::EntityNormConstants => "entity_norm_constants".into(),
            ExportField::ResponseFunctionNames => "response_function_names".into(),
            ExportField::BinNames => "bin_names".into(),
            ExportField::DroppedContributions => "dropped_contributions".into(),
            ExportField::RawBinData => "raw_bin_data".into(),
            ExportField::ProcessedBinData => "processed_bin_data".into(),
            ExportField::RawEntityTotal => "raw_entity_total".into(),
            ExportField::ProcessedEntityTotal => "processed_entity_total".into(),
            ExportField::RawTotalBinData => "raw_total_bin_data".into(),
            ExportField::ProcessedTotalBinData => "processed_total_bin_data".into(),
        }
    }
}

/// Value of an exported record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExportValue {
    Scalar(f64),
    Count(u64),
    Text(String),
    Names(Vec<String>),
    Dimensions(Vec<PhaseSpaceDimension>),
    Boundaries(Vec<f64>),
    NormConstants(Vec<(EntityId, f64)>),
    Moments(Vec<MomentPair>),
    Processed(Vec<ProcessedMoments>),
}

/// Destination of exported estimator data
pub trait ObserverDataSink {
    /// Store one record
    fn write(
        &mut self,
        estimator: EstimatorId,
        entity: Option<EntityId>,
        field: ExportField,
        value: ExportValue,
    ) -> Result<(), ExportError>;

    /// Store the run-wide history count and timing
    fn write_run_context(&mut self, _context: &RunContext) -> Result<(), ExportError> {
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY SINK
// ============================================================================

/// One stored record
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub estimator: EstimatorId,
    pub entity: Option<EntityId>,
    pub field: ExportField,
    pub value: ExportValue,
}

/// Sink that keeps every record in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<ExportRecord>,
    pub run: Option<RunContext>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent value written for a key
    pub fn find(
        &self,
        estimator: EstimatorId,
        entity: Option<EntityId>,
        field: ExportField,
    ) -> Option<&ExportValue> {
        self.records
            .iter()
            .rev()
            .find(|r| r.estimator == estimator && r.entity == entity && r.field == field)
            .map(|r| &r.value)
    }

    pub fn raw_bin_data(&self, estimator: EstimatorId, entity: EntityId) -> Option<&[MomentPair]> {
        match self.find(estimator, Some(entity), ExportField::RawBinData)? {
            ExportValue::Moments(m) => Some(m),
            _ => None,
        }
    }

    pub fn processed_bin_data(
        &self,
        estimator: EstimatorId,
        entity: EntityId,
    ) -> Option<&[ProcessedMoments]> {
        match self.find(estimator, Some(entity), ExportField::ProcessedBinData)? {
            ExportValue::Processed(p) => Some(p),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.run = None;
    }
}

impl ObserverDataSink for MemorySink {
    fn write(
        &mut self,
        estimator: EstimatorId,
        entity: Option<EntityId>,
        field: ExportField,
        value: ExportValue,
    ) -> Result<(), ExportError> {
        self.records.push(ExportRecord { estimator, entity, field, value });
        Ok(())
    }

    fn write_run_context(&mut self, context: &RunContext) -> Result<(), ExportError> {
        self.run = Some(*context);
        Ok(())
    }
}

// ============================================================================
// JSON SINK
// ============================================================================

/// Sink that assembles a JSON document
#[derive(Debug, Clone, Default)]
pub struct JsonSink {
    run: Option<Value>,
    estimators: Map<String, Value>,
}

impl JsonSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The document built so far
    pub fn document(&self) -> Value {
        json!({
            "run": self.run.clone().unwrap_or(Value::Null),
            "estimators": Value::Object(self.estimators.clone()),
        })
    }

    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), ExportError> {
        serde_json::to_writer_pretty(writer, &self.document())?;
        Ok(())
    }

    pub fn to_string_pretty(&self) -> Result<String, ExportError> {
        Ok(serde_json::to_string_pretty(&self.document())?)
    }

    /// Write the document to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ExportError> {
        let mut writer = BufWriter::new(File::create(path)?);
        self.to_writer(&mut writer)?;
        writer.flush()?;
        Ok(())
    }
}

impl ObserverDataSink for JsonSink {
    fn write(
        &mut self,
        estimator: EstimatorId,
        entity: Option<EntityId>,
        field: ExportField,
        value: ExportValue,
    ) -> Result<(), ExportError> {
        let value = serde_json::to_value(value)?;

        let node = self
            .estimators
            .entry(estimator.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(node) = node else {
            return Err(ExportError::Rejected(format!(
                "estimator {estimator} node is not an object"
            )));
        };

        let target = match entity {
            None => node,
            Some(entity) => {
                let entities = node
                    .entry("entities")
                    .or_insert_with(|| Value::Object(Map::new()));
                let Value::Object(entities) = entities else {
                    return Err(ExportError::Rejected("entities node is not an object".into()));
                };
                let entry = entities
                    .entry(entity.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                let Value::Object(entry) = entry else {
                    return Err(ExportError::Rejected(format!(
                        "entity {entity} node is not an object"
                    )));
                };
                entry
            }
        };

        target.insert(field.key(), value);
        Ok(())
    }

    fn write_run_context(&mut self, context: &RunContext) -> Result<(), ExportError> {
        self.run = Some(serde_json::to_value(context)?);
        Ok(())
    }
}
