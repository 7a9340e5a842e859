//! Software pipelining of `Pipelined` loops.
//!
//! A loop body is a sequence of stages with declared buffer effects. Building a
//! [`Pipeline`] runs the passes in order:
//!
//! 1. [`graph`] derives the dependency graph (intra and loop-carried edges),
//! 2. [`planner`] assigns stage offsets and the steady-state order,
//! 3. [`sync`] places arrive/wait barrier pairs on edges that cross async lanes,
//! 4. [`ramp`] wraps the steady body into prologue / loop / epilogue,
//! 5. [`verify`] replays the result for small trip counts before handing it out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::lang::LoopBody;

pub mod graph;
pub mod planner;
pub mod printer;
pub mod ramp;
pub mod sync;
pub mod verify;

pub use graph::{DependencyGraph, Diagnostic, Edge, EdgeKind, Hazard, Stage, StageId};
pub use planner::{Schedule, ScheduleSlot};
pub use ramp::{Body, Instr, InstructionStream, IterExpr, MainLoop, Phase, PipelinedLoop, Step};
pub use sync::{BarrierRef, ClassId, CoveredClass, SyncClass, SyncPlan, Turn};
pub use verify::Report;

pub type Result<T> = std::result::Result<T, SchedulingError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    #[error("cyclic dependency between stages: {}", .stages.join(" -> "))]
    CyclicDependency { stages: Vec<String> },

    #[error("hint violates dependency `{producer}` -> `{consumer}`: {reason}")]
    InvalidHintOrder {
        producer: String,
        consumer: String,
        reason: String,
    },

    #[error(
        "{required} barriers needed but only {budget} available (classes: {}); raise num_stages or add sync hints",
        .classes.join(", ")
    )]
    BarrierBudgetExceeded {
        budget: usize,
        required: usize,
        classes: Vec<String>,
    },

    #[error("invalid pipeline declaration: {0}")]
    InvalidDeclaration(String),

    #[error("unbound symbol `{0}` in trip count")]
    UnboundSymbol(String),

    #[error("generated schedule failed verification: {0}")]
    Verification(String),
}

/// Deepest pipeline a config may ask for.
pub const MAX_NUM_STAGES: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Pipeline depth: physical slots per rotating buffer.
    pub num_stages: usize,
    /// Hardware barriers available to the synchronization inserter.
    pub max_barriers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            num_stages: 2,
            max_barriers: 16,
        }
    }
}

impl PipelineConfig {
    pub fn new(num_stages: usize) -> Self {
        PipelineConfig {
            num_stages,
            ..Default::default()
        }
    }

    pub fn with_max_barriers(mut self, max_barriers: usize) -> Self {
        self.max_barriers = max_barriers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_stages == 0 || self.num_stages > MAX_NUM_STAGES {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "num_stages must be between 1 and {}, got {}",
                MAX_NUM_STAGES, self.num_stages
            )));
        }
        if self.max_barriers == 0 {
            return Err(SchedulingError::InvalidDeclaration(
                "max_barriers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Forces a barrier between two stages even when lane analysis does not ask for one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncHint {
    pub producer: String,
    pub consumer: String,
}

/// Expert overrides of the default scheduling heuristic, keyed by stage name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScheduleHints {
    pub offsets: BTreeMap<String, i32>,
    pub order: Vec<String>,
    pub groups: Vec<Vec<String>>,
    pub sync: Vec<SyncHint>,
}

impl ScheduleHints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(mut self, stage: impl Into<String>, offset: i32) -> Self {
        self.offsets.insert(stage.into(), offset);
        self
    }

    pub fn order<S: Into<String>>(mut self, order: impl IntoIterator<Item = S>) -> Self {
        self.order = order.into_iter().map(Into::into).collect();
        self
    }

    pub fn group<S: Into<String>>(mut self, group: impl IntoIterator<Item = S>) -> Self {
        self.groups.push(group.into_iter().map(Into::into).collect());
        self
    }

    pub fn sync(mut self, producer: impl Into<String>, consumer: impl Into<String>) -> Self {
        self.sync.push(SyncHint {
            producer: producer.into(),
            consumer: consumer.into(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty() && self.order.is_empty() && self.groups.is_empty() && self.sync.is_empty()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SchedulingError::InvalidDeclaration(format!("malformed schedule hints: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SchedulingError::InvalidDeclaration(format!("cannot serialize hints: {}", e)))
    }
}

/// A fully scheduled, synchronized and verified pipelined loop.
#[derive(Clone, Debug)]
pub struct Pipeline {
    graph: DependencyGraph,
    schedule: Schedule,
    sync: SyncPlan,
    program: PipelinedLoop,
}

impl Pipeline {
    pub fn build(body: &LoopBody, config: &PipelineConfig, hints: &ScheduleHints) -> Result<Self> {
        config.validate()?;
        let graph = DependencyGraph::build(body, config.num_stages)?;
        let mut schedule = planner::plan(&graph, config, hints)?;
        let sync = sync::insert(&mut schedule, &graph, config, hints)?;
        let program = ramp::generate(&schedule, &sync, &graph, body.trip_count())?;

        let checked = verify::check_trip_counts(&program, &graph)?;
        debug!(
            stages = graph.stages().len(),
            edges = graph.edges().len(),
            barriers = sync.num_barriers(),
            ramp = schedule.ramp_width(),
            checked,
            "pipeline built"
        );
        Ok(Pipeline {
            graph,
            schedule,
            sync,
            program,
        })
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn sync_plan(&self) -> &SyncPlan {
        &self.sync
    }

    pub fn program(&self) -> &PipelinedLoop {
        &self.program
    }

    pub fn instantiate(&self, trip: u64) -> Result<InstructionStream> {
        self.program.instantiate(trip)
    }

    pub fn render(&self) -> String {
        printer::render(&self.program, &self.graph, &self.sync)
    }

    pub fn render_stream(&self, trip: u64) -> Result<String> {
        let stream = self.instantiate(trip)?;
        Ok(printer::render_stream(&stream, &self.graph))
    }

    /// Replays the flattened loop for `trip` iterations against the barrier protocol.
    pub fn verify(&self, trip: u64) -> Result<Report> {
        let stream = self.instantiate(trip)?;
        verify::verify(stream.steps(), trip, &self.graph, self.sync.classes())
    }
}
