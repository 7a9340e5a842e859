use std::collections::{BTreeSet, HashMap};
use std::fmt;

use tracing::{debug, trace, warn, Level};

use super::{PipelineConfig, Result, SchedulingError};
use crate::lang::{BufferId, BufferKind, BufferRegistry, Lane, Location, LoopBody, Region};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub(crate) usize);

impl StageId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl nohash_hasher::IsEnabled for StageId {}

/// A stage declaration with names resolved against the loop body.
#[derive(Clone, Debug)]
pub struct Stage {
    id: StageId,
    name: String,
    lane: Lane,
    reads: Vec<Region>,
    writes: Vec<Region>,
    declared_offset: Option<i32>,
    after: Vec<StageId>,
    location: Location,
}

impl Stage {
    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn reads(&self) -> &[Region] {
        &self.reads
    }

    pub fn writes(&self) -> &[Region] {
        &self.writes
    }

    pub fn declared_offset(&self) -> Option<i32> {
        self.declared_offset
    }

    pub fn after(&self) -> &[StageId] {
        &self.after
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Every access as (region, is_write).
    pub fn accesses(&self) -> impl Iterator<Item = (&Region, bool)> {
        self.reads
            .iter()
            .map(|r| (r, false))
            .chain(self.writes.iter().map(|r| (r, true)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hazard {
    Raw,
    War,
    Waw,
    /// explicit `after` dependency, no buffer involved
    Order,
}

impl Hazard {
    fn between(earlier_writes: bool, later_writes: bool) -> Option<Hazard> {
        match (earlier_writes, later_writes) {
            (true, false) => Some(Hazard::Raw),
            (false, true) => Some(Hazard::War),
            (true, true) => Some(Hazard::Waw),
            (false, false) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeKind {
    Intra,
    Inter,
}

/// `to` in logical iteration `j + distance` must observe `from` in iteration `j`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub from: StageId,
    pub to: StageId,
    pub distance: u32,
    pub buffer: Option<BufferId>,
    pub hazard: Hazard,
}

impl Edge {
    pub fn kind(&self) -> EdgeKind {
        if self.distance == 0 {
            EdgeKind::Intra
        } else {
            EdgeKind::Inter
        }
    }

    /// Distance in steady-state body iterations once stages have been given offsets.
    pub fn delta(&self, from_offset: i32, to_offset: i32) -> i64 {
        self.distance as i64 + to_offset as i64 - from_offset as i64
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub level: Level,
    pub stage: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: stage `{}`: {}", self.level, self.stage, self.message)
    }
}

#[derive(Clone, Debug)]
pub struct DependencyGraph {
    stages: Vec<Stage>,
    buffers: BufferRegistry,
    edges: Vec<Edge>,
    num_stages: usize,
    live_out: Vec<BufferId>,
    diagnostics: Vec<Diagnostic>,
}

impl DependencyGraph {
    pub fn build(body: &LoopBody, num_stages: usize) -> Result<Self> {
        PipelineConfig::new(num_stages).validate()?;
        let buffers = body.buffers().clone();
        let stages = resolve_stages(body, &buffers)?;

        let mut live_out: Vec<BufferId> = buffers
            .iter()
            .filter(|(_, b)| b.kind() == BufferKind::Persistent)
            .map(|(id, _)| id)
            .collect();
        for id in body.live_out_buffers() {
            if buffers.get(*id).is_none() {
                return Err(SchedulingError::InvalidDeclaration(format!(
                    "live-out buffer {:?} is not registered",
                    id
                )));
            }
            if !live_out.contains(id) {
                live_out.push(*id);
            }
        }
        live_out.sort();

        let edges = derive_edges(&stages, &buffers, num_stages);

        let succ = adjacency(stages.len(), edges.iter().filter(|e| e.distance == 0));
        if let Some(cycle) = find_cycle(&succ) {
            return Err(SchedulingError::CyclicDependency {
                stages: cycle.into_iter().map(|i| stages[i].name.clone()).collect(),
            });
        }

        let mut diagnostics = vec![];
        for (stage, decl) in stages.iter().zip(body.stages()) {
            if !decl.has_effects() {
                warn!(stage = %stage.name, location = %stage.location, "stage declares no reads or writes");
                diagnostics.push(Diagnostic {
                    level: Level::WARN,
                    stage: stage.name.clone(),
                    message: format!("declares no reads or writes ({})", stage.location),
                });
            }
        }

        debug!(
            stages = stages.len(),
            edges = edges.len(),
            loop_carried = edges.iter().filter(|e| e.kind() == EdgeKind::Inter).count(),
            "dependency graph built"
        );
        Ok(DependencyGraph {
            stages,
            buffers,
            edges,
            num_stages,
            live_out,
            diagnostics,
        })
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0]
    }

    pub fn find(&self, name: &str) -> Option<StageId> {
        self.stages.iter().find(|s| s.name == name).map(|s| s.id)
    }

    pub fn name(&self, id: StageId) -> &str {
        &self.stages[id.0].name
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn incoming(&self, id: StageId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn outgoing(&self, id: StageId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn num_stages(&self) -> usize {
        self.num_stages
    }

    pub fn live_out(&self) -> &[BufferId] {
        &self.live_out
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Whether the lanes alone demand a hardware barrier on this edge: only asynchronous
    /// work can still be running when a different lane issues the consumer.
    pub fn needs_barrier(&self, edge: &Edge) -> bool {
        let producer = self.stage(edge.from).lane;
        let consumer = self.stage(edge.to).lane;
        producer.is_async() && producer != consumer
    }

    pub fn describe(&self, edge: &Edge) -> String {
        let buffer = edge
            .buffer
            .map(|b| format!(" on `{}`", self.buffers.name(b)))
            .unwrap_or_default();
        format!(
            "{:?}{} `{}` -> `{}` (distance {})",
            edge.hazard,
            buffer,
            self.name(edge.from),
            self.name(edge.to),
            edge.distance
        )
    }
}

fn resolve_stages(body: &LoopBody, buffers: &BufferRegistry) -> Result<Vec<Stage>> {
    let mut ids: HashMap<&str, StageId> = HashMap::new();
    for (i, decl) in body.stages().iter().enumerate() {
        if decl.name.is_empty() {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "stage declared at {} has an empty name",
                decl.location
            )));
        }
        if ids.insert(decl.name.as_str(), StageId(i)).is_some() {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "stage `{}` declared twice (second at {})",
                decl.name, decl.location
            )));
        }
    }

    let mut stages = Vec::with_capacity(body.stages().len());
    for (i, decl) in body.stages().iter().enumerate() {
        for region in decl.reads.iter().chain(decl.writes.iter()) {
            let buffer = buffers.get(region.buffer).ok_or_else(|| {
                SchedulingError::InvalidDeclaration(format!(
                    "stage `{}` accesses unregistered buffer {:?}",
                    decl.name, region.buffer
                ))
            })?;
            if region.range.start >= region.range.end || region.range.end > buffer.extent() {
                return Err(SchedulingError::InvalidDeclaration(format!(
                    "stage `{}` accesses `{}`[{}..{}] outside of its extent {}",
                    decl.name,
                    buffer.name(),
                    region.range.start,
                    region.range.end,
                    buffer.extent()
                )));
            }
        }
        let mut after = vec![];
        for dep in decl.after.iter() {
            let id = ids.get(dep.as_str()).ok_or_else(|| {
                SchedulingError::InvalidDeclaration(format!(
                    "stage `{}` is ordered after unknown stage `{}`",
                    decl.name, dep
                ))
            })?;
            after.push(*id);
        }
        stages.push(Stage {
            id: StageId(i),
            name: decl.name.clone(),
            lane: decl.lane,
            reads: decl.reads.clone(),
            writes: decl.writes.clone(),
            declared_offset: decl.offset,
            after,
            location: decl.location.clone(),
        });
    }
    Ok(stages)
}

// `a` declared before `b` conflict within an iteration. Pairs that wrap around the loop
// (`a` at or after `b`) conflict one iteration later on persistent buffers and `num_stages`
// iterations later on rotating buffers, where the physical slot comes around again.
fn derive_edges(stages: &[Stage], buffers: &BufferRegistry, num_stages: usize) -> Vec<Edge> {
    let mut edges = BTreeSet::new();
    for a in stages.iter() {
        for b in stages.iter() {
            for (ra, wa) in a.accesses() {
                for (rb, wb) in b.accesses() {
                    if !ra.overlaps(rb) {
                        continue;
                    }
                    let Some(hazard) = Hazard::between(wa, wb) else {
                        continue;
                    };
                    let edge = |distance: u32| Edge {
                        from: a.id,
                        to: b.id,
                        distance,
                        buffer: Some(ra.buffer),
                        hazard,
                    };
                    if a.id < b.id {
                        edges.insert(edge(0));
                        continue;
                    }
                    match buffers.get(ra.buffer).map(|buf| buf.kind()) {
                        Some(BufferKind::Persistent) => {
                            edges.insert(edge(1));
                        }
                        Some(BufferKind::Rotating) if wb => {
                            edges.insert(edge(num_stages as u32));
                        }
                        _ => {}
                    }
                }
            }
        }
        for dep in a.after.iter() {
            edges.insert(Edge {
                from: *dep,
                to: a.id,
                distance: 0,
                buffer: None,
                hazard: Hazard::Order,
            });
        }
    }
    for e in edges.iter() {
        trace!(from = e.from.0, to = e.to.0, distance = e.distance, hazard = ?e.hazard, "edge");
    }
    edges.into_iter().collect()
}

pub(crate) fn adjacency<'a>(n: usize, edges: impl Iterator<Item = &'a Edge>) -> Vec<Vec<usize>> {
    let mut succ = vec![vec![]; n];
    for e in edges {
        if !succ[e.from.0].contains(&e.to.0) {
            succ[e.from.0].push(e.to.0);
        }
    }
    for s in succ.iter_mut() {
        s.sort();
    }
    succ
}

/// Returns one cycle as a node path whose last element repeats the first.
pub(crate) fn find_cycle(succ: &[Vec<usize>]) -> Option<Vec<usize>> {
    fn dfs(v: usize, succ: &[Vec<usize>], color: &mut [u8], stack: &mut Vec<usize>) -> Option<Vec<usize>> {
        color[v] = 1;
        stack.push(v);
        for &w in succ[v].iter() {
            if color[w] == 1 {
                let start = stack.iter().position(|x| *x == w).unwrap_or(0);
                let mut cycle = stack[start..].to_vec();
                cycle.push(w);
                return Some(cycle);
            }
            if color[w] == 0 {
                if let Some(cycle) = dfs(w, succ, color, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        color[v] = 2;
        None
    }

    let mut color = vec![0u8; succ.len()];
    let mut stack = vec![];
    for v in 0..succ.len() {
        if color[v] == 0 {
            if let Some(cycle) = dfs(v, succ, &mut color, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}
