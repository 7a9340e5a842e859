use std::cmp::Reverse;
use std::collections::BinaryHeap;

use tracing::{debug, trace};

use super::graph::{find_cycle, DependencyGraph, Edge, StageId};
use super::sync::ClassId;
use super::{PipelineConfig, Result, ScheduleHints, SchedulingError};
use crate::lang::Lane;

/// One instruction position of the steady-state body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub stage: StageId,
    pub offset: i32,
    /// `offset - min offset`: in body iteration `b` this slot processes logical iteration `b - lag`.
    pub lag: u32,
    /// barrier classes waited on right before the stage issues
    pub waits: Vec<ClassId>,
    /// barrier classes arrived on right after the stage issues
    pub arrives: Vec<ClassId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Schedule {
    slots: Vec<ScheduleSlot>,
    offsets: Vec<i32>,
    position: Vec<usize>,
    deltas: Vec<i64>,
    groups: Vec<Vec<StageId>>,
    min_offset: i32,
    ramp_width: u32,
}

impl Schedule {
    pub fn slots(&self) -> &[ScheduleSlot] {
        &self.slots
    }

    pub(crate) fn slot_mut(&mut self, position: usize) -> &mut ScheduleSlot {
        &mut self.slots[position]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn offset(&self, stage: StageId) -> i32 {
        self.offsets[stage.index()]
    }

    pub fn lag(&self, stage: StageId) -> u32 {
        (self.offsets[stage.index()] - self.min_offset) as u32
    }

    pub fn position(&self, stage: StageId) -> usize {
        self.position[stage.index()]
    }

    pub fn min_offset(&self) -> i32 {
        self.min_offset
    }

    /// Number of body iterations the pipeline needs to fill (and to drain).
    pub fn ramp_width(&self) -> u32 {
        self.ramp_width
    }

    /// Body-iteration distance of `graph.edges()[edge]`.
    pub fn delta(&self, edge: usize) -> i64 {
        self.deltas[edge]
    }

    pub fn deltas(&self) -> &[i64] {
        &self.deltas
    }

    pub fn groups(&self) -> &[Vec<StageId>] {
        &self.groups
    }

    pub fn order(&self) -> impl Iterator<Item = StageId> + '_ {
        self.slots.iter().map(|s| s.stage)
    }
}

pub fn plan(graph: &DependencyGraph, config: &PipelineConfig, hints: &ScheduleHints) -> Result<Schedule> {
    let bound = offset_bound(graph, config.num_stages);
    let fixed = resolve_offsets(graph, hints, bound)?;
    let offsets = assign_offsets(graph, config.num_stages, &fixed);
    check_spread(graph, &offsets, bound)?;
    let deltas = check_deltas(graph, &offsets)?;
    let groups = resolve_groups(graph, hints)?;

    let order = if hints.order.is_empty() {
        default_order(graph, &deltas, &groups)?
    } else {
        explicit_order(graph, hints, &deltas, &groups)?
    };

    let min_offset = offsets.iter().copied().min().unwrap_or(0);
    let max_offset = offsets.iter().copied().max().unwrap_or(0);
    let mut position = vec![0; offsets.len()];
    let slots = order
        .iter()
        .enumerate()
        .map(|(pos, &stage)| {
            position[stage.index()] = pos;
            ScheduleSlot {
                stage,
                offset: offsets[stage.index()],
                lag: (offsets[stage.index()] - min_offset) as u32,
                waits: vec![],
                arrives: vec![],
            }
        })
        .collect();

    let schedule = Schedule {
        slots,
        offsets,
        position,
        deltas,
        groups,
        min_offset,
        ramp_width: (max_offset - min_offset) as u32,
    };
    debug!(
        order = ?schedule.order().map(|s| graph.name(s)).collect::<Vec<_>>(),
        offsets = ?schedule.slots.iter().map(|s| s.offset).collect::<Vec<_>>(),
        ramp = schedule.ramp_width,
        "schedule planned"
    );
    Ok(schedule)
}

// Largest useful distance between two offsets: every stage one full pipeline apart.
fn offset_bound(graph: &DependencyGraph, num_stages: usize) -> i64 {
    num_stages as i64 * graph.stages().len().max(1) as i64
}

/// Hinted offsets win over declared ones.
fn resolve_offsets(graph: &DependencyGraph, hints: &ScheduleHints, bound: i64) -> Result<Vec<Option<i32>>> {
    let mut fixed: Vec<Option<i32>> = graph.stages().iter().map(|s| s.declared_offset()).collect();
    for (name, offset) in hints.offsets.iter() {
        let id = lookup(graph, name, "offset hint")?;
        fixed[id.index()] = Some(*offset);
    }
    for stage in graph.stages() {
        if let Some(offset) = fixed[stage.id().index()].filter(|o| (*o as i64).abs() > bound) {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "offset {} of stage `{}` is outside -{}..={}",
                offset,
                stage.name(),
                bound,
                bound
            )));
        }
    }
    Ok(fixed)
}

fn check_spread(graph: &DependencyGraph, offsets: &[i32], bound: i64) -> Result<()> {
    let lowest = graph.stages().iter().min_by_key(|s| offsets[s.id().index()]);
    let highest = graph.stages().iter().max_by_key(|s| offsets[s.id().index()]);
    if let (Some(lo), Some(hi)) = (lowest, highest) {
        let spread = offsets[hi.id().index()] as i64 - offsets[lo.id().index()] as i64;
        if spread > bound {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "stages `{}` and `{}` are {} iterations apart, at most {} allowed",
                lo.name(),
                hi.name(),
                spread,
                bound
            )));
        }
    }
    Ok(())
}

// Copies run `num_stages - 1` iterations ahead of their first consumer; everything else
// sits at 0. Free stages are then raised until no incoming edge is negative. Edge weights
// are `-distance <= 0`, so the relaxation has no positive cycle and settles within n rounds.
fn assign_offsets(graph: &DependencyGraph, num_stages: usize, fixed: &[Option<i32>]) -> Vec<i32> {
    let lead = num_stages as i32 - 1;
    let mut offsets: Vec<i32> = fixed.iter().map(|o| o.unwrap_or(0)).collect();
    let mut resolved: Vec<bool> = graph
        .stages()
        .iter()
        .map(|s| fixed[s.id().index()].is_some() || s.lane() != Lane::AsyncCopy)
        .collect();

    for stage in graph.stages() {
        let i = stage.id().index();
        if resolved[i] {
            continue;
        }
        let consumer = graph
            .outgoing(stage.id())
            .filter(|e| e.distance == 0 && e.to != e.from && resolved[e.to.index()])
            .map(|e| e.to)
            .min();
        let mut offset = consumer.map_or(0, |c| offsets[c.index()]) - lead;
        for e in graph
            .incoming(stage.id())
            .filter(|e| e.from != e.to && resolved[e.from.index()])
        {
            offset = offset.max(offsets[e.from.index()] - e.distance as i32);
        }
        trace!(stage = stage.name(), offset, consumer = ?consumer.map(|c| graph.name(c)), "copy offset");
        offsets[i] = offset;
        resolved[i] = true;
    }

    for _ in 0..=offsets.len() {
        let mut changed = false;
        for e in graph.edges() {
            if e.from == e.to || fixed[e.to.index()].is_some() {
                continue;
            }
            let needed = offsets[e.from.index()] - e.distance as i32;
            if offsets[e.to.index()] < needed {
                trace!(stage = graph.name(e.to), from = offsets[e.to.index()], to = needed, "raise offset");
                offsets[e.to.index()] = needed;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    offsets
}

fn check_deltas(graph: &DependencyGraph, offsets: &[i32]) -> Result<Vec<i64>> {
    let mut deltas = Vec::with_capacity(graph.edges().len());
    for e in graph.edges() {
        let (from, to) = (offsets[e.from.index()], offsets[e.to.index()]);
        let delta = e.delta(from, to);
        if delta < 0 {
            return Err(SchedulingError::InvalidHintOrder {
                producer: graph.name(e.from).to_string(),
                consumer: graph.name(e.to).to_string(),
                reason: format!(
                    "offsets {} and {} would run the consumer {} body iteration(s) before the producer ({})",
                    from,
                    to,
                    -delta,
                    graph.describe(e)
                ),
            });
        }
        deltas.push(delta);
    }

    let same_body = graph.edges().iter().zip(deltas.iter()).filter(|(_, d)| **d == 0);
    let succ = super::graph::adjacency(graph.stages().len(), same_body.map(|(e, _)| e));
    if let Some(cycle) = find_cycle(&succ) {
        return Err(SchedulingError::CyclicDependency {
            stages: cycle.into_iter().map(|i| graph.stages()[i].name().to_string()).collect(),
        });
    }
    Ok(deltas)
}

fn resolve_groups(graph: &DependencyGraph, hints: &ScheduleHints) -> Result<Vec<Vec<StageId>>> {
    let mut owner: Vec<Option<usize>> = vec![None; graph.stages().len()];
    let mut groups = vec![];
    for (g, names) in hints.groups.iter().enumerate() {
        if names.is_empty() {
            return Err(SchedulingError::InvalidDeclaration(format!("group {} is empty", g)));
        }
        let mut group = vec![];
        for name in names {
            let id = lookup(graph, name, "group")?;
            if owner[id.index()].replace(g).is_some() {
                return Err(SchedulingError::InvalidDeclaration(format!(
                    "stage `{}` appears in more than one group",
                    name
                )));
            }
            group.push(id);
        }
        groups.push(group);
    }
    Ok(groups)
}

/// Groups contracted to single nodes, topologically ordered with the smallest declaration
/// index first among ready nodes.
fn default_order(graph: &DependencyGraph, deltas: &[i64], groups: &[Vec<StageId>]) -> Result<Vec<StageId>> {
    let n = graph.stages().len();
    let mut node_of = vec![usize::MAX; n];
    let mut members: Vec<Vec<StageId>> = vec![];
    for group in groups {
        for s in group {
            node_of[s.index()] = members.len();
        }
        members.push(group.clone());
    }
    for s in graph.stages() {
        if node_of[s.id().index()] == usize::MAX {
            node_of[s.id().index()] = members.len();
            members.push(vec![s.id()]);
        }
    }

    let same_body: Vec<&Edge> = graph
        .edges()
        .iter()
        .zip(deltas.iter())
        .filter(|(_, d)| **d == 0)
        .map(|(e, _)| e)
        .collect();
    let mut succ: Vec<Vec<usize>> = vec![vec![]; members.len()];
    let mut indegree = vec![0usize; members.len()];
    for e in same_body.iter() {
        let (a, b) = (node_of[e.from.index()], node_of[e.to.index()]);
        if a != b && !succ[a].contains(&b) {
            succ[a].push(b);
            indegree[b] += 1;
        }
    }
    for s in succ.iter_mut() {
        s.sort();
    }

    let key = |node: usize| members[node].iter().map(|s| s.index()).min().unwrap_or(0);
    let mut ready: BinaryHeap<Reverse<(usize, usize)>> = (0..members.len())
        .filter(|v| indegree[*v] == 0)
        .map(|v| Reverse((key(v), v)))
        .collect();
    let mut order = Vec::with_capacity(n);
    let mut emitted = 0;
    while let Some(Reverse((_, v))) = ready.pop() {
        emitted += 1;
        order.extend(sort_members(&members[v], &same_body));
        for &w in succ[v].iter() {
            indegree[w] -= 1;
            if indegree[w] == 0 {
                ready.push(Reverse((key(w), w)));
            }
        }
    }

    if emitted < members.len() {
        let cycle = find_cycle(&succ).unwrap_or_default();
        return Err(SchedulingError::CyclicDependency {
            stages: cycle
                .into_iter()
                .map(|v| {
                    members[v]
                        .iter()
                        .map(|s| graph.name(*s))
                        .collect::<Vec<_>>()
                        .join("+")
                })
                .collect(),
        });
    }
    Ok(order)
}

fn sort_members(members: &[StageId], same_body: &[&Edge]) -> Vec<StageId> {
    let mut remaining: Vec<StageId> = members.to_vec();
    remaining.sort();
    let mut sorted = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let pick = remaining
            .iter()
            .position(|s| {
                !same_body
                    .iter()
                    .any(|e| e.to == *s && e.from != *s && remaining.contains(&e.from))
            })
            .unwrap_or(0);
        sorted.push(remaining.remove(pick));
    }
    sorted
}

fn explicit_order(
    graph: &DependencyGraph,
    hints: &ScheduleHints,
    deltas: &[i64],
    groups: &[Vec<StageId>],
) -> Result<Vec<StageId>> {
    let n = graph.stages().len();
    let mut position = vec![usize::MAX; n];
    let mut order = Vec::with_capacity(n);
    for name in hints.order.iter() {
        let id = lookup(graph, name, "explicit order")?;
        if position[id.index()] != usize::MAX {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "explicit order lists stage `{}` twice",
                name
            )));
        }
        position[id.index()] = order.len();
        order.push(id);
    }
    if order.len() != n {
        let missing: Vec<&str> = graph
            .stages()
            .iter()
            .filter(|s| position[s.id().index()] == usize::MAX)
            .map(|s| s.name())
            .collect();
        return Err(SchedulingError::InvalidDeclaration(format!(
            "explicit order is missing stages: {}",
            missing.join(", ")
        )));
    }

    for group in groups {
        let first = group.iter().map(|s| position[s.index()]).min().unwrap_or(0);
        let last = group.iter().map(|s| position[s.index()]).max().unwrap_or(0);
        if last - first + 1 != group.len() {
            let names: Vec<&str> = group.iter().map(|s| graph.name(*s)).collect();
            return Err(SchedulingError::InvalidDeclaration(format!(
                "group [{}] is not contiguous in the explicit order",
                names.join(", ")
            )));
        }
    }

    for (e, d) in graph.edges().iter().zip(deltas.iter()) {
        if *d == 0 && e.from != e.to && position[e.from.index()] > position[e.to.index()] {
            return Err(SchedulingError::InvalidHintOrder {
                producer: graph.name(e.from).to_string(),
                consumer: graph.name(e.to).to_string(),
                reason: format!(
                    "explicit order puts the consumer first within one body iteration ({})",
                    graph.describe(e)
                ),
            });
        }
    }
    Ok(order)
}

fn lookup(graph: &DependencyGraph, name: &str, what: &str) -> Result<StageId> {
    graph
        .find(name)
        .ok_or_else(|| SchedulingError::InvalidDeclaration(format!("{} names unknown stage `{}`", what, name)))
}
