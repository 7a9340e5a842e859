//! Barrier placement.
//!
//! Barriers follow the mbarrier protocol: every id counts completed phases, an `arrive`
//! after a producer completes one phase once the producer's work has landed, and
//! `wait(id, p)` returns once the completed count `c` satisfies `c % 2 != p`. A fresh id
//! therefore lets `wait(id, 1)` through, which is what consumers of producer iterations
//! before the first one rely on.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Range;

use tracing::{debug, trace};

use super::graph::{DependencyGraph, StageId};
use super::planner::Schedule;
use super::{PipelineConfig, Result, ScheduleHints, SchedulingError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(usize);

impl ClassId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BarrierRef {
    pub id: usize,
    pub parity: u8,
}

/// All barrier-backed edges from `producer` to `consumer` with the same body distance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncClass {
    pub id: ClassId,
    pub producer: StageId,
    pub consumer: StageId,
    pub delta: u32,
    pub distance: u32,
    /// indices into `DependencyGraph::edges`
    pub edges: Vec<usize>,
    pub base: usize,
    pub period: u32,
    /// lag of the producer; instance `j` arrives in body `j + lag`
    pub lag: u32,
    /// classes taking turns on the same ids, this one included
    pub sharers: u32,
    pub rank: u32,
    pub peers: Vec<Turn>,
    pub forced: bool,
}

/// Another class arriving on the same ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Turn {
    pub lag: u32,
    /// arrives earlier within a body than the class holding this turn
    pub before: bool,
}

impl SyncClass {
    /// Barrier id and wait parity for the instance produced in logical iteration `producer_iter`
    /// of a loop running `trip` iterations.
    ///
    /// Ids rotate with the producer's body, so sharers with different lags still meet on the
    /// same id in the same body. The parity is that of the number of arrives issued on the id
    /// before this one: earlier own instances plus every peer instance that ran before it.
    pub fn barrier(&self, producer_iter: i64, trip: u64) -> BarrierRef {
        let period = self.period as i64;
        let body = producer_iter + self.lag as i64;
        let mut phase = producer_iter.div_euclid(period);
        for peer in self.peers.iter() {
            let lag = peer.lag as i64;
            let first = if peer.before { 0 } else { 1 };
            let last = (body - lag).div_euclid(period);
            let past_end = body - (trip as i64 - 1) - lag;
            let first = first.max(past_end.div_euclid(period) + (past_end.rem_euclid(period) != 0) as i64);
            phase += (last - first + 1).max(0);
        }
        BarrierRef {
            id: self.base + body.rem_euclid(period) as usize,
            parity: phase.rem_euclid(2) as u8,
        }
    }

    pub fn ids(&self) -> Range<usize> {
        self.base..self.base + self.period as usize
    }
}

/// A class that needed no barrier of its own.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoveredClass {
    pub producer: StageId,
    pub consumer: StageId,
    pub delta: u32,
    pub distance: u32,
    pub by: ClassId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncPlan {
    classes: Vec<SyncClass>,
    covered: Vec<CoveredClass>,
    num_barriers: usize,
}

impl SyncPlan {
    pub fn classes(&self) -> &[SyncClass] {
        &self.classes
    }

    pub fn class(&self, id: ClassId) -> &SyncClass {
        &self.classes[id.0]
    }

    pub fn covered(&self) -> &[CoveredClass] {
        &self.covered
    }

    pub fn num_barriers(&self) -> usize {
        self.num_barriers
    }

    pub fn find(&self, producer: StageId, consumer: StageId) -> Option<&SyncClass> {
        self.classes
            .iter()
            .find(|c| c.producer == producer && c.consumer == consumer)
    }
}

struct Candidate {
    producer: StageId,
    consumer: StageId,
    delta: u32,
    distance: u32,
    edges: Vec<usize>,
    forced: bool,
}

pub fn insert(
    schedule: &mut Schedule,
    graph: &DependencyGraph,
    config: &PipelineConfig,
    hints: &ScheduleHints,
) -> Result<SyncPlan> {
    let forced = resolve_sync_hints(graph, hints)?;

    let mut candidates: BTreeMap<(StageId, StageId, u32), Candidate> = BTreeMap::new();
    for (i, e) in graph.edges().iter().enumerate() {
        let is_forced = forced.contains(&(e.from, e.to));
        if !is_forced && !graph.needs_barrier(e) {
            continue;
        }
        let delta = u32::try_from(schedule.delta(i)).map_err(|_| {
            SchedulingError::InvalidDeclaration(format!("edge {} spans {} iterations", graph.describe(e), schedule.delta(i)))
        })?;
        trace!(edge = %graph.describe(e), delta, forced = is_forced, "barrier-backed edge");
        let c = candidates
            .entry((e.from, e.to, delta))
            .or_insert_with(|| Candidate {
                producer: e.from,
                consumer: e.to,
                delta,
                distance: e.distance,
                edges: vec![],
                forced: false,
            });
        c.edges.push(i);
        c.forced |= is_forced;
    }

    let (mut kept, covered) = eliminate_covered(schedule, candidates.into_values().collect());
    kept.sort_by_key(|c| (schedule.position(c.producer), schedule.position(c.consumer), c.delta));
    let mut classes: Vec<SyncClass> = kept
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let (pp, pc) = (schedule.position(c.producer), schedule.position(c.consumer));
            let arrive_window = if c.delta >= 1 && pc < pp { c.delta } else { c.delta + 1 };
            SyncClass {
                id: ClassId(i),
                producer: c.producer,
                consumer: c.consumer,
                delta: c.delta,
                distance: c.distance,
                edges: c.edges,
                base: 0,
                period: arrive_window.max(c.distance).max(1),
                lag: schedule.lag(c.producer),
                sharers: 1,
                rank: 0,
                peers: vec![],
                forced: c.forced,
            }
        })
        .collect();
    let covered = covered
        .into_iter()
        .filter_map(|(c, (p, w, d))| {
            let by = classes
                .iter()
                .find(|k| k.producer == p && k.consumer == w && k.delta == d)?;
            Some(CoveredClass {
                producer: c.producer,
                consumer: c.consumer,
                delta: c.delta,
                distance: c.distance,
                by: by.id,
            })
        })
        .collect::<Vec<_>>();

    let num_barriers = allocate(&mut classes, schedule);
    if num_barriers > config.max_barriers {
        return Err(SchedulingError::BarrierBudgetExceeded {
            budget: config.max_barriers,
            required: num_barriers,
            classes: classes
                .iter()
                .map(|c| {
                    format!(
                        "{} -> {} (delta {}, {} id{})",
                        graph.name(c.producer),
                        graph.name(c.consumer),
                        c.delta,
                        c.period,
                        if c.period == 1 { "" } else { "s" }
                    )
                })
                .collect(),
        });
    }

    for pos in 0..schedule.len() {
        let slot = schedule.slot_mut(pos);
        slot.waits.clear();
        slot.arrives.clear();
    }
    for c in classes.iter() {
        schedule.slot_mut(schedule.position(c.consumer)).waits.push(c.id);
        schedule.slot_mut(schedule.position(c.producer)).arrives.push(c.id);
    }
    for pos in 0..schedule.len() {
        let slot = schedule.slot_mut(pos);
        slot.waits.sort();
        slot.arrives.sort();
    }

    for c in classes.iter() {
        debug!(
            class = %c.id,
            producer = graph.name(c.producer),
            consumer = graph.name(c.consumer),
            delta = c.delta,
            ids = ?c.ids(),
            sharers = c.sharers,
            "sync class"
        );
    }
    debug!(
        classes = classes.len(),
        covered = covered.len(),
        barriers = num_barriers,
        "synchronization inserted"
    );
    Ok(SyncPlan {
        classes,
        covered,
        num_barriers,
    })
}

fn resolve_sync_hints(graph: &DependencyGraph, hints: &ScheduleHints) -> Result<BTreeSet<(StageId, StageId)>> {
    let mut forced = BTreeSet::new();
    for hint in hints.sync.iter() {
        let find = |name: &str| {
            graph.find(name).ok_or_else(|| {
                SchedulingError::InvalidDeclaration(format!("sync hint names unknown stage `{}`", name))
            })
        };
        let (p, c) = (find(&hint.producer)?, find(&hint.consumer)?);
        if !graph.outgoing(p).any(|e| e.to == c) {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "sync hint `{}` -> `{}` does not match any dependency",
                hint.producer, hint.consumer
            )));
        }
        forced.insert((p, c));
    }
    Ok(forced)
}

type ClassKey = (StageId, StageId, u32);

// Walks classes in the order their waits appear relative to the producer's body. A wait
// for producer instance `j` that is already preceded by a kept wait on the same instance,
// present in every body where this one is, adds nothing.
fn eliminate_covered(schedule: &Schedule, mut pending: Vec<Candidate>) -> (Vec<Candidate>, Vec<(Candidate, ClassKey)>) {
    pending.sort_by_key(|c| {
        (
            c.delta,
            schedule.position(c.consumer),
            schedule.position(c.producer),
        )
    });
    let mut kept: Vec<Candidate> = vec![];
    let mut covered = vec![];
    for c in pending {
        let wait_at = (c.delta, schedule.position(c.consumer));
        let by = kept.iter().find(|k| {
            k.producer == c.producer
                && k.distance <= c.distance
                && (k.delta, schedule.position(k.consumer)) < wait_at
        });
        match by {
            Some(k) if !c.forced => {
                let key = (k.producer, k.consumer, k.delta);
                trace!(producer = c.producer.index(), consumer = c.consumer.index(), "class covered");
                covered.push((c, key));
            }
            _ => kept.push(c),
        }
    }
    (kept, covered)
}

/// Hands out barrier ids; returns how many were used.
///
/// A class holds an id from its arrive in body `b` to its wait in body `b + delta`. With a
/// period of `P` the same id comes around every `P` bodies, so on a circle of `P` bodies
/// each class occupies one arc. Same-iteration classes (`distance == 0`) with equal periods
/// whose arcs are disjoint take turns on the same ids, coloured greedily by arc start.
/// Loop-carried classes keep dedicated ids: their waits on iterations before the loop rely
/// on nobody else having arrived yet.
fn allocate(classes: &mut [SyncClass], schedule: &Schedule) -> usize {
    // three points per slot: waits, exec, arrives
    let body = 3 * schedule.len() as u64;
    let arcs: Vec<(u64, u64)> = classes
        .iter()
        .map(|c| {
            let start = 3 * schedule.position(c.producer) as u64 + 2;
            let end = c.delta as u64 * body + 3 * schedule.position(c.consumer) as u64;
            (start, end)
        })
        .collect();

    let mut order: Vec<usize> = (0..classes.len()).collect();
    order.sort_by_key(|i| (arcs[*i].0, classes[*i].id));
    let mut colours: Vec<Vec<usize>> = vec![];
    let mut colour_of: Vec<usize> = vec![0; classes.len()];
    for i in order {
        let c = &classes[i];
        let circle = body * c.period as u64;
        let shared = (c.distance == 0).then(|| {
            colours.iter().position(|members| {
                let first = &classes[members[0]];
                first.distance == 0
                    && first.period == c.period
                    && members.iter().all(|m| arcs_disjoint(arcs[*m], arcs[i], circle))
            })
        });
        let colour = match shared.flatten() {
            Some(k) => k,
            None => {
                colours.push(vec![]);
                colours.len() - 1
            }
        };
        colours[colour].push(i);
        colour_of[i] = colour;
    }

    for members in colours.iter() {
        for (rank, i) in members.iter().enumerate() {
            let peers = members
                .iter()
                .filter(|m| *m != i)
                .map(|m| Turn {
                    lag: classes[*m].lag,
                    before: arcs[*m].0 < arcs[*i].0,
                })
                .collect();
            let c = &mut classes[*i];
            c.sharers = members.len() as u32;
            c.rank = rank as u32;
            c.peers = peers;
        }
    }

    let mut next = 0;
    let mut colour_base: Vec<Option<usize>> = vec![None; colours.len()];
    for i in 0..classes.len() {
        let period = classes[i].period as usize;
        let base = *colour_base[colour_of[i]].get_or_insert_with(|| {
            next += period;
            next - period
        });
        classes[i].base = base;
    }
    next
}

// Arcs `[start, end]` on a circle of length `circle`, both starting within the first body.
fn arcs_disjoint(a: (u64, u64), b: (u64, u64), circle: u64) -> bool {
    let (first, second) = if a.0 <= b.0 { (a, b) } else { (b, a) };
    first.1 - first.0 < circle
        && second.1 - second.0 < circle
        && first.1 < second.0
        && second.1 < first.0 + circle
}
