//! Replays an instruction stream under the lane and barrier model and checks that it
//! computes what the sequential loop computes.
//!
//! Every lane retires its own work in issue order, synchronous work retires at issue.
//! The only way to learn that asynchronous work on another lane retired is a barrier wait
//! or a lane fence. Each stage issues its iterations in increasing order, so for every
//! conflicting earlier stage only the latest conflicting instance has to be checked: the
//! ones before it sit earlier on the same lane.

use nohash_hasher::IntMap;
use tracing::{debug, trace};

use super::graph::{DependencyGraph, StageId};
use super::ramp::{PipelinedLoop, Step};
use super::sync::SyncClass;
use super::{Result, SchedulingError};
use crate::lang::Lane;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub trip_count: u64,
    pub executions: usize,
    pub waits: usize,
    pub arrives: usize,
    pub fences: usize,
    pub barriers_used: usize,
}

#[derive(Default)]
struct Barrier {
    /// instance certified by each arrive, in arrive order
    phases: Vec<(StageId, i64)>,
    /// phases known to have completed
    known: usize,
}

#[derive(Clone, Copy, Default)]
struct Conflict {
    persistent: bool,
    rotating: bool,
    order: bool,
}

struct Machine<'a> {
    graph: &'a DependencyGraph,
    trip: i64,
    conflicts: Vec<Vec<Conflict>>,
    issued: Vec<Vec<usize>>,
    lane_issued: [usize; 3],
    lane_done: [usize; 3],
    barriers: IntMap<usize, Barrier>,
    last_exec: Option<(StageId, i64)>,
}

fn lane_slot(lane: Lane) -> usize {
    match lane {
        Lane::Sync => 0,
        Lane::AsyncCopy => 1,
        Lane::AsyncMma => 2,
    }
}

impl<'a> Machine<'a> {
    fn new(graph: &'a DependencyGraph, trip: i64) -> Self {
        let n = graph.stages().len();
        let mut conflicts = vec![vec![Conflict::default(); n]; n];
        for a in graph.stages() {
            for b in graph.stages() {
                let c = &mut conflicts[a.id().index()][b.id().index()];
                for (ra, wa) in a.accesses() {
                    for (rb, wb) in b.accesses() {
                        if !(wa || wb) || !ra.overlaps(rb) {
                            continue;
                        }
                        match graph.buffers().get(ra.buffer) {
                            Some(buf) if buf.is_rotating() => c.rotating = true,
                            Some(_) => c.persistent = true,
                            None => {}
                        }
                    }
                }
                c.order = b.after().contains(&a.id());
            }
        }
        Machine {
            graph,
            trip,
            conflicts,
            issued: vec![vec![]; n],
            lane_issued: [0; 3],
            lane_done: [0; 3],
            barriers: IntMap::default(),
            last_exec: None,
        }
    }

    fn name(&self, stage: StageId) -> &str {
        self.graph.name(stage)
    }

    fn complete(&self, stage: StageId, iteration: i64) -> bool {
        let lane = self.graph.stage(stage).lane();
        !lane.is_async() || self.issued[stage.index()][iteration as usize] < self.lane_done[lane_slot(lane)]
    }

    fn retire(&mut self, stage: StageId, iteration: i64) {
        let lane = lane_slot(self.graph.stage(stage).lane());
        let position = self.issued[stage.index()][iteration as usize];
        self.lane_done[lane] = self.lane_done[lane].max(position + 1);
    }

    fn exec(&mut self, stage: StageId, j: i64) -> std::result::Result<(), String> {
        let s = stage.index();
        if j < 0 || j >= self.trip {
            return Err(format!("`{}` runs iteration {} outside 0..{}", self.name(stage), j, self.trip));
        }
        if j as usize != self.issued[s].len() {
            return Err(format!(
                "`{}` runs iteration {} but {} iteration(s) were issued before",
                self.name(stage),
                j,
                self.issued[s].len()
            ));
        }

        let depth = self.graph.num_stages() as i64;
        let lane = self.graph.stage(stage).lane();
        for other in self.graph.stages() {
            let o = other.id().index();
            let c = self.conflicts[o][s];
            let before = o < s;
            let mut latest: Option<i64> = None;
            if c.persistent {
                latest = latest.max(Some(if before { j } else { j - 1 }));
            }
            if c.rotating {
                latest = latest.max(Some(if before { j } else { j - depth }));
            }
            if c.order {
                latest = latest.max(Some(j));
            }
            let Some(needed) = latest.filter(|v| *v >= 0) else {
                continue;
            };
            if (self.issued[o].len() as i64) <= needed {
                return Err(format!(
                    "`{}`[{}] issued before `{}`[{}] it depends on",
                    self.name(stage),
                    j,
                    other.name(),
                    needed
                ));
            }
            if other.lane() != lane && !self.complete(other.id(), needed) {
                return Err(format!(
                    "`{}`[{}] may run while `{}`[{}] on {} is still in flight",
                    self.name(stage),
                    j,
                    other.name(),
                    needed,
                    other.lane()
                ));
            }
        }

        let slot = lane_slot(lane);
        self.issued[s].push(self.lane_issued[slot]);
        self.lane_issued[slot] += 1;
        if !lane.is_async() {
            self.lane_done[slot] = self.lane_issued[slot];
        }
        self.last_exec = Some((stage, j));
        Ok(())
    }

    fn arrive(&mut self, id: usize, class: &SyncClass, producer_iter: i64) -> std::result::Result<(), String> {
        if self.last_exec != Some((class.producer, producer_iter)) {
            return Err(format!(
                "arrive on barrier {} for `{}`[{}] does not follow that instance",
                id,
                self.name(class.producer),
                producer_iter
            ));
        }
        self.barriers.entry(id).or_default().phases.push((class.producer, producer_iter));
        Ok(())
    }

    fn wait(&mut self, id: usize, parity: u8) -> std::result::Result<(), String> {
        let barrier = self.barriers.entry(id).or_default();
        let (known, issued) = (barrier.known, barrier.phases.len());
        let mut passes_at = known;
        if passes_at % 2 == parity as usize {
            passes_at += 1;
        }
        if passes_at > issued {
            return Err(format!(
                "wait on barrier {} parity {} can never pass ({} arrive(s) issued)",
                id, parity, issued
            ));
        }
        if passes_at < issued {
            return Err(format!(
                "wait on barrier {} parity {} is ambiguous: it may pass after phase {} of {}",
                id, parity, passes_at, issued
            ));
        }
        let retired: Vec<(StageId, i64)> = barrier.phases[known..issued].to_vec();
        barrier.known = issued;
        for (stage, j) in retired {
            self.retire(stage, j);
        }
        self.last_exec = None;
        Ok(())
    }

    fn fence(&mut self, lane: Lane) {
        let slot = lane_slot(lane);
        self.lane_done[slot] = self.lane_issued[slot];
        self.last_exec = None;
    }

    fn finish(&self) -> std::result::Result<(), String> {
        for stage in self.graph.stages() {
            let count = self.issued[stage.id().index()].len() as i64;
            if count != self.trip {
                return Err(format!(
                    "`{}` ran {} of {} iterations",
                    stage.name(),
                    count,
                    self.trip
                ));
            }
            let live_out = stage
                .writes()
                .iter()
                .any(|r| self.graph.live_out().contains(&r.buffer));
            if live_out && self.trip > 0 && !self.complete(stage.id(), self.trip - 1) {
                return Err(format!(
                    "live-out writes of `{}` on {} are still in flight at loop exit",
                    stage.name(),
                    stage.lane()
                ));
            }
        }
        Ok(())
    }
}

/// Checks a flattened loop against the sequential semantics of `graph`.
pub fn verify(steps: &[Step], trip: u64, graph: &DependencyGraph, classes: &[SyncClass]) -> Result<Report> {
    let mut machine = Machine::new(graph, trip as i64);
    let mut report = Report {
        trip_count: trip,
        ..Default::default()
    };
    let known = |stage: StageId| stage.index() < graph.stages().len();
    for (pos, step) in steps.iter().enumerate() {
        trace!(pos, step = ?step, "replay");
        let checked = match *step {
            Step::Exec { stage, iteration } => {
                report.executions += 1;
                if known(stage) {
                    machine.exec(stage, iteration)
                } else {
                    Err(format!("exec of unknown stage {:?}", stage))
                }
            }
            Step::Arrive { id, class, producer_iter } => {
                report.arrives += 1;
                match classes.get(class.index()) {
                    Some(c) if known(c.producer) => machine.arrive(id, c, producer_iter),
                    Some(c) => Err(format!("class {} is produced by unknown stage {:?}", class, c.producer)),
                    None => Err(format!("arrive references unknown class {}", class)),
                }
            }
            Step::Wait { id, parity, .. } => {
                report.waits += 1;
                machine.wait(id, parity)
            }
            Step::Fence(lane) => {
                report.fences += 1;
                machine.fence(lane);
                Ok(())
            }
        };
        checked.map_err(|e| SchedulingError::Verification(format!("step {}: {}", pos, e)))?;
    }
    machine
        .finish()
        .map_err(|e| SchedulingError::Verification(format!("trip count {}: {}", trip, e)))?;
    report.barriers_used = machine.barriers.len();
    Ok(report)
}

/// Instantiates and verifies `program` for every supported trip count up to `2R + 2`.
/// A constant trip count beyond that is checked on a loop of the same shape whose steady
/// body repeats just often enough to cycle every barrier id through both parities.
/// Returns how many trip counts were checked.
pub fn check_trip_counts(program: &PipelinedLoop, graph: &DependencyGraph) -> Result<usize> {
    let limit = 2 * program.ramp_width() as u64 + 2;
    let mut trips: Vec<u64> = (0..=limit).filter(|t| program.supports(*t)).collect();
    for trip in trips.iter() {
        let stream = program.instantiate(*trip)?;
        let report = verify(stream.steps(), *trip, graph, program.classes())?;
        trace!(trip, steps = stream.len(), waits = report.waits, "trip count verified");
    }

    if let Some(t) = program.trip_count().as_const().filter(|t| *t > limit) {
        let period = program.classes().iter().map(|c| c.period as u64).max().unwrap_or(1);
        let representative = limit + 2 * period;
        let stream = if t <= representative {
            program.instantiate(t)?
        } else {
            program.replay_main(representative)?
        };
        let replayed = stream.trip_count();
        verify(stream.steps(), replayed, graph, program.classes())?;
        trace!(trip = t, replayed, "constant trip count verified");
        trips.push(t);
    }
    debug!(trip_counts = ?trips, "generated loop verified");
    Ok(trips.len())
}
