use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use super::graph::{DependencyGraph, StageId};
use super::planner::{Schedule, ScheduleSlot};
use super::sync::{ClassId, SyncClass, SyncPlan};
use super::{Result, SchedulingError};
use crate::lang::{Bindings, Expr, Lane};

/// A logical iteration as seen from emitted code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IterExpr {
    /// a constant
    Start(i64),
    /// `k + c` where `k` is the steady loop variable
    Loop(i64),
    /// `T + c` where `T` is the trip count
    End(i64),
}

impl IterExpr {
    pub fn eval(&self, k: u64, trip: u64) -> i64 {
        match *self {
            IterExpr::Start(c) => c,
            IterExpr::Loop(c) => k as i64 + c,
            IterExpr::End(c) => trip as i64 + c,
        }
    }

    pub fn shift(&self, by: i64) -> IterExpr {
        match *self {
            IterExpr::Start(c) => IterExpr::Start(c + by),
            IterExpr::Loop(c) => IterExpr::Loop(c + by),
            IterExpr::End(c) => IterExpr::End(c + by),
        }
    }

    fn known(&self, trip: Option<i64>) -> Option<i64> {
        match *self {
            IterExpr::Start(c) => Some(c),
            IterExpr::Loop(_) => None,
            IterExpr::End(c) => trip.map(|t| t + c),
        }
    }

    fn provably_negative(&self, trip: Option<i64>) -> bool {
        self.known(trip).map_or(false, |v| v < 0)
    }

    fn provably_past_end(&self, trip: Option<i64>) -> bool {
        match (*self, trip) {
            (IterExpr::End(c), _) => c >= 0,
            (e, Some(t)) => e.known(Some(t)).map_or(false, |v| v >= t),
            _ => false,
        }
    }
}

impl fmt::Display for IterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (var, c) = match *self {
            IterExpr::Start(c) => return write!(f, "{}", c),
            IterExpr::Loop(c) => ("k", c),
            IterExpr::End(c) => ("T", c),
        };
        match c {
            0 => write!(f, "{}", var),
            c if c > 0 => write!(f, "{} + {}", var, c),
            c => write!(f, "{} - {}", var, -c),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Ramp(u32),
    Steady,
    Drain(u32),
    /// lane fences after the last body
    Exit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Ramp(i) => write!(f, "ramp[{}]", i),
            Phase::Steady => write!(f, "steady"),
            Phase::Drain(i) => write!(f, "drain[{}]", i),
            Phase::Exit => write!(f, "exit"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Instr {
    Wait { class: ClassId, producer_iter: IterExpr },
    Exec { stage: StageId, iter: IterExpr },
    Arrive { class: ClassId, producer_iter: IterExpr },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Body {
    pub phase: Phase,
    pub instrs: Vec<Instr>,
}

impl Body {
    pub fn stages(&self) -> impl Iterator<Item = (StageId, IterExpr)> + '_ {
        self.instrs.iter().filter_map(|i| match i {
            Instr::Exec { stage, iter } => Some((*stage, *iter)),
            _ => None,
        })
    }

    pub fn num_execs(&self) -> usize {
        self.stages().count()
    }
}

/// Prologue, steady loop over `k in 0..T - R` and epilogue, valid for `T > R`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MainLoop {
    pub prologue: Vec<Body>,
    pub steady: Body,
    pub epilogue: Vec<Body>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelinedLoop {
    trip_count: Expr,
    ramp: u32,
    main: Option<MainLoop>,
    variants: Vec<(u64, Vec<Body>)>,
    fences: Vec<Lane>,
    classes: Vec<SyncClass>,
}

impl PipelinedLoop {
    pub fn trip_count(&self) -> &Expr {
        &self.trip_count
    }

    pub fn ramp_width(&self) -> u32 {
        self.ramp
    }

    pub fn main(&self) -> Option<&MainLoop> {
        self.main.as_ref()
    }

    /// Fully unrolled loops for trip counts too short to reach the steady loop.
    pub fn variants(&self) -> &[(u64, Vec<Body>)] {
        &self.variants
    }

    pub fn variant(&self, trip: u64) -> Option<&[Body]> {
        self.variants
            .iter()
            .find(|(t, _)| *t == trip)
            .map(|(_, bodies)| bodies.as_slice())
    }

    pub fn fences(&self) -> &[Lane] {
        &self.fences
    }

    pub fn classes(&self) -> &[SyncClass] {
        &self.classes
    }

    /// Shorter loops are unrolled, so the main shape always runs at least one steady body
    /// and no drain body waits on an iteration before the loop.
    pub fn min_main_trip(&self) -> u64 {
        self.ramp as u64 + 1
    }

    /// A loop with a constant trip count is generated for that count only.
    pub fn supports(&self, trip: u64) -> bool {
        match self.trip_count.as_const() {
            Some(t) => trip == 0 || trip == t,
            None => {
                trip == 0
                    || (self.main.is_some() && trip >= self.min_main_trip())
                    || self.variant(trip).is_some()
            }
        }
    }

    pub fn instantiate_with(&self, bindings: &Bindings) -> Result<InstructionStream> {
        self.instantiate(self.trip_count.eval(bindings)?)
    }

    /// Expands the loop for a concrete trip count.
    pub fn instantiate(&self, trip: u64) -> Result<InstructionStream> {
        if trip > i64::MAX as u64 {
            return Err(SchedulingError::InvalidDeclaration(format!("trip count {} is too large", trip)));
        }
        if !self.supports(trip) {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "no code generated for trip count {} (loop trip count is {})",
                trip, self.trip_count
            )));
        }
        self.unroll(trip)
    }

    /// Runs the main shape with `trip` iterations regardless of the loop's own trip count.
    /// A constant-trip loop differs from this only in how often the steady body repeats,
    /// as long as `trip` is long enough that no boundary body changes.
    pub(crate) fn replay_main(&self, trip: u64) -> Result<InstructionStream> {
        if self.main.is_none() || trip < self.min_main_trip() || trip > i64::MAX as u64 {
            return Err(SchedulingError::InvalidDeclaration(format!(
                "main loop cannot run {} iteration(s)",
                trip
            )));
        }
        self.unroll(trip)
    }

    fn unroll(&self, trip: u64) -> Result<InstructionStream> {
        let mut stream = InstructionStream {
            trip_count: trip,
            steps: vec![],
            phases: vec![],
        };
        if trip == 0 {
            return Ok(stream);
        }

        match &self.main {
            Some(main) if trip >= self.min_main_trip() => {
                for body in main.prologue.iter() {
                    self.expand(body, 0, trip, &mut stream);
                }
                for k in 0..trip - self.ramp as u64 {
                    self.expand(&main.steady, k, trip, &mut stream);
                }
                for body in main.epilogue.iter() {
                    self.expand(body, 0, trip, &mut stream);
                }
            }
            _ => {
                let bodies = self.variant(trip).ok_or_else(|| {
                    SchedulingError::InvalidDeclaration(format!("missing unrolled loop for trip count {}", trip))
                })?;
                for body in bodies {
                    self.expand(body, 0, trip, &mut stream);
                }
            }
        }
        for lane in self.fences.iter() {
            stream.steps.push(Step::Fence(*lane));
            stream.phases.push(Phase::Exit);
        }
        Ok(stream)
    }

    fn expand(&self, body: &Body, k: u64, trip: u64, stream: &mut InstructionStream) {
        for instr in body.instrs.iter() {
            let step = match *instr {
                Instr::Wait { class, producer_iter } => {
                    let j = producer_iter.eval(k, trip);
                    let barrier = self.classes[class.index()].barrier(j, trip);
                    Step::Wait {
                        id: barrier.id,
                        parity: barrier.parity,
                        class,
                        producer_iter: j,
                    }
                }
                Instr::Exec { stage, iter } => Step::Exec {
                    stage,
                    iteration: iter.eval(k, trip),
                },
                Instr::Arrive { class, producer_iter } => {
                    let j = producer_iter.eval(k, trip);
                    Step::Arrive {
                        id: self.classes[class.index()].barrier(j, trip).id,
                        class,
                        producer_iter: j,
                    }
                }
            };
            stream.steps.push(step);
            stream.phases.push(body.phase);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Wait {
        id: usize,
        parity: u8,
        class: ClassId,
        producer_iter: i64,
    },
    Exec {
        stage: StageId,
        iteration: i64,
    },
    Arrive {
        id: usize,
        class: ClassId,
        producer_iter: i64,
    },
    Fence(Lane),
}

/// A pipelined loop flattened for one trip count, in issue order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstructionStream {
    trip_count: u64,
    steps: Vec<Step>,
    phases: Vec<Phase>,
}

impl InstructionStream {
    pub fn trip_count(&self) -> u64 {
        self.trip_count
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn phase_of(&self, position: usize) -> Option<Phase> {
        self.phases.get(position).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Phase, &Step)> {
        self.phases.iter().copied().zip(self.steps.iter())
    }

    pub fn executions(&self) -> impl Iterator<Item = (StageId, i64)> + '_ {
        self.steps.iter().filter_map(|s| match s {
            Step::Exec { stage, iteration } => Some((*stage, *iteration)),
            _ => None,
        })
    }
}

pub fn generate(schedule: &Schedule, sync: &SyncPlan, graph: &DependencyGraph, trip_count: &Expr) -> Result<PipelinedLoop> {
    let trip_count = trip_count.fold();
    let constant = trip_count.as_const();
    if let Some(t) = constant {
        if t > i64::MAX as u64 {
            return Err(SchedulingError::InvalidDeclaration(format!("trip count {} is too large", t)));
        }
    }
    let ramp = schedule.ramp_width();
    let min_main = ramp as u64 + 1;
    let known = constant.map(|t| t as i64);
    let emit = Emitter { schedule, sync };

    let main = match constant {
        Some(t) if t < min_main => None,
        _ => {
            let r = ramp as i64;
            let prologue = (0..ramp)
                .map(|b| {
                    emit.body(Phase::Ramp(b), known, |lag| {
                        (lag <= b).then(|| IterExpr::Start(b as i64 - lag as i64))
                    })
                })
                .collect();
            let steady = emit.body(Phase::Steady, known, |lag| Some(IterExpr::Loop(r - lag as i64)));
            let epilogue = (0..ramp)
                .map(|t| {
                    emit.body(Phase::Drain(t), known, |lag| {
                        (lag > t).then(|| IterExpr::End(t as i64 - lag as i64))
                    })
                })
                .collect();
            Some(MainLoop {
                prologue,
                steady,
                epilogue,
            })
        }
    };

    let short: Vec<u64> = match constant {
        Some(t) if t < min_main => vec![t],
        Some(_) => vec![],
        None => (0..min_main).collect(),
    };
    let variants = short
        .into_iter()
        .map(|t| {
            let bodies = (0..t + ramp as u64)
                .map(|b| {
                    let phase = if b < t { Phase::Ramp(b as u32) } else { Phase::Drain((b - t) as u32) };
                    emit.body(phase, Some(t as i64), |lag| {
                        let j = b as i64 - lag as i64;
                        (0..t as i64).contains(&j).then_some(IterExpr::Start(j))
                    })
                })
                .filter(|body| body.num_execs() > 0)
                .collect();
            (t, bodies)
        })
        .collect::<Vec<_>>();

    let fences: BTreeSet<Lane> = graph
        .stages()
        .iter()
        .filter(|s| s.lane().is_async())
        .filter(|s| s.writes().iter().any(|r| graph.live_out().contains(&r.buffer)))
        .map(|s| s.lane())
        .collect();

    debug!(
        trip_count = %trip_count,
        ramp,
        main = main.is_some(),
        variants = variants.len(),
        fences = ?fences,
        "loop generated"
    );
    Ok(PipelinedLoop {
        trip_count,
        ramp,
        main,
        variants,
        fences: fences.into_iter().collect(),
        classes: sync.classes().to_vec(),
    })
}

struct Emitter<'a> {
    schedule: &'a Schedule,
    sync: &'a SyncPlan,
}

impl<'a> Emitter<'a> {
    /// One body iteration: every slot whose lag maps to a live iteration, with its waits in
    /// front and its arrives behind. Waits on producers provably before the loop and arrives
    /// for consumers provably past its end are left out.
    fn body(&self, phase: Phase, trip: Option<i64>, iteration: impl Fn(u32) -> Option<IterExpr>) -> Body {
        let mut instrs = vec![];
        for slot in self.schedule.slots() {
            let Some(iter) = iteration(slot.lag) else {
                continue;
            };
            self.slot(slot, iter, trip, &mut instrs);
        }
        Body { phase, instrs }
    }

    fn slot(&self, slot: &ScheduleSlot, iter: IterExpr, trip: Option<i64>, instrs: &mut Vec<Instr>) {
        for class in slot.waits.iter() {
            let producer_iter = iter.shift(-(self.sync.class(*class).distance as i64));
            if !producer_iter.provably_negative(trip) {
                instrs.push(Instr::Wait {
                    class: *class,
                    producer_iter,
                });
            }
        }
        instrs.push(Instr::Exec {
            stage: slot.stage,
            iter,
        });
        for class in slot.arrives.iter() {
            let consumer_iter = iter.shift(self.sync.class(*class).distance as i64);
            if !consumer_iter.provably_past_end(trip) {
                instrs.push(Instr::Arrive {
                    class: *class,
                    producer_iter: iter,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::{attention_pipeline, AttentionShape, BufferRegistry, LoopBody, StageDecl};
    use crate::pipeline::{planner, sync, PipelineConfig, ScheduleHints};

    fn lower(body: &LoopBody, depth: usize) -> (DependencyGraph, PipelinedLoop) {
        let config = PipelineConfig::new(depth);
        let hints = ScheduleHints::new();
        let graph = DependencyGraph::build(body, depth).unwrap();
        let mut schedule = planner::plan(&graph, &config, &hints).unwrap();
        let plan = sync::insert(&mut schedule, &graph, &config, &hints).unwrap();
        let program = generate(&schedule, &plan, &graph, body.trip_count()).unwrap();
        (graph, program)
    }

    fn copy_compute(trip: impl Into<Expr>) -> LoopBody {
        let mut reg = BufferRegistry::new();
        let k = reg.rotating("k", 8);
        let out = reg.persistent("out", 8);
        let mut body = LoopBody::new(reg.clone(), trip);
        body.push(StageDecl::new("load", Lane::AsyncCopy).writes(reg.full(k)));
        body.push(StageDecl::new("compute", Lane::Sync).reads(reg.full(k)).updates(reg.full(out)));
        body
    }

    #[test]
    fn iter_expr() {
        assert_eq!(IterExpr::Loop(1).eval(4, 9), 5);
        assert_eq!(IterExpr::End(-2).eval(4, 9), 7);
        assert_eq!(IterExpr::Start(3).shift(-4), IterExpr::Start(-1));
        assert_eq!(IterExpr::Loop(-1).to_string(), "k - 1");
        assert_eq!(IterExpr::End(0).to_string(), "T");
        assert_eq!(IterExpr::Start(2).to_string(), "2");
        assert!(IterExpr::End(0).provably_past_end(None));
        assert!(!IterExpr::Loop(5).provably_past_end(Some(3)));
        assert!(IterExpr::Start(3).provably_past_end(Some(3)));
        assert!(IterExpr::End(-4).provably_negative(Some(3)));
    }

    #[test]
    fn constant_trip_count_generates_one_shape() {
        let (graph, program) = lower(&copy_compute(8u64), 2);
        let main = program.main().unwrap();
        assert!(program.variants().is_empty());
        assert_eq!(main.prologue.len(), 1);
        assert_eq!(main.epilogue.len(), 1);
        assert_eq!(main.steady.num_execs(), 2);
        assert_eq!(
            main.prologue[0].stages().collect::<Vec<_>>(),
            vec![(graph.find("load").unwrap(), IterExpr::Start(0))]
        );
        assert_eq!(
            main.epilogue[0].stages().collect::<Vec<_>>(),
            vec![(graph.find("compute").unwrap(), IterExpr::End(-1))]
        );

        let short = lower(&copy_compute(0u64), 2).1;
        assert!(short.main().is_none());
        assert_eq!(short.variants().len(), 1);
        assert!(short.instantiate(0).unwrap().is_empty());
        assert!(short.instantiate(3).is_err());
        assert!(!program.supports(7) && program.supports(8));
        assert!(program.instantiate(7).is_err());
    }

    #[test]
    fn steady_body_barriers() {
        let (graph, program) = lower(&copy_compute(8u64), 2);
        let steady = &program.main().unwrap().steady;
        let class = program.classes()[0].id;
        assert_eq!(
            steady.instrs,
            vec![
                Instr::Exec { stage: graph.find("load").unwrap(), iter: IterExpr::Loop(1) },
                Instr::Arrive { class, producer_iter: IterExpr::Loop(1) },
                Instr::Wait { class, producer_iter: IterExpr::Loop(0) },
                Instr::Exec { stage: graph.find("compute").unwrap(), iter: IterExpr::Loop(0) },
            ]
        );
        // sync lanes never need a fence
        assert!(program.fences().is_empty());
    }

    #[test]
    fn runtime_trip_count_gets_short_variants() {
        let body = attention_pipeline(AttentionShape::default());
        let (graph, program) = lower(&body, 3);
        assert_eq!(program.ramp_width(), 2);
        assert_eq!(program.variants().iter().map(|v| v.0).collect::<Vec<_>>(), vec![0, 1, 2]);
        let one = program.variant(1).unwrap();
        assert_eq!(
            one.iter().map(|b| b.phase).collect::<Vec<_>>(),
            vec![Phase::Ramp(0), Phase::Drain(1)]
        );
        let stream = program.instantiate(1).unwrap();
        assert_eq!(stream.executions().count(), graph.stages().len());
        assert!(stream.executions().all(|(_, j)| j == 0));
        assert_eq!(program.fences(), &[Lane::AsyncMma]);
        assert_eq!(stream.steps().last(), Some(&Step::Fence(Lane::AsyncMma)));
        assert_eq!(stream.phase_of(stream.len() - 1), Some(Phase::Exit));
        assert!(program.supports(7) && program.supports(1));
    }

    #[test]
    fn drain_drops_arrives_without_consumer() {
        let body = attention_pipeline(AttentionShape::default());
        let (graph, program) = lower(&body, 2);
        let drain = &program.main().unwrap().epilogue[0];
        let gemm1 = graph.find("gemm1").unwrap();
        let softmax = graph.find("softmax").unwrap();
        let late = program.classes().iter().find(|c| c.producer == gemm1 && c.consumer == softmax).unwrap();
        assert!(!drain
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Arrive { class, .. } if *class == late.id)));

        // ...while the steady body still arrives for the next iteration's softmax
        let steady = &program.main().unwrap().steady;
        assert!(steady
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Arrive { class, .. } if *class == late.id)));
        // and the first softmax waits on a virtual phase
        let stream = program.instantiate(4).unwrap();
        let first = stream
            .steps()
            .iter()
            .find(|s| matches!(s, Step::Wait { class, .. } if *class == late.id))
            .unwrap();
        assert!(matches!(first, Step::Wait { producer_iter: -1, parity: 1, .. }));
    }

    #[test]
    fn stream_phases() {
        let (_, program) = lower(&copy_compute(Expr::sym("n")), 2);
        let mut bindings = Bindings::new();
        bindings.insert("n".to_string(), 3);
        let stream = program.instantiate_with(&bindings).unwrap();
        assert_eq!(stream.trip_count(), 3);
        let phases: Vec<Phase> = stream.iter().map(|(p, _)| p).collect();
        assert_eq!(phases.first(), Some(&Phase::Ramp(0)));
        assert!(phases.contains(&Phase::Steady));
        assert_eq!(phases.last(), Some(&Phase::Drain(0)));
        assert_eq!(stream.executions().count(), 6);
        assert!(program.instantiate_with(&Bindings::new()).is_err());
    }
}
