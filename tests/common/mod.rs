#![allow(dead_code)]

use std::collections::HashSet;

use tile_pipeline::lang::{BufferRegistry, Expr, Lane, LoopBody, StageDecl};
use tile_pipeline::pipeline::{InstructionStream, Pipeline, Step};

/// LoadK -> Compute0 -> Compute1 with an unconsumed LoadV, both loads prefetched one
/// iteration ahead.
pub fn two_loads(trip: impl Into<Expr>) -> LoopBody {
    let mut reg = BufferRegistry::new();
    let k = reg.rotating("K", 64);
    let v = reg.rotating("V", 64);
    let x = reg.persistent("x", 16);
    let mut body = LoopBody::new(reg.clone(), trip);
    body.push(StageDecl::new("LoadK", Lane::AsyncCopy).writes(reg.full(k)).offset(-1))
        .push(StageDecl::new("Compute0", Lane::Sync).reads(reg.full(k)).writes(reg.full(x)))
        .push(StageDecl::new("Compute1", Lane::Sync).reads(reg.full(x)))
        .push(StageDecl::new("LoadV", Lane::AsyncCopy).writes(reg.full(v)).offset(-1));
    body
}

/// Every exec runs each stage once per logical iteration.
pub fn assert_complete(stream: &InstructionStream, pipeline: &Pipeline) {
    let trip = stream.trip_count() as i64;
    let mut seen = HashSet::new();
    for (stage, iteration) in stream.executions() {
        assert!((0..trip).contains(&iteration), "{} ran iteration {}", pipeline.graph().name(stage), iteration);
        assert!(seen.insert((stage, iteration)), "{}[{}] ran twice", pipeline.graph().name(stage), iteration);
    }
    assert_eq!(seen.len(), pipeline.graph().stages().len() * trip as usize);
}

/// Every wait on a real producer instance follows the arrive it pairs with.
pub fn assert_barriers_paired(stream: &InstructionStream) {
    let mut arrived = HashSet::new();
    for step in stream.steps() {
        match *step {
            Step::Arrive { class, producer_iter, .. } => {
                assert!(arrived.insert((class, producer_iter)), "{} arrived twice for {}", class, producer_iter);
                assert!(producer_iter >= 0);
            }
            // iterations before the loop wait on phases no arrive ever signals
            Step::Wait { class, producer_iter, .. } if producer_iter >= 0 => {
                assert!(
                    arrived.contains(&(class, producer_iter)),
                    "wait on {} for iteration {} before its arrive",
                    class,
                    producer_iter
                );
            }
            _ => {}
        }
    }
}

/// Conflicting accesses to the same physical slot are issued in logical order whenever the
/// later access writes or both belong to the same iteration.
pub fn assert_issue_order(stream: &InstructionStream, pipeline: &Pipeline) {
    let graph = pipeline.graph();
    let depth = graph.num_stages() as i64;
    let execs: Vec<_> = stream.executions().collect();
    for (i, &(a, ja)) in execs.iter().enumerate() {
        for &(b, jb) in execs[i + 1..].iter() {
            for (ra, wa) in graph.stage(a).accesses() {
                for (rb, wb) in graph.stage(b).accesses() {
                    if !(wa || wb) || !ra.overlaps(rb) {
                        continue;
                    }
                    let rotating = graph.buffers().get(ra.buffer).map_or(false, |buf| buf.is_rotating());
                    if rotating && ja.rem_euclid(depth) != jb.rem_euclid(depth) {
                        continue;
                    }
                    // `b` was issued after `a`: it must not be logically earlier
                    let later_a = (ja, a.index()) > (jb, b.index());
                    let checked = ja == jb || wa;
                    assert!(
                        !(later_a && checked),
                        "{}[{}] issued after {}[{}] on `{}`",
                        graph.name(b),
                        jb,
                        graph.name(a),
                        ja,
                        graph.buffers().name(ra.buffer)
                    );
                }
            }
        }
    }
}
