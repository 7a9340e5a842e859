//! Random stage sequences: whatever the planner accepts must replay correctly.

mod common;

use proptest::prelude::*;
use tile_pipeline::lang::{BufferRegistry, Expr, Lane, LoopBody, Region, StageDecl};
use tile_pipeline::pipeline::{Pipeline, PipelineConfig, ScheduleHints};

use common::{assert_barriers_paired, assert_complete, assert_issue_order};

const BUFFERS: usize = 5;

#[derive(Clone, Debug)]
struct StageShape {
    lane: Lane,
    reads: Vec<usize>,
    writes: Vec<usize>,
}

fn arb_lane() -> impl Strategy<Value = Lane> {
    prop_oneof![Just(Lane::Sync), Just(Lane::AsyncCopy), Just(Lane::AsyncMma)]
}

fn arb_stage() -> impl Strategy<Value = StageShape> {
    (
        arb_lane(),
        prop::collection::vec(0..BUFFERS, 0..3),
        prop::collection::vec(0..BUFFERS, 0..3),
    )
        .prop_map(|(lane, reads, writes)| StageShape { lane, reads, writes })
}

/// Buffers 0..3 rotate, the rest persist. Buffer 1 is split in halves so that some
/// stages touch disjoint regions.
fn lower(stages: &[StageShape]) -> LoopBody {
    let mut reg = BufferRegistry::new();
    let ids: Vec<_> = (0..BUFFERS)
        .map(|i| {
            if i < 3 {
                reg.rotating(format!("r{}", i), 32)
            } else {
                reg.persistent(format!("p{}", i), 32)
            }
        })
        .collect();
    let region = |i: usize, stage: usize| {
        if i == 1 {
            let half = stage % 2 * 16;
            Region::new(ids[i], half..half + 16)
        } else {
            reg.full(ids[i])
        }
    };
    let mut body = LoopBody::new(reg.clone(), Expr::sym("n"));
    for (s, shape) in stages.iter().enumerate() {
        let mut decl = StageDecl::new(format!("s{}", s), shape.lane);
        for r in shape.reads.iter() {
            decl = decl.reads(region(*r, s));
        }
        for w in shape.writes.iter() {
            decl = decl.writes(region(*w, s));
        }
        body.push(decl);
    }
    body
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_bodies_replay(
        stages in prop::collection::vec(arb_stage(), 1..7),
        depth in 1usize..5,
    ) {
        let body = lower(&stages);
        let config = PipelineConfig::new(depth).with_max_barriers(1024);
        let pipeline = Pipeline::build(&body, &config, &ScheduleHints::new())
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        let ramp = pipeline.schedule().ramp_width() as u64;
        for trip in [0, 1, depth as u64, ramp + 1, 2 * ramp + 5] {
            let stream = pipeline.instantiate(trip).map_err(|e| TestCaseError::fail(e.to_string()))?;
            assert_complete(&stream, &pipeline);
            assert_barriers_paired(&stream);
            assert_issue_order(&stream, &pipeline);
            let report = pipeline.verify(trip).map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(report.executions as u64, stages.len() as u64 * trip);
        }
    }

    #[test]
    fn schedules_are_deterministic(
        stages in prop::collection::vec(arb_stage(), 1..6),
        depth in 1usize..4,
    ) {
        let body = lower(&stages);
        let config = PipelineConfig::new(depth).with_max_barriers(1024);
        let a = Pipeline::build(&body, &config, &ScheduleHints::new());
        let b = Pipeline::build(&body, &config, &ScheduleHints::new());
        match (a, b) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(a.render(), b.render());
                prop_assert_eq!(a.instantiate(7).ok(), b.instantiate(7).ok());
            }
            (Err(a), Err(b)) => prop_assert_eq!(a, b),
            _ => prop_assert!(false, "builds disagree"),
        }
    }
}
