mod common;

use anyhow::Result;
use tile_pipeline::lang::{attention_pipeline, AttentionShape, Bindings, BufferRegistry, Expr, Lane, LoopBody, StageDecl};
use tile_pipeline::pipeline::{Phase, Pipeline, PipelineConfig, ScheduleHints, SchedulingError, Step};

use common::{assert_barriers_paired, assert_complete, assert_issue_order, two_loads};

fn build(body: &LoopBody, depth: usize) -> Pipeline {
    Pipeline::build(body, &PipelineConfig::new(depth), &ScheduleHints::new()).unwrap()
}

#[test]
fn two_loads_one_barrier() -> Result<()> {
    let body = two_loads(Expr::sym("n"));
    let pipeline = build(&body, 2);
    let graph = pipeline.graph();
    let load_k = graph.find("LoadK").unwrap();
    let compute0 = graph.find("Compute0").unwrap();

    assert_eq!(pipeline.sync_plan().classes().len(), 1);
    let class = &pipeline.sync_plan().classes()[0];
    assert_eq!((class.producer, class.consumer, class.delta), (load_k, compute0, 1));
    assert_eq!(pipeline.schedule().ramp_width(), 1);

    let main = pipeline.program().main().unwrap();
    assert_eq!(main.steady.num_execs(), 4);
    assert_eq!(main.prologue.len(), 1);
    assert_eq!(main.epilogue.len(), 1);
    assert!(pipeline.program().fences().is_empty());

    let stream = pipeline.instantiate(8)?;
    assert_eq!(stream.executions().count(), 32);
    assert_complete(&stream, &pipeline);
    assert_barriers_paired(&stream);
    assert_issue_order(&stream, &pipeline);
    let report = pipeline.verify(8)?;
    assert_eq!((report.waits, report.arrives), (8, 8));
    Ok(())
}

#[test]
fn boundary_trip_counts() -> Result<()> {
    let body = attention_pipeline(AttentionShape::default());
    for depth in 1..=4usize {
        let pipeline = build(&body, depth);
        let d = depth as u64;
        for trip in [0, 1, d - 1, d, d + 1, 200] {
            let stream = pipeline.instantiate(trip)?;
            assert_complete(&stream, &pipeline);
            assert_barriers_paired(&stream);
            assert_issue_order(&stream, &pipeline);
            let report = pipeline.verify(trip)?;
            assert_eq!(report.executions as u64, 7 * trip);
        }
    }
    Ok(())
}

#[test]
fn empty_and_single_iteration() -> Result<()> {
    let pipeline = build(&attention_pipeline(AttentionShape::default()), 2);
    assert!(pipeline.instantiate(0)?.is_empty());
    assert!(pipeline.program().variant(1).is_some());

    // one iteration collapses into a straight line with no cross-iteration barriers
    let stream = pipeline.instantiate(1)?;
    assert!(stream.executions().all(|(_, j)| j == 0));
    for step in stream.steps() {
        match *step {
            Step::Wait { class, producer_iter, .. } | Step::Arrive { class, producer_iter, .. } => {
                assert_eq!(producer_iter, 0, "{:?}", step);
                assert_eq!(pipeline.sync_plan().class(class).distance, 0, "{:?}", step);
            }
            _ => {}
        }
    }
    // acc_o is written by the mma lane and read after the loop
    assert_eq!(stream.steps().last(), Some(&Step::Fence(Lane::AsyncMma)));
    assert_eq!(stream.phase_of(stream.len() - 1), Some(Phase::Exit));
    Ok(())
}

#[test]
fn no_wait_before_the_loop_at_ramp_width() -> Result<()> {
    let body = attention_pipeline(AttentionShape::default());
    for depth in 2..=4usize {
        let pipeline = build(&body, depth);
        let ramp = pipeline.schedule().ramp_width() as u64;
        assert_eq!(pipeline.program().min_main_trip(), ramp + 1);
        for trip in 1..=ramp {
            let stream = pipeline.instantiate(trip)?;
            let early = stream.steps().iter().find(|s| matches!(s, Step::Wait { producer_iter, .. } if *producer_iter < 0));
            assert!(early.is_none(), "depth {} trip {}: {:?}", depth, trip, early);
        }
    }
    Ok(())
}

#[test]
fn causal_blocks() -> Result<()> {
    let shape = AttentionShape { causal: true, ..Default::default() };
    let body = attention_pipeline(shape);
    let pipeline = build(&body, 3);
    for bx in 0..8u64 {
        let bindings: Bindings = [("seq_len".to_string(), 1000), ("bx".to_string(), bx)].into_iter().collect();
        let stream = pipeline.program().instantiate_with(&bindings)?;
        let expected = ((bx + 1) * 128).div_ceil(64).min(1000u64.div_ceil(64));
        assert_eq!(stream.trip_count(), expected);
        assert_complete(&stream, &pipeline);
    }

    let err = pipeline.program().instantiate_with(&Bindings::new()).unwrap_err();
    assert!(matches!(err, SchedulingError::UnboundSymbol(_)));
    Ok(())
}

#[test]
fn constant_trip_count() {
    let pipeline = build(&two_loads(5u64), 2);
    assert!(pipeline.program().variants().is_empty());
    assert!(pipeline.instantiate(5).is_ok());
    assert!(pipeline.instantiate(0).is_ok());
    assert!(matches!(pipeline.instantiate(4), Err(SchedulingError::InvalidDeclaration(_))));

    let short = build(&two_loads(0u64), 2);
    assert!(short.program().main().is_none());
    assert!(short.instantiate(0).unwrap().is_empty());
}

#[test]
fn large_constant_trip_count_builds() -> Result<()> {
    let pipeline = build(&two_loads(1_000_000_000u64), 2);
    assert!(pipeline.program().variants().is_empty());
    assert!(pipeline.program().main().is_some());
    assert!(matches!(pipeline.instantiate(7), Err(SchedulingError::InvalidDeclaration(_))));

    let deep = build(&two_loads(Expr::ceildiv(1u64 << 40, 64u64)), 4);
    assert_eq!(deep.program().trip_count().as_const(), Some(1 << 34));
    assert!(deep.program().main().is_some());
    Ok(())
}

#[test]
fn idle_gap_shares_one_barrier() -> Result<()> {
    let mut reg = BufferRegistry::new();
    let r = reg.rotating("r", 16);
    let p = reg.persistent("p", 16);
    let mut body = LoopBody::new(reg.clone(), Expr::sym("n"));
    body.push(StageDecl::new("load", Lane::AsyncCopy).writes(reg.full(r)).offset(-1));
    body.push(StageDecl::new("consume", Lane::Sync).reads(reg.full(r)));
    body.push(StageDecl::new("mma", Lane::AsyncMma).writes(reg.full(p)));
    body.push(StageDecl::new("reduce", Lane::Sync).reads(reg.full(p)));

    let hints = ScheduleHints::new().order(["consume", "mma", "reduce", "load"]);
    let pipeline = Pipeline::build(&body, &PipelineConfig::new(2).with_max_barriers(1), &hints)?;
    assert_eq!(pipeline.sync_plan().num_barriers(), 1);
    assert_eq!(pipeline.sync_plan().classes().len(), 2);
    for trip in [0, 1, 2, 3, 8, 31] {
        let stream = pipeline.instantiate(trip)?;
        assert_complete(&stream, &pipeline);
        assert_barriers_paired(&stream);
        assert_issue_order(&stream, &pipeline);
        pipeline.verify(trip)?;
    }
    Ok(())
}

#[test]
fn deterministic() {
    let body = attention_pipeline(AttentionShape::default());
    let hints = ScheduleHints::new().sync("softmax", "rescale");
    let a = Pipeline::build(&body, &PipelineConfig::new(3), &hints).unwrap();
    let b = Pipeline::build(&body, &PipelineConfig::new(3), &hints).unwrap();
    assert_eq!(a.render(), b.render());
    assert_eq!(a.instantiate(11).unwrap(), b.instantiate(11).unwrap());
    assert_eq!(a.render_stream(4).unwrap(), b.render_stream(4).unwrap());
}

#[test]
fn forced_barrier_between_sync_stages() -> Result<()> {
    let body = two_loads(Expr::sym("n"));
    let hints = ScheduleHints::from_json(r#"{ "sync": [ { "producer": "Compute0", "consumer": "Compute1" } ] }"#)?;
    let pipeline = Pipeline::build(&body, &PipelineConfig::new(2), &hints)?;
    let graph = pipeline.graph();
    let forced = pipeline
        .sync_plan()
        .find(graph.find("Compute0").unwrap(), graph.find("Compute1").unwrap())
        .unwrap();
    assert!(forced.forced);
    assert_eq!(pipeline.sync_plan().classes().len(), 2);
    pipeline.verify(6)?;

    let unknown = ScheduleHints::new().sync("Compute1", "LoadV");
    let err = Pipeline::build(&body, &PipelineConfig::new(2), &unknown).unwrap_err();
    assert!(matches!(err, SchedulingError::InvalidDeclaration(_)));
    Ok(())
}

#[test]
fn error_cases() {
    let mut reg = BufferRegistry::new();
    let k = reg.rotating("k", 8);
    let out = reg.persistent("out", 8);
    let mut body = LoopBody::new(reg.clone(), Expr::sym("n"));
    body.push(StageDecl::new("load", Lane::AsyncCopy).writes(reg.full(k)));
    body.push(StageDecl::new("compute", Lane::Sync).reads(reg.full(k)).updates(reg.full(out)));

    let late_load = ScheduleHints::new().offset("load", 1).offset("compute", 0);
    let err = Pipeline::build(&body, &PipelineConfig::new(2), &late_load).unwrap_err();
    match err {
        SchedulingError::InvalidHintOrder { producer, consumer, .. } => {
            assert_eq!((producer.as_str(), consumer.as_str()), ("load", "compute"));
        }
        other => panic!("unexpected error: {}", other),
    }

    let mut cyclic = body.clone();
    cyclic.push(StageDecl::new("store", Lane::Sync).reads(reg.full(out)));
    cyclic.push(StageDecl::new("flush", Lane::Sync).updates(reg.full(out)).after("store").after("tail"));
    cyclic.push(StageDecl::new("tail", Lane::Sync).reads(reg.full(out)).after("flush"));
    let err = Pipeline::build(&cyclic, &PipelineConfig::new(2), &ScheduleHints::new()).unwrap_err();
    assert!(matches!(err, SchedulingError::CyclicDependency { .. }), "{}", err);

    let mut twice = body.clone();
    twice.push(StageDecl::new("load", Lane::AsyncCopy).writes(reg.full(k)));
    let err = Pipeline::build(&twice, &PipelineConfig::new(2), &ScheduleHints::new()).unwrap_err();
    assert!(matches!(err, SchedulingError::InvalidDeclaration(_)));

    let err = Pipeline::build(&body, &PipelineConfig::new(0), &ScheduleHints::new()).unwrap_err();
    assert!(matches!(err, SchedulingError::InvalidDeclaration(_)));

    let attention = attention_pipeline(AttentionShape::default());
    let err = Pipeline::build(&attention, &PipelineConfig::new(2).with_max_barriers(4), &ScheduleHints::new())
        .unwrap_err();
    match &err {
        SchedulingError::BarrierBudgetExceeded { budget, required, classes } => {
            assert_eq!((*budget, *required), (4, 6));
            assert!(classes.iter().any(|c| c.starts_with("load_k -> gemm0")));
        }
        other => panic!("unexpected error: {}", other),
    }
}
