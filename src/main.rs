use anyhow::{Context, Result};
use tracing::info;

use tile_pipeline::lang::{Bindings, Expr, LaunchFrame};
use tile_pipeline::pipeline::printer;
use tile_pipeline::{attention_pipeline, init_tracing, AttentionShape, Pipeline, PipelineConfig, ScheduleHints};

fn main() -> Result<()> {
    init_tracing();

    let seq_len = 256u64;
    let shape = AttentionShape::default();
    let config = PipelineConfig::new(2);

    let body = attention_pipeline(shape);
    let pipeline = Pipeline::build(&body, &config, &ScheduleHints::new()).context("attention")?;
    println!("{}\n", pipeline.render());

    let causal = attention_pipeline(AttentionShape { causal: true, ..shape });
    let pipeline = Pipeline::build(&causal, &config, &ScheduleHints::new()).context("causal attention")?;
    println!("{}\n", pipeline.render());

    let frame = LaunchFrame::new(
        vec![Expr::ceildiv(seq_len, shape.block_m as u64)],
        &[128, 1, 1],
    )?;
    let mut params = Bindings::new();
    params.insert("seq_len".to_string(), seq_len);
    for block in frame.blocks(&params)? {
        let trip = causal.trip_count().eval(&block)?;
        let report = pipeline.verify(trip)?;
        info!(bx = block["bx"], trip, executions = report.executions, waits = report.waits, "block verified");
    }

    let first = frame.blocks(&params)?.remove(0);
    let stream = pipeline.program().instantiate_with(&first)?;
    println!("{}", printer::render_stream(&stream, pipeline.graph()));
    Ok(())
}
