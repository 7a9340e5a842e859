pub mod lang;
pub mod pipeline;

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

pub use lang::{attention_pipeline, AttentionShape, Expr, Lane, LoopBody, StageDecl};
pub use pipeline::{Pipeline, PipelineConfig, ScheduleHints, SchedulingError};

static TRACING: OnceCell<()> = OnceCell::new();

/// Installs a `fmt` subscriber filtered by `RUST_LOG` (default `info`). Safe to call more
/// than once, later calls are no-ops.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // another subscriber may already be installed by the host program
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}
