use std::fmt;
use std::ops::Range;

use super::expr::Expr;
use super::Location;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(usize);

impl BufferId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl nohash_hasher::IsEnabled for BufferId {}

/// Rotating buffers (shared memory tiles) get one physical slot per pipeline depth,
/// persistent buffers (fragments, accumulators) carry state across the whole loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Rotating,
    Persistent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Buffer {
    name: String,
    kind: BufferKind,
    extent: usize,
}

impl Buffer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn extent(&self) -> usize {
        self.extent
    }

    pub fn is_rotating(&self) -> bool {
        self.kind == BufferKind::Rotating
    }
}

/// The fixed set of buffers every stage of a loop body may name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferRegistry {
    buffers: Vec<Buffer>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        BufferRegistry { buffers: vec![] }
    }

    pub fn rotating(&mut self, name: impl Into<String>, extent: usize) -> BufferId {
        self.declare(name.into(), BufferKind::Rotating, extent)
    }

    pub fn persistent(&mut self, name: impl Into<String>, extent: usize) -> BufferId {
        self.declare(name.into(), BufferKind::Persistent, extent)
    }

    fn declare(&mut self, name: String, kind: BufferKind, extent: usize) -> BufferId {
        self.buffers.push(Buffer { name, kind, extent });
        BufferId(self.buffers.len() - 1)
    }

    pub fn get(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers.get(id.0)
    }

    pub fn lookup(&self, name: &str) -> Option<BufferId> {
        self.buffers.iter().position(|b| b.name == name).map(BufferId)
    }

    pub fn name(&self, id: BufferId) -> &str {
        self.get(id).map(|b| b.name.as_str()).unwrap_or("<unknown>")
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BufferId, &Buffer)> {
        self.buffers.iter().enumerate().map(|(i, b)| (BufferId(i), b))
    }

    /// The whole buffer; unknown ids produce an empty region that fails validation later.
    pub fn full(&self, id: BufferId) -> Region {
        let extent = self.get(id).map(|b| b.extent).unwrap_or(0);
        Region::new(id, 0..extent)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Region {
    pub buffer: BufferId,
    pub range: Range<usize>,
}

impl Region {
    pub fn new(buffer: BufferId, range: Range<usize>) -> Self {
        Region { buffer, range }
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.buffer == other.buffer
            && self.range.start < other.range.end
            && other.range.start < self.range.end
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Lane {
    Sync,
    AsyncCopy,
    AsyncMma,
}

impl Lane {
    pub fn is_async(&self) -> bool {
        !matches!(self, Lane::Sync)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Lane::Sync => "sync",
            Lane::AsyncCopy => "async_copy",
            Lane::AsyncMma => "async_mma",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageDecl {
    pub name: String,
    pub lane: Lane,
    pub reads: Vec<Region>,
    pub writes: Vec<Region>,
    pub offset: Option<i32>,
    pub after: Vec<String>,
    pub location: Location,
}

impl StageDecl {
    #[track_caller]
    pub fn new(name: impl Into<String>, lane: Lane) -> Self {
        StageDecl {
            name: name.into(),
            lane,
            reads: vec![],
            writes: vec![],
            offset: None,
            after: vec![],
            location: Location::caller(),
        }
    }

    pub fn reads(mut self, region: Region) -> Self {
        self.reads.push(region);
        self
    }

    pub fn writes(mut self, region: Region) -> Self {
        self.writes.push(region);
        self
    }

    /// Read-modify-write of the same region.
    pub fn updates(self, region: Region) -> Self {
        self.reads(region.clone()).writes(region)
    }

    pub fn offset(mut self, offset: i32) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Orders this stage after `stage` within an iteration without any buffer effect.
    pub fn after(mut self, stage: impl Into<String>) -> Self {
        self.after.push(stage.into());
        self
    }

    pub fn has_effects(&self) -> bool {
        !self.reads.is_empty() || !self.writes.is_empty()
    }
}

/// One logical iteration of a `Pipelined` loop: the ordered stage list, the buffers it
/// touches and the trip count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopBody {
    buffers: BufferRegistry,
    stages: Vec<StageDecl>,
    trip_count: Expr,
    live_out: Vec<BufferId>,
}

impl LoopBody {
    pub fn new(buffers: BufferRegistry, trip_count: impl Into<Expr>) -> Self {
        LoopBody {
            buffers,
            stages: vec![],
            trip_count: trip_count.into(),
            live_out: vec![],
        }
    }

    pub fn push(&mut self, stage: StageDecl) -> &mut Self {
        self.stages.push(stage);
        self
    }

    /// Marks a buffer as read after the loop. Persistent buffers are always live out.
    pub fn live_out(&mut self, buffer: BufferId) -> &mut Self {
        if !self.live_out.contains(&buffer) {
            self.live_out.push(buffer);
        }
        self
    }

    pub fn buffers(&self) -> &BufferRegistry {
        &self.buffers
    }

    pub fn stages(&self) -> &[StageDecl] {
        &self.stages
    }

    pub fn trip_count(&self) -> &Expr {
        &self.trip_count
    }

    pub fn live_out_buffers(&self) -> &[BufferId] {
        &self.live_out
    }
}

/// Tile sizes of the fused attention kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttentionShape {
    pub block_m: usize,
    pub block_n: usize,
    pub dim: usize,
    pub causal: bool,
}

impl Default for AttentionShape {
    fn default() -> Self {
        AttentionShape {
            block_m: 128,
            block_n: 64,
            dim: 128,
            causal: false,
        }
    }
}

/// The attention main loop split into its asynchronous and synchronous pieces:
/// K/V tile copies, the two tensor-core gemms and the online softmax.
pub fn attention_pipeline(shape: AttentionShape) -> LoopBody {
    let AttentionShape { block_m, block_n, dim, causal } = shape;
    let mut buffers = BufferRegistry::new();
    let q_shared = buffers.persistent("Q_shared", block_m * dim);
    let k_shared = buffers.rotating("K_shared", block_n * dim);
    let v_shared = buffers.rotating("V_shared", block_n * dim);
    let acc_s = buffers.persistent("acc_s", block_m * block_n);
    let acc_s_cast = buffers.persistent("acc_s_cast", block_m * block_n);
    let acc_o = buffers.persistent("acc_o", block_m * dim);
    let scores_max = buffers.persistent("scores_max", block_m);
    let scores_scale = buffers.persistent("scores_scale", block_m);
    let logsum = buffers.persistent("logsum", block_m);

    let trip = if causal {
        Expr::min(
            Expr::ceildiv("seq_len", block_n),
            Expr::ceildiv((Expr::sym("bx") + 1u64) * block_m, block_n),
        )
    } else {
        Expr::ceildiv("seq_len", block_n)
    };

    let r = |id| buffers.full(id);
    let stages = vec![
        StageDecl::new("load_k", Lane::AsyncCopy).writes(r(k_shared)),
        StageDecl::new("clear_s", Lane::Sync).writes(r(acc_s)),
        StageDecl::new("gemm0", Lane::AsyncMma)
            .reads(r(q_shared))
            .reads(r(k_shared))
            .updates(r(acc_s)),
        StageDecl::new("softmax", Lane::Sync)
            .updates(r(acc_s))
            .updates(r(scores_max))
            .writes(r(scores_scale))
            .updates(r(logsum))
            .writes(r(acc_s_cast)),
        StageDecl::new("rescale", Lane::Sync)
            .reads(r(scores_scale))
            .updates(r(acc_o)),
        StageDecl::new("load_v", Lane::AsyncCopy).writes(r(v_shared)),
        StageDecl::new("gemm1", Lane::AsyncMma)
            .reads(r(acc_s_cast))
            .reads(r(v_shared))
            .updates(r(acc_o)),
    ];

    let mut body = LoopBody::new(buffers, trip);
    for stage in stages {
        body.push(stage);
    }
    body
}
