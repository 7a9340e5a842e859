pub mod expr;
pub mod ir;

pub use expr::{Bindings, Expr, LaunchFrame};
pub use ir::{
    attention_pipeline, AttentionShape, Buffer, BufferId, BufferKind, BufferRegistry, Lane,
    LoopBody, Region, StageDecl,
};

// stages are plain descriptors over a shared buffer registry, there is no capture of
// buffer handles: every effect a stage has must be spelled out as a region read or write

/// Source position of a stage declaration, reported in diagnostics.
#[derive(PartialEq, Eq, Clone, Debug, Hash)]
pub struct Location {
    row: u32,
    col: u32,
    file: String,
}

impl Location {
    /// Position of the caller, or of its caller when that is `#[track_caller]` too.
    #[track_caller]
    pub fn caller() -> Self {
        std::panic::Location::caller().into()
    }

    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn col(&self) -> u32 {
        self.col
    }

    pub fn file(&self) -> &str {
        &self.file
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.row, self.col)
    }
}

impl<'a> From<&std::panic::Location<'a>> for Location {
    fn from(site: &std::panic::Location<'a>) -> Self {
        Location {
            row: site.line(),
            col: site.column(),
            file: site.file().to_string(),
        }
    }
}

#[test]
fn location_tracks_caller() {
    let (a, b) = (Location::caller(), Location::caller());
    assert!(a.file().ends_with("mod.rs"));
    assert_eq!(a.row(), b.row());
    assert!(b.col() > a.col());
    assert_eq!(a.to_string(), format!("{}:{}:{}", a.file(), a.row(), a.col()));

    let (decl, row) = (StageDecl::new("s", Lane::Sync), line!());
    assert_eq!(decl.location.row(), row);
    assert!(decl.location.col() > 1);
}
