use crate::{BinPkgId, PkgId, SrcPkgId};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while applying changes to a snapshot.
///
/// There is no local recovery anywhere: the coordinator either completes all
/// changes and persists the snapshot, or aborts and persists nothing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A persisted snapshot references an id the graph cannot resolve.
    #[error("corrupted snapshot: {0}")]
    CorruptedSnapshot(String),

    /// Attempted to add an id that is already in the snapshot. Indicates a
    /// logic bug or a double-apply of changes.
    #[error("{0} is already present in the snapshot")]
    AlreadyPresent(PkgId),

    /// After applying changes, a build-dep or runtime dep of this package
    /// is absent from the snapshot.
    #[error("unresolved dependencies for {0}")]
    UnresolvedDependencies(PkgId),

    /// After applying changes, edges into removed nodes remain.
    #[error("dependency graph has broken edges: {0}")]
    BrokenGraph(String),

    #[error("build of {src} failed: {reason}")]
    BuildFailed { src: SrcPkgId, reason: String },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("snapshot {0} already exists")]
    SnapshotExists(String),

    /// The coordinator finished but a binary still holds the placeholder
    /// sha. Programmer bug.
    #[error("not all binary packages have been built")]
    BuildIncomplete,

    /// The scheduler ran out of ready packages while the build graph was
    /// non-empty.
    #[error("cyclic dependencies between {0:?}")]
    CyclicDependencies(Vec<PkgId>),

    #[error("no config for package {name} at version {version} in package index")]
    MissingPkgConfig { name: String, version: String },

    #[error("unsupported schema version {version} in {what}")]
    UnsupportedSchema { what: String, version: String },

    #[error("package {0} not found in the cygwin release manifest at version {1}")]
    CygwinPkgNotFound(BinPkgId, String),

    #[error("invalid version string {0:?}")]
    InvalidVersion(String),

    #[error("malformed build rule: {0}")]
    Interpolation(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}
