use std::fmt;

use derive_more::AsRef;
use serde::{Deserialize, Serialize};

pub mod build_graph;
pub mod builder;
pub mod changes;
pub mod cygwin;
pub mod error;
pub mod graph;
pub mod hash;
pub mod interpolate;
pub mod pkg_index;
pub mod resolve;
pub mod snapshot;
pub mod snapshot_graph;
pub mod store;
pub mod stream;
pub mod tarball;
pub mod tracing;
pub mod version;

/// Name prefix of the synthetic twin that a bootstrap package builds
/// against the previous snapshot. The prefix is part of the name:
/// `bootstrap:foo` and `foo` are distinct packages.
pub const BOOTSTRAP_PREFIX: &str = "bootstrap:";

/// Name prefix of binaries that are taken from the previous snapshot
/// instead of being built in this one.
pub const PREV_PREFIX: &str = "prev:";

/// Sentinel sha256 recorded for binary packages that have not been built yet.
/// Never allowed to survive until serialization.
pub const PLACEHOLDER_SHA256: &str = "placeholder";

/// Identifies a source package by name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, AsRef)]
#[serde(transparent)]
pub struct SrcPkgId(String);

impl SrcPkgId {
    pub fn new(name: impl Into<String>) -> Self {
        SrcPkgId(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// The `bootstrap:`-prefixed synthetic twin of this source package.
    pub fn to_bootstrap(&self) -> SrcPkgId {
        SrcPkgId(format!("{BOOTSTRAP_PREFIX}{}", self.0))
    }

    pub fn is_bootstrap(&self) -> bool {
        self.0.starts_with(BOOTSTRAP_PREFIX)
    }

    /// The base name of a `bootstrap:`-prefixed twin, if this is one.
    pub fn strip_bootstrap(&self) -> Option<SrcPkgId> {
        self.0.strip_prefix(BOOTSTRAP_PREFIX).map(SrcPkgId::new)
    }
}

impl fmt::Display for SrcPkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "src:{}", self.0)
    }
}

impl From<&str> for SrcPkgId {
    fn from(value: &str) -> Self {
        SrcPkgId(value.to_string())
    }
}

/// Identifies a binary package by name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, AsRef)]
#[serde(transparent)]
pub struct BinPkgId(String);

impl BinPkgId {
    pub fn new(name: impl Into<String>) -> Self {
        BinPkgId(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn to_bootstrap(&self) -> BinPkgId {
        BinPkgId(format!("{BOOTSTRAP_PREFIX}{}", self.0))
    }

    pub fn is_bootstrap(&self) -> bool {
        self.0.starts_with(BOOTSTRAP_PREFIX)
    }

    /// The `prev:`-prefixed form referring to this binary in the previous
    /// snapshot.
    pub fn to_prev(&self) -> BinPkgId {
        BinPkgId(format!("{PREV_PREFIX}{}", self.0))
    }

    pub fn is_prev(&self) -> bool {
        self.0.starts_with(PREV_PREFIX)
    }

    pub fn strip_prev(&self) -> Option<BinPkgId> {
        self.0.strip_prefix(PREV_PREFIX).map(BinPkgId::new)
    }
}

impl fmt::Display for BinPkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bin:{}", self.0)
    }
}

impl From<&str> for BinPkgId {
    fn from(value: &str) -> Self {
        BinPkgId(value.to_string())
    }
}

/// A node in the dependency graph: either kind of package. Equality and
/// hashing include the kind, so a source and a binary package may share a
/// name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PkgId {
    Src(SrcPkgId),
    Bin(BinPkgId),
}

impl PkgId {
    pub fn name(&self) -> &str {
        match self {
            PkgId::Src(id) => id.name(),
            PkgId::Bin(id) => id.name(),
        }
    }

    pub fn is_src(&self) -> bool {
        matches!(self, PkgId::Src(_))
    }

    pub fn is_bin(&self) -> bool {
        matches!(self, PkgId::Bin(_))
    }

    pub fn as_src(&self) -> Option<&SrcPkgId> {
        match self {
            PkgId::Src(id) => Some(id),
            PkgId::Bin(_) => None,
        }
    }

    pub fn as_bin(&self) -> Option<&BinPkgId> {
        match self {
            PkgId::Bin(id) => Some(id),
            PkgId::Src(_) => None,
        }
    }
}

impl fmt::Display for PkgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkgId::Src(id) => id.fmt(f),
            PkgId::Bin(id) => id.fmt(f),
        }
    }
}

impl From<SrcPkgId> for PkgId {
    fn from(value: SrcPkgId) -> Self {
        PkgId::Src(value)
    }
}

impl From<BinPkgId> for PkgId {
    fn from(value: BinPkgId) -> Self {
        PkgId::Bin(value)
    }
}
