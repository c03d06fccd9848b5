//! The persistable snapshot record and its on-disk JSON form.
use serde::{Deserialize, Serialize};
use time::format_description;
use time::OffsetDateTime;

use crate::error::{Error, Result};
use crate::store::StoreLayout;
use crate::tarball::Compression;
use crate::{BinPkgId, SrcPkgId, PLACEHOLDER_SHA256};

pub const SCHEMA_VERSION: u32 = 0;

/// The distinguished name that loads as a fresh, empty snapshot.
pub const ROOT_SNAPSHOT: &str = "root";

/// A source package as recorded in a snapshot.
///
/// Every name in `binary_packages` also appears in the snapshot's
/// binary-package set with this source recorded as its producer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotSrcPkg {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub build_depends: Vec<String>,
    pub binary_packages: Vec<String>,
}

impl SnapshotSrcPkg {
    pub fn id(&self) -> SrcPkgId {
        SrcPkgId::new(&self.name)
    }

    pub fn build_depends_ids(&self) -> impl Iterator<Item = BinPkgId> + '_ {
        self.build_depends.iter().map(BinPkgId::new)
    }

    pub fn binary_package_ids(&self) -> impl Iterator<Item = BinPkgId> + '_ {
        self.binary_packages.iter().map(BinPkgId::new)
    }
}

/// A binary package as recorded in a snapshot. `sha256` is the hex digest
/// of the tarball in the pkg store, or [`PLACEHOLDER_SHA256`] while unbuilt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBinPkg {
    pub name: String,
    pub sha256: String,
    pub compression_method: Compression,
    pub depends: Vec<String>,
}

impl SnapshotBinPkg {
    pub fn id(&self) -> BinPkgId {
        BinPkgId::new(&self.name)
    }

    pub fn depends_ids(&self) -> impl Iterator<Item = BinPkgId> + '_ {
        self.depends.iter().map(BinPkgId::new)
    }

    pub fn is_built(&self) -> bool {
        self.sha256 != PLACEHOLDER_SHA256
    }

    /// File name of this binary in the pkg store.
    pub fn tarball_name(&self) -> String {
        format!(
            "{}-{}.tar.{}",
            self.name, self.sha256, self.compression_method
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "pkg_type", rename_all = "lowercase")]
pub enum SnapshotPkg {
    Src(SnapshotSrcPkg),
    Bin(SnapshotBinPkg),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChangeAdd {
    pub name: String,
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChangeUpdate {
    pub name: String,
    pub from: String,
    pub to: String,
}

/// The declarative difference between a snapshot and its ancestor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotChanges {
    #[serde(default)]
    pub add: Vec<ChangeAdd>,
    #[serde(default)]
    pub remove: Vec<SrcPkgId>,
    #[serde(default)]
    pub update: Vec<ChangeUpdate>,
}

impl SnapshotChanges {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }
}

/// A consistent set of source packages, the binaries they produce, and the
/// change lists that differentiate it from its ancestor. Normal and
/// bootstrap packages live in disjoint sets.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub version: u32,
    pub name: String,
    pub ancestor: Option<String>,
    pub pkgs: Vec<SnapshotPkg>,
    pub bootstrap_pkgs: Vec<SnapshotPkg>,
    pub changes: SnapshotChanges,
    pub bootstrap_changes: SnapshotChanges,
}

impl Snapshot {
    pub fn empty(name: impl Into<String>) -> Snapshot {
        Snapshot {
            version: SCHEMA_VERSION,
            name: name.into(),
            ancestor: None,
            pkgs: Vec::new(),
            bootstrap_pkgs: Vec::new(),
            changes: SnapshotChanges::default(),
            bootstrap_changes: SnapshotChanges::default(),
        }
    }
}

/// Read a snapshot record from the snapshot directory. The name `root`
/// loads as a fresh empty snapshot with no ancestor.
pub fn load_snapshot(store: &StoreLayout, name: &str) -> Result<Snapshot> {
    if name == ROOT_SNAPSHOT {
        return Ok(Snapshot::empty(ROOT_SNAPSHOT));
    }

    let path = store.snapshot_dir().join(format!("{name}.json"));
    let data = std::fs::read_to_string(&path)?;
    let snapshot: Snapshot = serde_json::from_str(&data)?;
    if snapshot.version != SCHEMA_VERSION {
        return Err(Error::CorruptedSnapshot(format!(
            "snapshot {name} has schema version {}, expected {SCHEMA_VERSION}",
            snapshot.version
        )));
    }

    Ok(snapshot)
}

/// Write a snapshot record under its name. Name collisions are fatal.
pub fn write_snapshot(store: &StoreLayout, snapshot: &Snapshot) -> Result<()> {
    std::fs::create_dir_all(store.snapshot_dir())?;
    let path = store.snapshot_dir().join(format!("{}.json", snapshot.name));
    if path.exists() {
        return Err(Error::SnapshotExists(snapshot.name.clone()));
    }

    std::fs::write(&path, serde_json::to_string_pretty(snapshot)?)?;
    Ok(())
}

/// UTC timestamp used as a snapshot name, `YYYYMMDD-HHMMSS`.
pub fn timestamp_name() -> Result<String> {
    let format = format_description::parse("[year][month][day]-[hour][minute][second]")
        .map_err(|e| Error::CorruptedSnapshot(format!("bad timestamp format: {e}")))?;
    OffsetDateTime::now_utc()
        .format(&format)
        .map_err(|e| Error::CorruptedSnapshot(format!("cannot format timestamp: {e}")))
}
