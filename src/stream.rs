//! Stream configs and resolving them into snapshot changes.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::HashSet;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::snapshot::{ChangeAdd, ChangeUpdate, SnapshotChanges, SnapshotSrcPkg};
use crate::snapshot_graph::SnapshotGraph;
use crate::store::StoreLayout;
use crate::version;
use crate::SrcPkgId;

pub const STREAM_SCHEMA_VERSION: &str = "0";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct VersionedPkg {
    pub name: String,
    pub version: String,
}

/// The desired contents of a stream: source packages pinned to versions,
/// per layer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub schema_version: String,
    #[serde(default)]
    pub pkgs: Vec<VersionedPkg>,
    #[serde(default)]
    pub bootstrap_pkgs: Vec<VersionedPkg>,
}

/// Mutable stream state in the store: which snapshot currently realizes
/// the stream.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    pub latest_snapshot: String,
}

pub fn load_stream_config(pi_path: &Utf8Path, name: &str) -> Result<StreamConfig> {
    let path = pi_path.join("stream").join(format!("{name}.toml"));
    let config: StreamConfig = toml::from_str(&std::fs::read_to_string(&path)?)?;
    if config.schema_version != STREAM_SCHEMA_VERSION {
        return Err(Error::UnsupportedSchema {
            what: path.to_string(),
            version: config.schema_version,
        });
    }
    Ok(config)
}

pub fn load_stream_state(store: &StoreLayout, name: &str) -> Result<Option<StreamState>> {
    let path = store.stream_dir().join(format!("{name}.json"));
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&std::fs::read_to_string(
        &path,
    )?)?))
}

pub fn write_stream_state(store: &StoreLayout, name: &str, state: &StreamState) -> Result<()> {
    std::fs::create_dir_all(store.stream_dir())?;
    let path = store.stream_dir().join(format!("{name}.json"));
    std::fs::write(&path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}

/// Diff a stream config against a snapshot: one change bundle per layer.
pub fn resolve_changes(
    config: &StreamConfig,
    snapshot: &SnapshotGraph,
) -> (SnapshotChanges, SnapshotChanges) {
    (
        resolve_layer(&config.pkgs, snapshot.src_pkg_map()),
        resolve_layer(&config.bootstrap_pkgs, snapshot.bootstrap_src_pkg_map()),
    )
}

fn resolve_layer(
    target: &[VersionedPkg],
    current: &BTreeMap<SrcPkgId, SnapshotSrcPkg>,
) -> SnapshotChanges {
    let mut changes = SnapshotChanges::default();

    for pkg in target {
        match current.get(&SrcPkgId::new(&pkg.name)) {
            None => changes.add.push(ChangeAdd {
                name: pkg.name.clone(),
                version: pkg.version.clone(),
            }),
            Some(record) if record.version != pkg.version => {
                if version::compare(&record.version, &pkg.version) == Some(Ordering::Greater) {
                    tracing::warn!(
                        "stream downgrades {} from {} to {}",
                        pkg.name,
                        record.version,
                        pkg.version
                    );
                }
                changes.update.push(ChangeUpdate {
                    name: pkg.name.clone(),
                    from: record.version.clone(),
                    to: pkg.version.clone(),
                });
            }
            Some(_) => {}
        }
    }

    // Packages in the snapshot but absent from the stream get removed.
    // Synthetic twins never produce changes of their own.
    let targets: HashSet<&str> = target.iter().map(|pkg| pkg.name.as_str()).collect();
    for id in current.keys() {
        if !id.is_bootstrap() && !targets.contains(id.name()) {
            changes.remove.push(id.clone());
        }
    }

    changes
}
