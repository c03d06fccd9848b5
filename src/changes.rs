//! Applying a change bundle to a snapshot end to end.
use crate::build_graph;
use crate::builder::PackageBuilder;
use crate::error::{Error, Result};
use crate::resolve::DependencyResolver;
use crate::snapshot::SnapshotChanges;
use crate::snapshot_graph::SnapshotGraph;
use crate::store::StoreLayout;

/// Apply add/remove/update changes to a snapshot: mutate the graph,
/// compute the build graph, build everything affected, and commit every
/// binary's content hash. The snapshot is ready to dump afterwards.
///
/// On error the snapshot must be considered poisoned and not persisted;
/// tarballs already published to the pkg store are content-keyed and are
/// reused on retry.
pub async fn process_changes<B: PackageBuilder>(
    snapshot: &mut SnapshotGraph,
    pkg_changes: &SnapshotChanges,
    bootstrap_changes: &SnapshotChanges,
    resolver: &DependencyResolver,
    builder: &B,
    store: &StoreLayout,
    parallel: usize,
) -> Result<()> {
    // Keep the pre-mutation state around: `prev:` build-deps of bootstrap
    // twins resolve against it.
    let previous = snapshot.clone();

    tracing::info!("applying changes to snapshot {}", snapshot.name);
    snapshot.update_with_changes(pkg_changes, bootstrap_changes, resolver)?;

    tracing::info!("computing build graph");
    let mut graph = build_graph::compute_build_graph(snapshot, pkg_changes, bootstrap_changes);

    tracing::info!("executing build graph");
    build_graph::execute_build_graph(&mut graph, snapshot, &previous, builder, store, parallel)
        .await?;

    // Every binary must have a real hash now; anything else is a bug in
    // the scheduler, not a user error.
    if !snapshot.binary_pkgs_are_complete() {
        return Err(Error::BuildIncomplete);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::builder::ScheduledBuild;
    use crate::pkg_index;
    use crate::snapshot::{ChangeAdd, SnapshotChanges};
    use crate::{BinPkgId, PkgId, SrcPkgId, BOOTSTRAP_PREFIX};

    /// Builds by reading the package config and writing one deterministic
    /// file per declared binary. Entirely offline.
    struct FixtureBuilder {
        store: StoreLayout,
        pi: Utf8PathBuf,
    }

    impl PackageBuilder for FixtureBuilder {
        async fn build_pkg(
            &self,
            schedule: &ScheduledBuild,
        ) -> crate::error::Result<BTreeMap<String, Utf8PathBuf>> {
            let twin = schedule.src.is_bootstrap();
            let base = schedule
                .src
                .strip_bootstrap()
                .unwrap_or_else(|| schedule.src.clone());
            let config =
                pkg_index::load_pkg_config(&self.pi, base.name(), &schedule.version)?;

            let mut outputs = BTreeMap::new();
            for bin in config.binary_packages() {
                let name = if twin {
                    format!("{BOOTSTRAP_PREFIX}{}", bin.name())
                } else {
                    bin.name().to_string()
                };
                let dir = self
                    .store
                    .pkg_output_dir()
                    .join(name.replace(':', "_"));
                crate::store::clear_dir(&dir)?;
                std::fs::write(dir.join("content"), format!("{name} {}", schedule.version))?;
                outputs.insert(name, dir);
            }
            Ok(outputs)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: StoreLayout,
        pi: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Fixture {
            let dir = tempfile::tempdir().unwrap();
            let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
            let store = StoreLayout::new(root.clone());
            store.ensure_dirs().unwrap();
            let pi = root.join("pi");
            std::fs::create_dir_all(&pi).unwrap();
            Fixture {
                _dir: dir,
                store,
                pi,
            }
        }

        fn write_pkg_config(&self, name: &str, version: &str, toml: &str) {
            let dir = self.pi.join("pkg").join(name).join(version);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("pkg.toml"), toml).unwrap();
        }

        fn resolver(&self) -> DependencyResolver {
            DependencyResolver::new(self.pi.clone(), self.pi.join("setup.ini"))
        }

        fn builder(&self) -> FixtureBuilder {
            FixtureBuilder {
                store: self.store.clone(),
                pi: self.pi.clone(),
            }
        }
    }

    fn custom_config(name: &str, version: &str, build_depends: &[&str], depends: &[&str]) -> String {
        let build_depends = build_depends
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let depends = depends
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            r#"
schema_version = 0
pkg_type = "custom"
name = "{name}"
version = "{version}"

[pkg]
supported_platforms = ["linux-x86_64"]
build_depends = [{build_depends}]

[input]
sha256 = "0000000000000000000000000000000000000000000000000000000000000000"
source_version = "0"

[rules]
default = ["true"]

[binaries.{name}-bin]
depends = [{depends}]
"#
        )
    }

    fn adds(pkgs: &[(&str, &str)]) -> SnapshotChanges {
        SnapshotChanges {
            add: pkgs
                .iter()
                .map(|(name, version)| ChangeAdd {
                    name: name.to_string(),
                    version: version.to_string(),
                })
                .collect(),
            remove: vec![],
            update: vec![],
        }
    }

    fn root_snapshot(store: &StoreLayout) -> SnapshotGraph {
        SnapshotGraph::load(store, "root").unwrap()
    }

    async fn process(
        fixture: &Fixture,
        snapshot: &mut SnapshotGraph,
        pkg_changes: &SnapshotChanges,
        bootstrap_changes: &SnapshotChanges,
    ) -> Result<()> {
        process_changes(
            snapshot,
            pkg_changes,
            bootstrap_changes,
            &fixture.resolver(),
            &fixture.builder(),
            &fixture.store,
            1,
        )
        .await
    }

    fn store_tarball_exists(store: &StoreLayout, snapshot: &SnapshotGraph, bin: &str) -> bool {
        let record = snapshot.bin_pkg(&BinPkgId::new(bin)).unwrap();
        store.pkg_dir().join(record.tarball_name()).exists()
    }

    #[tokio::test]
    async fn add_one_leaf_from_root() {
        let fixture = Fixture::new();
        fixture.write_pkg_config("pkg3", "1.0", &custom_config("pkg3", "1.0", &[], &[]));
        let mut snapshot = root_snapshot(&fixture.store);

        process(
            &fixture,
            &mut snapshot,
            &adds(&[("pkg3", "1.0")]),
            &SnapshotChanges::default(),
        )
        .await
        .unwrap();

        assert!(snapshot.src_pkg_map().contains_key(&SrcPkgId::new("pkg3")));
        let record = &snapshot.bin_pkg_map()[&BinPkgId::new("pkg3-bin")];
        assert!(record.is_built());
        assert!(store_tarball_exists(&fixture.store, &snapshot, "pkg3-bin"));

        let name = snapshot.dump(&fixture.store).unwrap();
        assert!(fixture
            .store
            .snapshot_dir()
            .join(format!("{name}.json"))
            .exists());
    }

    #[tokio::test]
    async fn add_with_missing_dep_fails_without_building() {
        let fixture = Fixture::new();
        fixture.write_pkg_config(
            "make",
            "4.4.1-2",
            &custom_config("make", "4.4.1-2", &["cygwin"], &[]),
        );
        let mut snapshot = root_snapshot(&fixture.store);

        let result = process(
            &fixture,
            &mut snapshot,
            &adds(&[("make", "4.4.1-2")]),
            &SnapshotChanges::default(),
        )
        .await;

        match result {
            Err(Error::UnresolvedDependencies(id)) => {
                assert_eq!(id, PkgId::Src(SrcPkgId::new("make")));
            }
            other => panic!("expected UnresolvedDependencies, got {other:?}"),
        }
        // No tarballs were produced.
        assert_eq!(
            std::fs::read_dir(fixture.store.pkg_dir()).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn add_order_does_not_matter() {
        let fixture = Fixture::new();
        fixture.write_pkg_config(
            "make",
            "4.4.1-2",
            &custom_config("make", "4.4.1-2", &["dep-bin"], &["dep-bin"]),
        );
        fixture.write_pkg_config("dep", "1.0", &custom_config("dep", "1.0", &[], &[]));
        let mut snapshot = root_snapshot(&fixture.store);

        // make is listed before its dependency.
        process(
            &fixture,
            &mut snapshot,
            &adds(&[("make", "4.4.1-2"), ("dep", "1.0")]),
            &SnapshotChanges::default(),
        )
        .await
        .unwrap();

        assert!(snapshot.binary_pkgs_are_complete());
        assert_eq!(
            snapshot.bin_pkg_map()[&BinPkgId::new("make-bin")].depends,
            vec!["dep-bin"]
        );
    }

    #[tokio::test]
    async fn reproduce_yields_identical_packages() {
        async fn build_once(fixture: &Fixture) -> SnapshotGraph {
            let mut snapshot = root_snapshot(&fixture.store);
            process(
                fixture,
                &mut snapshot,
                &adds(&[("pkg3", "1.0")]),
                &SnapshotChanges::default(),
            )
            .await
            .unwrap();
            snapshot
        }

        let fixture = Fixture::new();
        fixture.write_pkg_config("pkg3", "1.0", &custom_config("pkg3", "1.0", &[], &[]));

        let first = build_once(&fixture).await;
        let second = build_once(&fixture).await;
        assert_eq!(first.compare_pkgs_with(&second), None);
    }

    #[tokio::test]
    async fn bootstrap_add_builds_twin_first() {
        let fixture = Fixture::new();
        fixture.write_pkg_config(
            "bootstrap1",
            "1.0.0-1",
            &custom_config("bootstrap1", "1.0.0-1", &["bootstrap1-bin"], &[]),
        );
        let mut snapshot = root_snapshot(&fixture.store);

        process(
            &fixture,
            &mut snapshot,
            &SnapshotChanges::default(),
            &adds(&[("bootstrap1", "1.0.0-1")]),
        )
        .await
        .unwrap();

        let twin = SrcPkgId::new("bootstrap:bootstrap1");
        assert!(snapshot
            .bootstrap_src_pkg_map()
            .contains_key(&SrcPkgId::new("bootstrap1")));
        assert!(snapshot.bootstrap_src_pkg_map().contains_key(&twin));
        assert!(snapshot.graph().has_edge(
            &SrcPkgId::new("bootstrap1").into(),
            &BinPkgId::new("bootstrap:bootstrap1-bin").into(),
        ));
        assert!(snapshot.graph().has_edge(
            &twin.clone().into(),
            &BinPkgId::new("prev:bootstrap1-bin").into(),
        ));

        // Both the bootstrap result and the twin's result are real,
        // published binaries.
        assert!(snapshot.binary_pkgs_are_complete());
        assert!(store_tarball_exists(&fixture.store, &snapshot, "bootstrap1-bin"));
        assert!(store_tarball_exists(
            &fixture.store,
            &snapshot,
            "bootstrap:bootstrap1-bin"
        ));
    }

    #[tokio::test]
    async fn update_rebuilds_dependents_end_to_end() {
        let fixture = Fixture::new();
        fixture.write_pkg_config("pkg2", "1.0", &custom_config("pkg2", "1.0", &[], &[]));
        fixture.write_pkg_config(
            "pkg1",
            "1.0",
            &custom_config("pkg1", "1.0", &["pkg2-bin"], &[]),
        );
        let mut snapshot = root_snapshot(&fixture.store);
        process(
            &fixture,
            &mut snapshot,
            &adds(&[("pkg1", "1.0"), ("pkg2", "1.0")]),
            &SnapshotChanges::default(),
        )
        .await
        .unwrap();
        let pkg1_sha_before = snapshot.bin_pkg_map()[&BinPkgId::new("pkg1-bin")]
            .sha256
            .clone();

        fixture.write_pkg_config("pkg2", "2.0", &custom_config("pkg2", "2.0", &[], &[]));
        let update = SnapshotChanges {
            add: vec![],
            remove: vec![],
            update: vec![crate::snapshot::ChangeUpdate {
                name: "pkg2".into(),
                from: "1.0".into(),
                to: "2.0".into(),
            }],
        };
        process(&fixture, &mut snapshot, &update, &SnapshotChanges::default())
            .await
            .unwrap();

        assert_eq!(
            snapshot.src_pkg_map()[&SrcPkgId::new("pkg2")].version,
            "2.0"
        );
        // pkg1 was rebuilt; its fixture content is version-independent, so
        // the hash stays stable, but it must be a real hash.
        let pkg1 = &snapshot.bin_pkg_map()[&BinPkgId::new("pkg1-bin")];
        assert!(pkg1.is_built());
        assert_eq!(pkg1.sha256, pkg1_sha_before);
        // pkg2's new binary is different content.
        assert!(store_tarball_exists(&fixture.store, &snapshot, "pkg2-bin"));
    }

    #[tokio::test]
    async fn remove_with_dependents_is_a_broken_graph() {
        let fixture = Fixture::new();
        fixture.write_pkg_config("pkg2", "1.0", &custom_config("pkg2", "1.0", &[], &[]));
        fixture.write_pkg_config(
            "pkg1",
            "1.0",
            &custom_config("pkg1", "1.0", &["pkg2-bin"], &[]),
        );
        let mut snapshot = root_snapshot(&fixture.store);
        process(
            &fixture,
            &mut snapshot,
            &adds(&[("pkg1", "1.0"), ("pkg2", "1.0")]),
            &SnapshotChanges::default(),
        )
        .await
        .unwrap();

        let remove = SnapshotChanges {
            add: vec![],
            remove: vec![SrcPkgId::new("pkg2")],
            update: vec![],
        };
        let result = process(&fixture, &mut snapshot, &remove, &SnapshotChanges::default()).await;
        assert!(matches!(result, Err(Error::BrokenGraph(_))));
    }
}
