//! Computing which packages need to be rebuilt and driving their builds.
use std::collections::{HashSet, VecDeque};

use futures::stream::{FuturesUnordered, StreamExt};
use itertools::Itertools;

use crate::builder::{DepInstall, PackageBuilder, ScheduledBuild};
use crate::error::{Error, Result};
use crate::graph::DepGraph;
use crate::snapshot::SnapshotChanges;
use crate::snapshot_graph::SnapshotGraph;
use crate::store::{self, StoreLayout};
use crate::{BinPkgId, PkgId, SrcPkgId};

/// The subgraph of packages that must be (re)built, over the reverse of
/// the snapshot's dependency graph: an edge points from a requirement to
/// the node that needs it, so a source package is ready to build exactly
/// when its in-degree reaches zero.
pub struct BuildGraph {
    graph: DepGraph<PkgId>,
    pkgs_ready_to_build: VecDeque<SrcPkgId>,
    /// Binaries whose producing source has been built but which still have
    /// unsatisfied incoming requirements.
    built_pkgs: HashSet<BinPkgId>,
}

impl BuildGraph {
    pub fn new(graph: DepGraph<PkgId>) -> BuildGraph {
        let mut ready: Vec<SrcPkgId> = graph
            .in_degrees()
            .into_iter()
            .filter_map(|(node, degree)| match node {
                PkgId::Src(src) if degree == 0 => Some(src),
                _ => None,
            })
            .collect();
        // Hand-out order among simultaneously ready packages is
        // unspecified; sorting keeps runs comparable.
        ready.sort();

        BuildGraph {
            graph,
            pkgs_ready_to_build: ready.into(),
            built_pkgs: HashSet::new(),
        }
    }

    /// All packages have been built and cleared.
    pub fn is_empty(&self) -> bool {
        self.graph.number_of_nodes() == 0
    }

    pub fn contains(&self, node: &PkgId) -> bool {
        self.graph.has_node(node)
    }

    pub fn remaining_nodes(&self) -> Vec<PkgId> {
        self.graph.nodes().cloned().sorted().collect()
    }

    /// Pop up to `max_count` packages that are ready to build. A package is
    /// handed out at most once.
    pub fn get_pkgs_to_build(&mut self, max_count: usize) -> Vec<SrcPkgId> {
        let count = max_count.min(self.pkgs_ready_to_build.len());
        self.pkgs_ready_to_build.drain(..count).collect()
    }

    /// Mark a source package as built: its binaries become available, which
    /// may make further sources ready.
    pub fn mark_pkgs_built(&mut self, built: &SrcPkgId) {
        let node = PkgId::Src(built.clone());
        assert_eq!(
            self.graph.in_degree(&node),
            0,
            "source package {built} still has requirements and should not have been built"
        );

        let binaries: Vec<BinPkgId> = self
            .graph
            .neighbors(&node)
            .into_iter()
            .map(|neighbor| match neighbor {
                PkgId::Bin(bin) => bin,
                PkgId::Src(src) => {
                    panic!("expected all neighbors of {built} to be binary packages, found {src}")
                }
            })
            .collect();

        for bin in &binaries {
            self.graph.remove_edge(&node, &PkgId::Bin(bin.clone()));
        }
        self.graph.remove_node(&node);

        for bin in binaries {
            if self.graph.in_degree(&PkgId::Bin(bin.clone())) > 0 {
                // Other requirements remain; keep the node until they clear.
                self.built_pkgs.insert(bin);
                continue;
            }
            self.remove_binary_pkg(&bin);
        }
    }

    /// Remove a satisfied binary from the graph, unblocking its dependents.
    fn remove_binary_pkg(&mut self, bin: &BinPkgId) {
        let node = PkgId::Bin(bin.clone());
        for neighbor in self.graph.neighbors(&node) {
            self.graph.remove_edge(&node, &neighbor);
            match &neighbor {
                PkgId::Src(src) => {
                    if self.graph.in_degree(&neighbor) == 0 {
                        self.pkgs_ready_to_build.push_back(src.clone());
                    }
                }
                PkgId::Bin(dependent) => {
                    if self.built_pkgs.contains(dependent)
                        && self.graph.in_degree(&neighbor) == 0
                    {
                        self.remove_binary_pkg(&dependent.clone());
                    }
                }
            }
        }
        self.graph.remove_node(&node);
        self.built_pkgs.remove(bin);
    }
}

/// Compute the build graph for a change bundle that has already been
/// applied to the snapshot.
pub fn compute_build_graph(
    snapshot: &SnapshotGraph,
    pkg_changes: &SnapshotChanges,
    bootstrap_changes: &SnapshotChanges,
) -> BuildGraph {
    let requirement_graph = snapshot.graph().reverse();

    // Seed with every added or updated source, plus the synthetic twin of
    // each bootstrap add/update.
    let mut pkgs_to_build: HashSet<PkgId> = HashSet::new();
    let mut seed = |set: &mut HashSet<PkgId>, name: &str, bootstrap: bool| {
        let src = SrcPkgId::new(name);
        if bootstrap {
            set.insert(src.to_bootstrap().into());
        }
        set.insert(src.into());
    };
    for add in &pkg_changes.add {
        seed(&mut pkgs_to_build, &add.name, false);
    }
    for update in &pkg_changes.update {
        seed(&mut pkgs_to_build, &update.name, false);
    }
    for add in &bootstrap_changes.add {
        seed(&mut pkgs_to_build, &add.name, true);
    }
    for update in &bootstrap_changes.update {
        seed(&mut pkgs_to_build, &update.name, true);
    }

    // Everything that transitively depends on a seed is rebuilt as well.
    for node in pkgs_to_build.clone() {
        pkgs_to_build.extend(requirement_graph.descendants(&node));
    }

    // A dependent binary pulled in through a runtime dep needs its
    // producing source in the graph, or it could never be marked built.
    let producers: Vec<PkgId> = pkgs_to_build
        .iter()
        .filter_map(|node| node.as_bin())
        .filter(|bin| !bin.is_prev())
        .flat_map(|bin| {
            snapshot
                .graph()
                .neighbors(&PkgId::Bin(bin.clone()))
                .into_iter()
                .filter(|neighbor| neighbor.is_src())
        })
        .collect();
    pkgs_to_build.extend(producers);

    BuildGraph::new(requirement_graph.subgraph(pkgs_to_build.iter()))
}

/// Drive the build graph to completion with up to `parallel` builds in
/// flight. Only this coordinator touches the snapshot and the store;
/// builders receive plain data and return output directories.
pub async fn execute_build_graph<B: PackageBuilder>(
    build_graph: &mut BuildGraph,
    snapshot: &mut SnapshotGraph,
    previous: &SnapshotGraph,
    builder: &B,
    store: &StoreLayout,
    parallel: usize,
) -> Result<()> {
    let parallel = parallel.max(1);
    let mut in_flight = FuturesUnordered::new();

    loop {
        for src in build_graph.get_pkgs_to_build(parallel - in_flight.len()) {
            let schedule = make_schedule(snapshot, previous, &src, parallel)?;
            in_flight.push(async move { (src, builder.build_pkg(&schedule).await) });
        }

        if in_flight.is_empty() {
            if build_graph.is_empty() {
                return Ok(());
            }
            // No builds running and nothing ready: the graph can never
            // drain.
            return Err(Error::CyclicDependencies(build_graph.remaining_nodes()));
        }

        let Some((src, result)) = in_flight.next().await else {
            continue;
        };
        let outputs = result?;

        for (binary_name, output_dir) in outputs {
            let bin = BinPkgId::new(&binary_name);
            let sha256 = store::publish_pkg_output(store, &bin, &output_dir).await?;
            tracing::info!("built {bin} ({sha256})");
            snapshot.commit_bin_sha(&bin, &sha256)?;
        }
        build_graph.mark_pkgs_built(&src);
    }
}

/// Resolve everything a builder needs for one source package. Every
/// build-dep is installed from the pkg store; `prev:` deps resolve against
/// the snapshot the changes started from.
fn make_schedule(
    snapshot: &SnapshotGraph,
    previous: &SnapshotGraph,
    src: &SrcPkgId,
    parallel: usize,
) -> Result<ScheduledBuild> {
    let Some((record, bootstrap)) = snapshot.src_pkg(src) else {
        return Err(Error::UnresolvedDependencies(src.clone().into()));
    };

    let mut build_deps = Vec::new();
    for dep in snapshot.build_depends_closure(src, bootstrap) {
        if let Some(prev_dep) = dep.strip_prev() {
            match previous.bin_pkg(&prev_dep) {
                Some(bin) => build_deps.push(DepInstall {
                    id: dep.clone(),
                    tarball_name: bin.tarball_name(),
                }),
                // First bootstrap: there is no previous snapshot to take
                // this from, the build runs against the base environment.
                None => tracing::warn!("{dep} not in previous snapshot, building {src} without it"),
            }
            continue;
        }

        let Some(bin) = snapshot.bin_pkg(&dep) else {
            return Err(Error::UnresolvedDependencies(dep.into()));
        };
        debug_assert!(bin.is_built(), "{dep} dispatched before its sha was committed");
        build_deps.push(DepInstall {
            id: dep.clone(),
            tarball_name: bin.tarball_name(),
        });
    }

    Ok(ScheduledBuild {
        src: src.clone(),
        version: record.version.clone(),
        build_deps,
        parallel,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::snapshot::{ChangeAdd, ChangeUpdate, Snapshot};
    use crate::PLACEHOLDER_SHA256;

    /// pkg1 build-depends on pkg2-bin; pkg2-bin runtime-depends on pkg3-bin.
    fn simple_snapshot() -> SnapshotGraph {
        let snapshot: Snapshot = serde_json::from_value(serde_json::json!({
            "version": 0,
            "name": "test-snapshot",
            "ancestor": "root",
            "pkgs": [
                {"name": "pkg1", "version": "1.0", "pkg_type": "src",
                 "build_depends": ["pkg2-bin"], "binary_packages": ["pkg1-bin"]},
                {"name": "pkg1-bin", "sha256": "abc123", "pkg_type": "bin",
                 "compression_method": "xz", "depends": []},
                {"name": "pkg2", "version": "1.0", "pkg_type": "src",
                 "build_depends": [], "binary_packages": ["pkg2-bin"]},
                {"name": "pkg2-bin", "sha256": "abc123", "pkg_type": "bin",
                 "compression_method": "xz", "depends": ["pkg3-bin"]},
                {"name": "pkg3", "version": "1.0", "pkg_type": "src",
                 "build_depends": [], "binary_packages": ["pkg3-bin"]},
                {"name": "pkg3-bin", "sha256": "def456", "pkg_type": "bin",
                 "compression_method": "xz", "depends": []},
            ],
            "bootstrap_pkgs": [],
            "changes": {"add": [], "remove": [], "update": []},
            "bootstrap_changes": {"add": [], "remove": [], "update": []},
        }))
        .unwrap();
        SnapshotGraph::from_snapshot(snapshot).unwrap()
    }

    fn update_changes(name: &str) -> SnapshotChanges {
        SnapshotChanges {
            add: vec![],
            remove: vec![],
            update: vec![ChangeUpdate {
                name: name.into(),
                from: "1.0".into(),
                to: "2.0".into(),
            }],
        }
    }

    fn src(name: &str) -> SrcPkgId {
        SrcPkgId::new(name)
    }

    fn bin(name: &str) -> BinPkgId {
        BinPkgId::new(name)
    }

    #[test]
    fn update_rebuilds_dependents() {
        let snapshot = simple_snapshot();
        let graph = compute_build_graph(
            &snapshot,
            &update_changes("pkg2"),
            &SnapshotChanges::default(),
        );

        for node in [
            PkgId::from(src("pkg1")),
            src("pkg2").into(),
            bin("pkg1-bin").into(),
            bin("pkg2-bin").into(),
        ] {
            assert!(graph.contains(&node), "{node} missing from build graph");
        }
        assert!(!graph.contains(&src("pkg3").into()));
    }

    #[test]
    fn dependents_wait_for_their_requirements() {
        let snapshot = simple_snapshot();
        let mut graph = compute_build_graph(
            &snapshot,
            &update_changes("pkg2"),
            &SnapshotChanges::default(),
        );

        // Only pkg2 is ready; pkg1 waits for pkg2-bin.
        assert_eq!(graph.get_pkgs_to_build(10), vec![src("pkg2")]);
        assert_eq!(graph.get_pkgs_to_build(10), vec![]);

        graph.mark_pkgs_built(&src("pkg2"));
        assert_eq!(graph.get_pkgs_to_build(10), vec![src("pkg1")]);

        graph.mark_pkgs_built(&src("pkg1"));
        assert!(graph.is_empty());
    }

    #[test]
    fn runtime_dependents_pull_in_their_producer() {
        let snapshot = simple_snapshot();
        // Updating pkg3 drags pkg2-bin in through the runtime dep; pkg2
        // must come along as its producer or the graph could never drain.
        let mut graph = compute_build_graph(
            &snapshot,
            &update_changes("pkg3"),
            &SnapshotChanges::default(),
        );

        assert!(graph.contains(&src("pkg2").into()));

        let mut order = Vec::new();
        while !graph.is_empty() {
            let ready = graph.get_pkgs_to_build(1);
            assert_eq!(ready.len(), 1, "scheduler stalled: {:?}", graph.remaining_nodes());
            order.push(ready[0].clone());
            graph.mark_pkgs_built(&ready[0]);
        }

        // pkg1 build-depends on pkg2-bin, which waits for pkg3-bin, so
        // pkg1 always goes last.
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&src("pkg1")));
        assert!(order.contains(&src("pkg3")));
    }

    #[test]
    fn adds_seed_the_graph() {
        let snapshot = simple_snapshot();
        let changes = SnapshotChanges {
            add: vec![ChangeAdd {
                name: "pkg3".into(),
                version: "1.0".into(),
            }],
            remove: vec![],
            update: vec![],
        };
        let graph = compute_build_graph(&snapshot, &changes, &SnapshotChanges::default());
        assert!(graph.contains(&src("pkg3").into()));
        assert!(graph.contains(&bin("pkg3-bin").into()));
    }

    #[test]
    fn bootstrap_changes_seed_the_twin() {
        let mut snapshot = simple_snapshot();
        let mut deps = crate::resolve::PackageDependencies::default();
        deps.build_depends.insert(src("boot"), vec![]);
        deps.build_depends.insert(src("bootstrap:boot"), vec![]);
        deps.depends.insert(bin("boot-bin"), vec![]);
        deps.depends.insert(bin("bootstrap:boot-bin"), vec![]);
        snapshot.add_pkg("boot", "1.0", &deps, true).unwrap();

        let bootstrap_changes = SnapshotChanges {
            add: vec![ChangeAdd {
                name: "boot".into(),
                version: "1.0".into(),
            }],
            remove: vec![],
            update: vec![],
        };
        let graph =
            compute_build_graph(&snapshot, &SnapshotChanges::default(), &bootstrap_changes);

        assert!(graph.contains(&src("boot").into()));
        assert!(graph.contains(&src("bootstrap:boot").into()));
    }

    /// Writes one deterministic file per produced binary; binary names
    /// follow the `<src>-bin` fixture convention.
    struct FixtureBuilder {
        root: Utf8PathBuf,
    }

    impl PackageBuilder for FixtureBuilder {
        async fn build_pkg(
            &self,
            schedule: &ScheduledBuild,
        ) -> Result<BTreeMap<String, Utf8PathBuf>> {
            let binary_name = format!("{}-bin", schedule.src.name());
            let out = self.root.join(schedule.src.name().replace(':', "_"));
            store::clear_dir(&out)?;
            std::fs::write(
                out.join("content"),
                format!("{binary_name} {}", schedule.version),
            )?;
            Ok(BTreeMap::from([(binary_name, out)]))
        }
    }

    #[tokio::test]
    async fn execute_commits_hashes_in_dependency_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        );

        let mut snapshot = simple_snapshot();
        let previous = snapshot.clone();
        // Pretend pkg2 and pkg1 were just re-added with placeholder hashes.
        snapshot.commit_bin_sha(&bin("pkg2-bin"), PLACEHOLDER_SHA256).unwrap();
        snapshot.commit_bin_sha(&bin("pkg1-bin"), PLACEHOLDER_SHA256).unwrap();

        let mut graph = compute_build_graph(
            &snapshot,
            &update_changes("pkg2"),
            &SnapshotChanges::default(),
        );
        let builder = FixtureBuilder {
            root: store.pkg_output_dir(),
        };

        execute_build_graph(&mut graph, &mut snapshot, &previous, &builder, &store, 2)
            .await
            .unwrap();

        assert!(graph.is_empty());
        assert!(snapshot.binary_pkgs_are_complete());
        let sha256 = &snapshot.bin_pkg_map()[&bin("pkg2-bin")].sha256;
        assert!(store
            .pkg_dir()
            .join(format!("pkg2-bin-{sha256}.tar.xz"))
            .exists());
    }

    #[tokio::test]
    async fn builder_failure_aborts_execution() {
        struct FailingBuilder;
        impl PackageBuilder for FailingBuilder {
            async fn build_pkg(
                &self,
                schedule: &ScheduledBuild,
            ) -> Result<BTreeMap<String, Utf8PathBuf>> {
                Err(Error::BuildFailed {
                    src: schedule.src.clone(),
                    reason: "exit status 1".into(),
                })
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let store = StoreLayout::new(
            Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap(),
        );

        let mut snapshot = simple_snapshot();
        let previous = snapshot.clone();
        let mut graph = compute_build_graph(
            &snapshot,
            &update_changes("pkg2"),
            &SnapshotChanges::default(),
        );

        let result =
            execute_build_graph(&mut graph, &mut snapshot, &previous, &FailingBuilder, &store, 1)
                .await;
        assert!(matches!(result, Err(Error::BuildFailed { .. })));
        assert!(!graph.is_empty());
    }
}
